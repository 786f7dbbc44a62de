use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};

use super::{Tool, ToolDescriptor, ToolRegistry};
use crate::errors::{ToolErrorKind, ToolFailure};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    /// Used when neither the caller nor the tool descriptor sets a timeout
    pub default_timeout: Duration,
    /// Outputs longer than this are cut at a char boundary
    pub max_output_bytes: usize,
    /// Applied to timeouts and retryable execution errors only
    pub retry: RetryPolicy,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_output_bytes: 16 * 1024,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: 0.2,
                max_total_wait: Some(Duration::from_secs(10)),
            },
        }
    }
}

/// Result of one `invoke` call. `error` is `None` on success; on failure
/// `output` holds the error text.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: String,
    pub output: String,
    pub error: Option<ToolErrorKind>,
    pub attempts: u32,
    pub duration: Duration,
    pub truncated: bool,
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// One-line description for findings and logs.
    pub fn describe(&self) -> String {
        match self.error {
            None => format!("{} ok ({} ms)", self.tool, self.duration.as_millis()),
            Some(kind) => format!("{} {}: {}", self.tool, kind, first_line(&self.output)),
        }
    }
}

enum AttemptError {
    Timeout(Duration),
    Failed(ToolFailure),
    Panicked,
}

impl AttemptError {
    fn retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Failed(ToolFailure::Execution { retryable, .. }) => *retryable,
            Self::Failed(ToolFailure::NotFound(_)) | Self::Panicked => false,
        }
    }

    fn kind(&self) -> ToolErrorKind {
        match self {
            Self::Timeout(_) => ToolErrorKind::Timeout,
            Self::Failed(f) => f.kind(),
            Self::Panicked => ToolErrorKind::ExecutionError,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "timeout after {:.1}s", d.as_secs_f64()),
            Self::Failed(e) => write!(f, "{}", e),
            Self::Panicked => f.write_str("tool failed unexpectedly"),
        }
    }
}

/// Uniform front for every tool call.
///
/// Enforces the timeout itself: a call that overruns is dropped, and tools
/// that own a child process spawn it with `kill_on_drop`, so the process dies
/// with the future. Unknown tool names come back as `not-found` immediately.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    settings: InvokerSettings,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, settings: InvokerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Timeout precedence: explicit argument, then tool descriptor, then default.
    pub async fn invoke(&self, name: &str, args: &Value, timeout: Option<Duration>) -> ToolOutcome {
        let started = Instant::now();

        let Some(tool) = self.registry.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return ToolOutcome {
                tool: name.to_string(),
                output: format!("tool '{}' is not registered", name),
                error: Some(ToolErrorKind::NotFound),
                attempts: 0,
                duration: started.elapsed(),
                truncated: false,
            };
        };

        let limit = timeout
            .or(tool.descriptor().timeout)
            .unwrap_or(self.settings.default_timeout);

        let mut attempts_made = 0;
        let result = self
            .settings
            .retry
            .run(
                name,
                |n| {
                    attempts_made = n;
                    attempt(Arc::clone(&tool), args, limit)
                },
                AttemptError::retryable,
            )
            .await;

        let (raw, error, attempts) = match result {
            Ok(output) => (output, None, attempts_made),
            Err(failure) => (
                failure.error.to_string(),
                Some(failure.error.kind()),
                failure.attempts,
            ),
        };
        let (output, truncated) = truncate_output(&raw, self.settings.max_output_bytes);
        let duration = started.elapsed();

        info!(
            tool = name,
            error = error.map(|k| k.as_str()).unwrap_or("none"),
            attempts,
            duration_ms = duration.as_millis() as u64,
            bytes = raw.len(),
            "tool invoked"
        );

        ToolOutcome {
            tool: name.to_string(),
            output,
            error,
            attempts,
            duration,
            truncated,
        }
    }
}

async fn attempt(tool: Arc<dyn Tool>, args: &Value, limit: Duration) -> Result<String, AttemptError> {
    let call = AssertUnwindSafe(tool.call(args)).catch_unwind();
    match tokio::time::timeout(limit, call).await {
        Err(_) => Err(AttemptError::Timeout(limit)),
        Ok(Err(_)) => Err(AttemptError::Panicked),
        Ok(Ok(Err(failure))) => Err(AttemptError::Failed(failure)),
        Ok(Ok(Ok(output))) => Ok(output),
    }
}

/// Cut `text` to at most `max_bytes` (plus a marker line) on a char boundary.
/// Returns the text and whether it was cut.
pub fn truncate_output(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let omitted = text.len() - end;
    (
        format!("{}\n... [truncated {} bytes]", &text[..end], omitted),
        true,
    )
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        descriptor: ToolDescriptor,
        calls: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Ok(String),
        Hang,
        FailTransientThenOk(u32),
        Missing,
        Panic,
    }

    impl Scripted {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ToolDescriptor::new(name, "test tool", json!({})),
                calls: AtomicU32::new(0),
                behavior,
            })
        }
    }

    #[async_trait]
    impl Tool for Scripted {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn call(&self, _args: &Value) -> Result<String, ToolFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match &self.behavior {
                Behavior::Ok(s) => Ok(s.clone()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                Behavior::FailTransientThenOk(k) if n <= *k => {
                    Err(ToolFailure::transient("connection reset"))
                }
                Behavior::FailTransientThenOk(_) => Ok("recovered".into()),
                Behavior::Missing => Err(ToolFailure::NotFound("ffuf is not installed".into())),
                Behavior::Panic => panic!("boom"),
            }
        }
    }

    fn settings(max_attempts: u32) -> InvokerSettings {
        InvokerSettings {
            default_timeout: Duration::from_millis(50),
            max_output_bytes: 32,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: 0.0,
                max_total_wait: None,
            },
        }
    }

    fn invoker(tools: Vec<Arc<dyn Tool>>, max_attempts: u32) -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        ToolInvoker::new(Arc::new(registry), settings(max_attempts))
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found_without_waiting() {
        let invoker = invoker(vec![], 3);
        let started = Instant::now();
        let outcome = invoker.invoke("nope", &json!({}), Some(Duration::from_secs(5))).await;
        assert_eq!(outcome.error, Some(ToolErrorKind::NotFound));
        assert_eq!(outcome.attempts, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_hanging_tool_times_out_and_is_retried() {
        let tool = Scripted::new("hang", Behavior::Hang);
        let invoker = invoker(vec![tool.clone() as Arc<dyn Tool>], 2);
        let started = Instant::now();
        let outcome = invoker.invoke("hang", &json!({}), None).await;
        assert_eq!(outcome.error, Some(ToolErrorKind::Timeout));
        assert!(outcome.output.contains("timeout"));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_explicit_timeout_overrides_default() {
        let tool = Scripted::new("hang", Behavior::Hang);
        let invoker = invoker(vec![tool as Arc<dyn Tool>], 1);
        let outcome = invoker
            .invoke("hang", &json!({}), Some(Duration::from_millis(10)))
            .await;
        assert!(outcome.output.contains("0.0s"));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let tool = Scripted::new("flaky", Behavior::FailTransientThenOk(1));
        let invoker = invoker(vec![tool.clone() as Arc<dyn Tool>], 3);
        let outcome = invoker.invoke("flaky", &json!({}), None).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.output, "recovered");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_dependency_not_retried() {
        let tool = Scripted::new("ffuf", Behavior::Missing);
        let invoker = invoker(vec![tool.clone() as Arc<dyn Tool>], 3);
        let outcome = invoker.invoke("ffuf", &json!({}), None).await;
        assert_eq!(outcome.error, Some(ToolErrorKind::NotFound));
        assert!(outcome.output.contains("not installed"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_execution_error() {
        let tool = Scripted::new("bad", Behavior::Panic);
        let invoker = invoker(vec![tool as Arc<dyn Tool>], 3);
        let outcome = invoker.invoke("bad", &json!({}), None).await;
        assert_eq!(outcome.error, Some(ToolErrorKind::ExecutionError));
        assert!(!outcome.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_long_output_truncated() {
        let tool = Scripted::new("big", Behavior::Ok("x".repeat(100)));
        let invoker = invoker(vec![tool as Arc<dyn Tool>], 1);
        let outcome = invoker.invoke("big", &json!({}), None).await;
        assert!(outcome.truncated);
        assert!(outcome.output.starts_with(&"x".repeat(32)));
        assert!(outcome.output.contains("[truncated 68 bytes]"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ééééé"; // 2 bytes each
        let (out, cut) = truncate_output(text, 3);
        assert!(cut);
        assert!(out.starts_with("é\n"));
        let (out, cut) = truncate_output("short", 10);
        assert!(!cut);
        assert_eq!(out, "short");
    }

    #[test]
    fn test_outcome_describe() {
        let outcome = ToolOutcome {
            tool: "fetch_page".into(),
            output: "timeout after 2.0s\nmore".into(),
            error: Some(ToolErrorKind::Timeout),
            attempts: 2,
            duration: Duration::from_secs(4),
            truncated: false,
        };
        assert_eq!(outcome.describe(), "fetch_page timeout: timeout after 2.0s");
    }
}
