//! Tool palette available to the oracle.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `registry` | `ToolRegistry`, explicit name → tool mapping |
//! | `invoker` | `ToolInvoker`: timeout, retry, error normalization, truncation |
//! | `http` | `fetch_page` |
//! | `command` | external programs (`run_ffuf`, `run_sqlmap`, configured commands) |
//! | `files` | `read_local_file` |

pub mod command;
pub mod files;
pub mod http;
pub mod invoker;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::ToolsConfig;
use crate::errors::ToolFailure;

pub use command::{CommandSpec, CommandTool};
pub use files::ReadLocalFileTool;
pub use http::{FetchPageTool, FetchedPage};
pub use invoker::{InvokerSettings, ToolInvoker, ToolOutcome, truncate_output};
pub use registry::ToolRegistry;

/// Capability descriptor the oracle sees: name, purpose, JSON argument schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Per-tool timeout overriding the invoker default
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A single external capability.
///
/// Implementations report missing dependencies as [`ToolFailure::NotFound`]
/// and everything else as [`ToolFailure::Execution`]. They do not need to
/// enforce timeouts; the invoker does.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn call(&self, args: &Value) -> Result<String, ToolFailure>;
}

/// Read a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolFailure::execution(format!("missing required argument '{}'", key)))
}

/// Registry with the built-in tools plus any configured commands.
pub fn default_registry(config: &ToolsConfig) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FetchPageTool::new(Duration::from_secs(
        config.default_timeout_secs,
    ))?));
    registry.register(Arc::new(ReadLocalFileTool::new(&config.files_dir)));
    for spec in CommandSpec::builtins() {
        registry.register(Arc::new(CommandTool::new(spec)));
    }
    for spec in &config.commands {
        registry.register(Arc::new(CommandTool::new(spec.clone())));
    }
    Ok(registry)
}
