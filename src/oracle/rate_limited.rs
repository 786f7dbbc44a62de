use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{Decision, Oracle, OracleRequest};
use crate::errors::OracleError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Backoff applied to quota signals
    pub quota: RetryPolicy,
    /// Immediate retries for malformed responses and transport errors
    pub transient: RetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            quota: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: 0.25,
                max_total_wait: Some(Duration::from_secs(300)),
            },
            transient: RetryPolicy::immediate(3),
        }
    }
}

/// Quota-aware wrapper around an [`Oracle`].
///
/// Two nested loops share one [`RetryPolicy`] type: the outer one backs off
/// on quota signals (honouring a server hint when larger), the inner one
/// retries malformed or transport failures immediately. A quota signal never
/// consumes inner retries. When the outer budget runs out the call fails with
/// [`OracleError::QuotaExhausted`].
#[derive(Clone)]
pub struct RateLimitedClient {
    oracle: Arc<dyn Oracle>,
    settings: ClientSettings,
}

impl RateLimitedClient {
    pub fn new(oracle: Arc<dyn Oracle>, settings: ClientSettings) -> Self {
        Self { oracle, settings }
    }

    pub async fn ask(&self, request: &OracleRequest) -> Result<Decision, OracleError> {
        let result = self
            .settings
            .quota
            .run_with_hint(
                "oracle",
                |_| self.ask_once(request),
                OracleError::is_quota,
                |e| match e {
                    OracleError::Quota { retry_after, .. } => *retry_after,
                    _ => None,
                },
            )
            .await;

        match result {
            Ok(decision) => Ok(decision),
            Err(failure) if failure.error.is_quota() => {
                warn!(stage = %request.stage, attempts = failure.attempts, "oracle quota exhausted");
                Err(OracleError::QuotaExhausted {
                    attempts: failure.attempts,
                })
            }
            Err(failure) => Err(failure.error),
        }
    }

    async fn ask_once(&self, request: &OracleRequest) -> Result<Decision, OracleError> {
        self.settings
            .transient
            .run(
                "oracle-transient",
                |_| self.oracle.decide(request),
                OracleError::is_transient,
            )
            .await
            .map_err(|failure| failure.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StageReport;
    use async_trait::async_trait;
    use flagforge_common::Stage;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays a script of results, then succeeds forever.
    struct Scripted {
        script: Mutex<Vec<OracleError>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(mut errors: Vec<OracleError>) -> Arc<Self> {
            errors.reverse();
            Arc::new(Self {
                script: Mutex::new(errors),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Oracle for Scripted {
        async fn decide(&self, _request: &OracleRequest) -> Result<Decision, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok(Decision::StageComplete(StageReport::default())),
            }
        }
    }

    struct AlwaysQuota(AtomicU32);

    #[async_trait]
    impl Oracle for AlwaysQuota {
        async fn decide(&self, _request: &OracleRequest) -> Result<Decision, OracleError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(quota())
        }
    }

    fn quota() -> OracleError {
        OracleError::Quota {
            message: "429 Too Many Requests".into(),
            retry_after: None,
        }
    }

    fn settings(max_attempts: u32, transient: u32) -> ClientSettings {
        ClientSettings {
            quota: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: 0.5,
                max_total_wait: Some(Duration::from_secs(5)),
            },
            transient: RetryPolicy::immediate(transient),
        }
    }

    fn request() -> OracleRequest {
        OracleRequest {
            stage: Stage::Summarize,
            instructions: String::new(),
            state_summary: String::new(),
            tools: vec![],
            history: vec![],
        }
    }

    #[tokio::test]
    async fn test_quota_k_times_then_success() {
        let oracle = Scripted::new(vec![quota(), quota(), quota()]);
        let client = RateLimitedClient::new(oracle.clone(), settings(5, 3));
        let decision = client.ask(&request()).await.unwrap();
        assert!(matches!(decision, Decision::StageComplete(_)));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_always_quota_fails_after_exact_attempts() {
        let oracle = Arc::new(AlwaysQuota(AtomicU32::new(0)));
        let client = RateLimitedClient::new(oracle.clone(), settings(4, 3));
        let err = client.ask(&request()).await.unwrap_err();
        match err {
            OracleError::QuotaExhausted { attempts } => assert_eq!(attempts, 4),
            other => panic!("Expected QuotaExhausted, got {other:?}"),
        }
        // quota signals never consume the immediate retries
        assert_eq!(oracle.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_malformed_retried_immediately_then_escalates() {
        let oracle = Scripted::new(vec![
            OracleError::Malformed("a".into()),
            OracleError::Malformed("b".into()),
            OracleError::Malformed("c".into()),
        ]);
        let client = RateLimitedClient::new(oracle.clone(), settings(5, 3));
        let err = client.ask(&request()).await.unwrap_err();
        assert!(matches!(err, OracleError::Malformed(ref m) if m == "c"));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transport_error_then_success() {
        let oracle = Scripted::new(vec![OracleError::Transport("reset".into())]);
        let client = RateLimitedClient::new(oracle.clone(), settings(5, 3));
        assert!(client.ask(&request()).await.is_ok());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mixed_quota_and_transient() {
        let oracle = Scripted::new(vec![
            OracleError::Transport("reset".into()),
            quota(),
            OracleError::Malformed("half a json".into()),
        ]);
        let client = RateLimitedClient::new(oracle.clone(), settings(3, 2));
        assert!(client.ask(&request()).await.is_ok());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_after_hint_is_honoured() {
        let oracle = Scripted::new(vec![OracleError::Quota {
            message: "slow down".into(),
            retry_after: Some(Duration::from_millis(30)),
        }]);
        let mut s = settings(3, 1);
        s.quota.max_delay = Duration::from_millis(100);
        let client = RateLimitedClient::new(oracle, s);
        let started = std::time::Instant::now();
        client.ask(&request()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
