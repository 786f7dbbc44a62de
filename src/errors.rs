//! Typed error hierarchy for flagforge.
//!
//! One enum per layer:
//! - `ToolFailure` / `ToolErrorKind`: what tools return and how the invoker reports it
//! - `OracleError`: reasoning oracle and rate-limited client failures
//! - `StateError`: rejected `RunState` mutations
//! - `StageError`: stage-local failures that end a run as `failed`
//! - `RegistryError`: run management calls (submit/get/stop/delete)

use std::fmt;
use std::time::Duration;

use flagforge_common::{RunId, RunStatus, Stage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized error reported by the tool invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolErrorKind {
    Timeout,
    NotFound,
    ExecutionError,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NotFound => "not-found",
            Self::ExecutionError => "execution-error",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a tool implementation. Timeouts are never produced
/// here; the invoker owns the clock.
#[derive(Debug, Clone, Error)]
pub enum ToolFailure {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Execution { message: String, retryable: bool },
}

impl ToolFailure {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::NotFound(_) => ToolErrorKind::NotFound,
            Self::Execution { .. } => ToolErrorKind::ExecutionError,
        }
    }
}

/// Errors from the reasoning oracle and the rate-limited client around it.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("rate limited: {message}")]
    Quota {
        message: String,
        /// Server-suggested delay, when the response carried one
        retry_after: Option<Duration>,
    },

    #[error("quota exhausted after {attempts} attempts")]
    QuotaExhausted { attempts: u32 },

    #[error("malformed oracle response: {0}")]
    Malformed(String),

    #[error("oracle transport error: {0}")]
    Transport(String),
}

impl OracleError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota { .. })
    }

    /// Malformed responses and transport failures get immediate retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Transport(_))
    }
}

/// A mutation rejected by `RunState`.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("run is already {status}; no further mutation allowed")]
    Terminal { status: RunStatus },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("run state lock poisoned")]
    LockPoisoned,
}

/// Stage-local failure. The engine turns every one of these into a `failed` run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("{stage} stage: all {calls} tool calls failed, last error: {last_error}")]
    ToolsUnavailable {
        stage: Stage,
        calls: u32,
        last_error: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from run management operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Run {id} not found")]
    NotFound { id: RunId },

    #[error("Run {id} is already {status}")]
    AlreadyTerminal { id: RunId, status: RunStatus },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Run registry lock poisoned")]
    LockPoisoned,
}

impl From<StateError> for RegistryError {
    fn from(_: StateError) -> Self {
        Self::LockPoisoned
    }
}
