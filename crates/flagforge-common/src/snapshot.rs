use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunId;
use crate::records::{Finding, Flag, FormDescriptor, FuzzTask, LogEntry, RunInput, Vulnerability};
use crate::status::{RunStatus, Stage, Severity};

/// Counters derived from a run's sequences. Always recomputed, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub pages_crawled: usize,
    pub forms_found: usize,
    pub vulnerabilities_found: usize,
    pub exploits_attempted: usize,
    pub flags_found: usize,
}

/// Point-in-time, read-only view of a run for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub input: RunInput,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub progress: u8,
    /// Most recent log entries, oldest first
    pub logs: Vec<LogEntry>,
    /// Total number of log entries, including those not in `logs`
    pub log_count: usize,
    pub pages: Vec<String>,
    pub forms: Vec<FormDescriptor>,
    pub findings: Vec<Finding>,
    pub vulnerabilities: Vec<Vulnerability>,
    pub fuzz_queue: Vec<FuzzTask>,
    pub flags: Vec<Flag>,
    pub stats: RunStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    /// Polling clients stop once this returns true.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.vulnerabilities.iter().map(|v| v.severity).max()
    }
}

/// One row of the run listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub name: String,
    pub target_url: String,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub progress: u8,
    pub flags_found: usize,
    pub created_at: DateTime<Utc>,
}
