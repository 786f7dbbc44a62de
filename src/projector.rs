use flagforge_common::{RunSnapshot, RunSummary};

use crate::run::RunState;

pub const DEFAULT_LOG_TAIL: usize = 100;

/// Builds the read-only views a polling client sees.
///
/// A snapshot carries the last `log_tail` log entries but every
/// vulnerability, flag and fuzz task, plus derived stats. Projection happens
/// under the run's read lock, so each snapshot is internally consistent.
#[derive(Debug, Clone, Copy)]
pub struct StatusProjector {
    log_tail: usize,
}

impl Default for StatusProjector {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_TAIL)
    }
}

impl StatusProjector {
    pub fn new(log_tail: usize) -> Self {
        Self { log_tail }
    }

    pub fn log_tail(&self) -> usize {
        self.log_tail
    }

    pub fn project(&self, state: &RunState) -> RunSnapshot {
        let logs = state.logs();
        let skip = logs.len().saturating_sub(self.log_tail);
        RunSnapshot {
            run_id: state.id(),
            input: state.input().clone(),
            status: state.status(),
            current_stage: state.current_stage(),
            progress: state.progress(),
            logs: logs[skip..].to_vec(),
            log_count: logs.len(),
            pages: state.pages().to_vec(),
            forms: state.forms().to_vec(),
            findings: state.findings().to_vec(),
            vulnerabilities: state.vulnerabilities().to_vec(),
            fuzz_queue: state.fuzz_queue().to_vec(),
            flags: state.flags().to_vec(),
            stats: state.stats(),
            created_at: state.created_at(),
            updated_at: state.updated_at(),
            finished_at: state.finished_at(),
        }
    }

    pub fn summarize(&self, state: &RunState) -> RunSummary {
        RunSummary {
            run_id: state.id(),
            name: state.input().display_name().to_string(),
            target_url: state.input().target_url.clone(),
            status: state.status(),
            current_stage: state.current_stage(),
            progress: state.progress(),
            flags_found: state.flags().len(),
            created_at: state.created_at(),
        }
    }
}
