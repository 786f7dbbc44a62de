use std::collections::HashSet;

use chrono::{DateTime, Utc};
use flagforge_common::{
    Finding, Flag, FormDescriptor, FuzzTask, FuzzTaskStatus, LogEntry, RunId, RunInput, RunStats,
    RunStatus, Stage, Vulnerability,
};
use url::Url;

use crate::errors::StateError;

/// Mutable record of one run.
///
/// Every mutator checks the run is still live and returns
/// [`StateError::Terminal`] otherwise, so once a terminal status is set the
/// status, progress and every accumulator are frozen. The single exception is
/// [`RunState::append_log`], which stays open for shutdown bookkeeping.
/// Accumulators only grow; there is no removal API.
#[derive(Debug, Clone)]
pub struct RunState {
    id: RunId,
    input: RunInput,
    status: RunStatus,
    current_stage: Stage,
    progress: u8,
    pages: Vec<String>,
    page_keys: HashSet<String>,
    forms: Vec<FormDescriptor>,
    findings: Vec<Finding>,
    vulnerabilities: Vec<Vulnerability>,
    fuzz_queue: Vec<FuzzTask>,
    flags: Vec<Flag>,
    logs: Vec<LogEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(id: RunId, input: RunInput) -> Self {
        let now = Utc::now();
        Self {
            id,
            input,
            status: RunStatus::Pending,
            current_stage: Stage::Crawl,
            progress: 0,
            pages: Vec::new(),
            page_keys: HashSet::new(),
            forms: Vec::new(),
            findings: Vec::new(),
            vulnerabilities: Vec::new(),
            fuzz_queue: Vec::new(),
            flags: Vec::new(),
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn input(&self) -> &RunInput {
        &self.input
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    pub fn forms(&self) -> &[FormDescriptor] {
        &self.forms
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn vulnerabilities(&self) -> &[Vulnerability] {
        &self.vulnerabilities
    }

    pub fn fuzz_queue(&self) -> &[FuzzTask] {
        &self.fuzz_queue
    }

    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Counters recomputed from the accumulators on every call.
    pub fn stats(&self) -> RunStats {
        RunStats {
            pages_crawled: self.pages.len(),
            forms_found: self.forms.len(),
            vulnerabilities_found: self.vulnerabilities.len(),
            exploits_attempted: self
                .fuzz_queue
                .iter()
                .filter(|t| t.status == FuzzTaskStatus::Attempted)
                .count(),
            flags_found: self.flags.len(),
        }
    }

    /// First task still pending, with its queue index.
    pub fn next_pending_fuzz(&self) -> Option<(usize, &FuzzTask)> {
        self.fuzz_queue
            .iter()
            .enumerate()
            .find(|(_, t)| t.status == FuzzTaskStatus::Pending)
    }

    // ── Control fields ──────────────────────────────────────────────────

    /// `pending -> running`.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(RunStatus::Running)
    }

    pub fn enter_stage(&mut self, stage: Stage) -> Result<(), StateError> {
        self.ensure_live()?;
        self.current_stage = stage;
        self.touch();
        Ok(())
    }

    /// Raise progress to `value` (clamped to 100). Lower values are ignored.
    /// Returns the progress after the update.
    pub fn advance_progress(&mut self, value: u8) -> Result<u8, StateError> {
        self.ensure_live()?;
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
            self.touch();
        }
        Ok(self.progress)
    }

    /// Move to a terminal status and park the stage at `Done`.
    /// A completed run always ends at 100% progress.
    pub fn finish(&mut self, status: RunStatus) -> Result<(), StateError> {
        if !status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.transition(status)?;
        self.current_stage = Stage::Done;
        if status == RunStatus::Completed {
            self.progress = 100;
        }
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    // ── Accumulators ────────────────────────────────────────────────────

    /// Record a discovered page. Returns `false` when the normalized URL was
    /// already known.
    pub fn add_page(&mut self, url: &str) -> Result<bool, StateError> {
        self.ensure_live()?;
        let key = normalize_url(url);
        if !self.page_keys.insert(key) {
            return Ok(false);
        }
        self.pages.push(url.to_string());
        self.touch();
        Ok(true)
    }

    pub fn add_form(&mut self, form: FormDescriptor) -> Result<(), StateError> {
        self.ensure_live()?;
        self.forms.push(form);
        self.touch();
        Ok(())
    }

    pub fn add_finding(&mut self, stage: Stage, text: impl Into<String>) -> Result<(), StateError> {
        self.ensure_live()?;
        self.findings.push(Finding {
            stage,
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    pub fn add_vulnerability(&mut self, vulnerability: Vulnerability) -> Result<(), StateError> {
        self.ensure_live()?;
        self.vulnerabilities.push(vulnerability);
        self.touch();
        Ok(())
    }

    /// Queue an exploitation attempt. The task always enters as pending.
    pub fn enqueue_fuzz(&mut self, mut task: FuzzTask) -> Result<(), StateError> {
        self.ensure_live()?;
        task.status = FuzzTaskStatus::Pending;
        self.fuzz_queue.push(task);
        self.touch();
        Ok(())
    }

    /// Mark the task at `index` attempted. Returns `false` for an unknown
    /// index or a task that was already attempted.
    pub fn mark_fuzz_attempted(&mut self, index: usize) -> Result<bool, StateError> {
        self.ensure_live()?;
        match self.fuzz_queue.get_mut(index) {
            Some(task) if task.status == FuzzTaskStatus::Pending => {
                task.status = FuzzTaskStatus::Attempted;
                self.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Record a captured flag. Identical values are kept as separate entries.
    pub fn record_flag(&mut self, value: impl Into<String>, stage: Stage) -> Result<(), StateError> {
        self.ensure_live()?;
        self.flags.push(Flag {
            value: value.into(),
            stage,
            found_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Record several flags captured from one output, each with its log line.
    /// Either all of them land or, on a terminal run, none do.
    pub fn record_flags(&mut self, values: &[String], stage: Stage) -> Result<(), StateError> {
        self.ensure_live()?;
        for value in values {
            self.record_flag(value.clone(), stage)?;
            self.append_log(stage, format!("Flag captured: {}", value));
        }
        Ok(())
    }

    /// Append a log entry. Allowed in every status.
    pub fn append_log(&mut self, stage: Stage, message: impl Into<String>) {
        let now = Utc::now();
        self.logs.push(LogEntry {
            timestamp: now,
            stage,
            message: message.into(),
        });
        if !self.is_terminal() {
            self.updated_at = now;
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal {
                status: self.status,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), StateError> {
        self.ensure_live()?;
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Key used to deduplicate pages: fragment dropped, host lowercased by the
/// parser, trailing slash trimmed except on the root path. Strings that do
/// not parse as URLs are compared trimmed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}
