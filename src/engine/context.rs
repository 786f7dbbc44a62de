use flagforge_common::{FormDescriptor, FuzzTask, RunId, RunInput, Stage, Vulnerability};
use serde_json::Value;
use tracing::{info, warn};

use super::EngineSettings;
use crate::errors::{StageError, ToolErrorKind};
use crate::flags::FlagMatcher;
use crate::oracle::{Decision, OracleRequest, RateLimitedClient};
use crate::run::{RunState, RunWriter};
use crate::tools::{ToolDescriptor, ToolInvoker, ToolOutcome};

/// Tool call bookkeeping for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolStats {
    pub calls: u32,
    pub succeeded: u32,
    /// Timeouts and execution errors; not-found is excluded
    pub hard_failures: u32,
    pub last_error: Option<String>,
}

/// What a stage runner may touch: its stage's slice of the run state,
/// the tool invoker and the oracle client.
pub struct StageContext<'a> {
    stage: Stage,
    band: (u8, u8),
    writer: &'a RunWriter,
    tools: &'a ToolInvoker,
    oracle: &'a RateLimitedClient,
    settings: &'a EngineSettings,
    flags: &'a FlagMatcher,
    tool_stats: ToolStats,
}

impl<'a> StageContext<'a> {
    pub fn new(
        stage: Stage,
        band: (u8, u8),
        writer: &'a RunWriter,
        tools: &'a ToolInvoker,
        oracle: &'a RateLimitedClient,
        settings: &'a EngineSettings,
        flags: &'a FlagMatcher,
    ) -> Self {
        Self {
            stage,
            band,
            writer,
            tools,
            oracle,
            settings,
            flags,
            tool_stats: ToolStats::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn settings(&self) -> &EngineSettings {
        self.settings
    }

    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.descriptors()
    }

    pub fn tool_stats(&self) -> &ToolStats {
        &self.tool_stats
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn read<T>(&self, f: impl FnOnce(&RunState) -> T) -> Result<T, StageError> {
        Ok(self.writer.read(f)?)
    }

    pub fn run_id(&self) -> Result<RunId, StageError> {
        self.read(|s| s.id())
    }

    pub fn input(&self) -> Result<RunInput, StageError> {
        self.read(|s| s.input().clone())
    }

    pub fn has_flag(&self) -> Result<bool, StageError> {
        self.read(|s| !s.flags().is_empty())
    }

    pub fn next_pending_fuzz(&self) -> Result<Option<(usize, FuzzTask)>, StageError> {
        self.read(|s| s.next_pending_fuzz().map(|(i, t)| (i, t.clone())))
    }

    // ── Writes ──────────────────────────────────────────────────────────

    pub fn log(&self, message: impl Into<String>) -> Result<(), StageError> {
        let message = message.into();
        info!(stage = %self.stage, "{}", message);
        self.writer.update(|s| {
            s.append_log(self.stage, message);
            Ok(())
        })?;
        Ok(())
    }

    pub fn add_finding(&self, text: impl Into<String>) -> Result<(), StageError> {
        Ok(self.writer.update(|s| s.add_finding(self.stage, text))?)
    }

    pub fn add_page(&self, url: &str) -> Result<bool, StageError> {
        Ok(self.writer.update(|s| s.add_page(url))?)
    }

    pub fn add_form(&self, form: FormDescriptor) -> Result<(), StageError> {
        Ok(self.writer.update(|s| s.add_form(form))?)
    }

    pub fn add_vulnerability(&self, vulnerability: Vulnerability) -> Result<(), StageError> {
        Ok(self.writer.update(|s| s.add_vulnerability(vulnerability))?)
    }

    pub fn enqueue_fuzz(&self, task: FuzzTask) -> Result<(), StageError> {
        Ok(self.writer.update(|s| s.enqueue_fuzz(task))?)
    }

    pub fn mark_fuzz_attempted(&self, index: usize) -> Result<bool, StageError> {
        Ok(self.writer.update(|s| s.mark_fuzz_attempted(index))?)
    }

    /// Sub-progress inside this stage's band; `fraction` is clamped to 0..=1.
    pub fn report_progress(&self, fraction: f64) -> Result<(), StageError> {
        let (start, end) = self.band;
        let fraction = fraction.clamp(0.0, 1.0);
        let value = start as f64 + (end.saturating_sub(start)) as f64 * fraction;
        self.writer.update(|s| s.advance_progress(value.floor() as u8))?;
        Ok(())
    }

    /// Record every flag in `text`. Each flag is committed together with its
    /// log line. Returns how many were recorded.
    pub fn scan_for_flags(&self, text: &str) -> Result<usize, StageError> {
        let found = self.flags.find_all(text);
        if found.is_empty() {
            return Ok(0);
        }
        let stage = self.stage;
        self.writer.update(|s| s.record_flags(&found, stage))?;
        info!(stage = %stage, count = found.len(), "flag captured");
        Ok(found.len())
    }

    // ── External calls ──────────────────────────────────────────────────

    /// Invoke a tool. Failures are recorded as findings, successful outputs
    /// are scanned for flags.
    pub async fn invoke_tool(&mut self, name: &str, args: &Value) -> Result<ToolOutcome, StageError> {
        self.call_tool(name, args, true).await
    }

    /// Like [`StageContext::invoke_tool`], but execution errors are only
    /// logged. Used for speculative requests such as path probes.
    pub async fn probe_tool(&mut self, name: &str, args: &Value) -> Result<ToolOutcome, StageError> {
        self.call_tool(name, args, false).await
    }

    async fn call_tool(&mut self, name: &str, args: &Value, record_errors: bool) -> Result<ToolOutcome, StageError> {
        let outcome = self.tools.invoke(name, args, self.settings.tool_timeout).await;
        self.tool_stats.calls += 1;

        match outcome.error {
            None => {
                self.tool_stats.succeeded += 1;
                self.scan_for_flags(&outcome.output)?;
            }
            Some(kind) => {
                if kind != ToolErrorKind::NotFound {
                    self.tool_stats.hard_failures += 1;
                }
                self.tool_stats.last_error = Some(outcome.describe());
                warn!(stage = %self.stage, tool = name, error = %kind, "tool call failed");
                if record_errors || kind != ToolErrorKind::ExecutionError {
                    self.add_finding(format!("Tool error: {}", outcome.describe()))?;
                }
                self.log(format!("Tool {} failed ({})", name, kind))?;
            }
        }
        Ok(outcome)
    }

    /// Stage-local failure when every tool call of the stage failed and at
    /// least one failure was a timeout or execution error. Missing tools
    /// alone only degrade the run.
    pub fn ensure_tools_usable(&self) -> Result<(), StageError> {
        let stats = &self.tool_stats;
        if stats.calls > 0 && stats.succeeded == 0 && stats.hard_failures > 0 {
            return Err(StageError::ToolsUnavailable {
                stage: self.stage,
                calls: stats.calls,
                last_error: stats.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Ask the oracle; quota exhaustion and persistent malformed responses
    /// surface as stage errors.
    pub async fn ask(&self, request: &OracleRequest) -> Result<Decision, StageError> {
        Ok(self.oracle.ask(request).await?)
    }
}
