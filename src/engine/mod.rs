//! Stage sequencing for a single run.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `context` | `StageContext`: the mutation rights and handles a stage gets |
//! | `oracle_loop` | capped decide → tool-call loop shared by the oracle-driven stages |
//! | `prompts` | stage instructions and the state summary sent to the oracle |
//! | `html` | link and form extraction for the crawl stage |
//! | `stages` | the four stage runners |

pub mod context;
pub mod html;
pub mod oracle_loop;
pub mod prompts;
pub mod stages;

#[cfg(test)]
mod testing;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flagforge_common::{RunStatus, Stage};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{StageError, StateError};
use crate::flags::FlagMatcher;
use crate::oracle::RateLimitedClient;
use crate::run::RunWriter;
use crate::tools::ToolInvoker;

pub use context::StageContext;
pub use stages::{CrawlStage, FuzzStage, SummarizeStage, ThreatModelStage};

/// Caps and switches for the stage runners.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub crawl_max_pages: usize,
    pub crawl_max_depth: usize,
    pub probe_paths: Vec<String>,
    pub summarize_max_iterations: u32,
    pub threat_model_max_iterations: u32,
    pub fuzz_max_attempts: u32,
    pub fuzz_iterations_per_task: u32,
    pub stop_on_flag: bool,
    /// Timeout passed to every tool call; `None` uses the invoker's defaults
    pub tool_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        crate::config::EngineConfig::default().settings()
    }
}

/// How a stage ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage finished its work
    Advance,
    /// The iteration cap forced the stage to stop with partial results
    CapReached,
}

/// One phase of the pipeline.
///
/// A runner mutates the run only through its [`StageContext`], must append
/// at least one log entry, and must bound every loop it runs.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError>;
}

/// Everything runs share: the stage list, tool invoker, oracle client and caps.
pub struct Pipeline {
    stages: Vec<Arc<dyn StageRunner>>,
    tools: ToolInvoker,
    oracle: RateLimitedClient,
    settings: EngineSettings,
}

impl Pipeline {
    /// Crawl → Summarize → ThreatModel → Fuzz.
    pub fn new(tools: ToolInvoker, oracle: RateLimitedClient, settings: EngineSettings) -> Self {
        Self::with_stages(
            vec![
                Arc::new(CrawlStage),
                Arc::new(SummarizeStage),
                Arc::new(ThreatModelStage),
                Arc::new(FuzzStage),
            ],
            tools,
            oracle,
            settings,
        )
    }

    pub fn with_stages(
        stages: Vec<Arc<dyn StageRunner>>,
        tools: ToolInvoker,
        oracle: RateLimitedClient,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stages,
            tools,
            oracle,
            settings,
        }
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().map(|s| s.stage())
    }

    pub fn tools(&self) -> &ToolInvoker {
        &self.tools
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// Progress band `[start, end]` of stage `index` out of `count`, splitting
/// 0..100 evenly (25 points each for the four standard stages).
pub fn progress_band(index: usize, count: usize) -> (u8, u8) {
    if count == 0 {
        return (0, 100);
    }
    let start = index * 100 / count;
    let end = (index + 1) * 100 / count;
    (start.min(100) as u8, end.min(100) as u8)
}

/// Drives one run through the pipeline. Never returns an error: every
/// failure path ends in a terminal status with an explanation in the run.
pub struct WorkflowEngine {
    pipeline: Arc<Pipeline>,
}

impl WorkflowEngine {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Run to a terminal status. `cancel` is checked before every stage.
    pub async fn run(&self, writer: RunWriter, cancel: CancellationToken) -> RunStatus {
        match self.drive(&writer, &cancel).await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "run state unavailable");
                writer.read(|s| s.status()).unwrap_or(RunStatus::Failed)
            }
        }
    }

    async fn drive(&self, writer: &RunWriter, cancel: &CancellationToken) -> Result<RunStatus, StateError> {
        let pipeline = &self.pipeline;
        let input = writer.read(|s| s.input().clone())?;

        // Submit normally starts the run; an engine driven directly starts it here.
        writer.update(|s| {
            if s.status() == RunStatus::Pending {
                s.start()?;
            }
            s.append_log(Stage::Crawl, format!("Run started against {}", input.target_url));
            Ok(())
        })?;
        info!(target_url = %input.target_url, "run started");

        if cancel.is_cancelled() {
            return finish(writer, Stage::Crawl, RunStatus::Stopped, "Run stopped before its first stage");
        }

        let flags = FlagMatcher::new(input.flag_format.as_deref());
        let count = pipeline.stages.len();

        for (index, runner) in pipeline.stages.iter().enumerate() {
            let stage = runner.stage();
            if cancel.is_cancelled() {
                info!(%stage, "stop observed at stage boundary");
                return finish(
                    writer,
                    stage,
                    RunStatus::Stopped,
                    &format!("Run stopped before {} stage", stage),
                );
            }

            let band = progress_band(index, count);
            writer.update(|s| {
                s.enter_stage(stage)?;
                s.advance_progress(band.0)?;
                s.append_log(stage, format!("Starting {} stage", stage));
                Ok(())
            })?;
            info!(%stage, "stage started");

            let mut ctx = StageContext::new(
                stage,
                band,
                writer,
                &pipeline.tools,
                &pipeline.oracle,
                &pipeline.settings,
                &flags,
            );
            let result = AssertUnwindSafe(runner.run(&mut ctx)).catch_unwind().await;

            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => return fail(writer, stage, &e.to_string()),
                Err(_) => return fail(writer, stage, "execution-error: internal failure in stage"),
            };

            let flags_found = writer.update(|s| {
                let note = match outcome {
                    StageOutcome::Advance => format!("Finished {} stage", stage),
                    StageOutcome::CapReached => {
                        format!("Finished {} stage at its iteration cap", stage)
                    }
                };
                s.advance_progress(band.1)?;
                s.append_log(stage, note);
                Ok(s.flags().len())
            })?;
            info!(%stage, ?outcome, "stage finished");

            if pipeline.settings.stop_on_flag && flags_found > 0 && index + 1 < count {
                writer.update(|s| {
                    s.append_log(stage, "Flag captured, skipping remaining stages");
                    Ok(())
                })?;
                break;
            }
        }

        finish(writer, Stage::Done, RunStatus::Completed, "Run completed")
    }
}

fn finish(writer: &RunWriter, stage: Stage, status: RunStatus, message: &str) -> Result<RunStatus, StateError> {
    writer.update(|s| {
        s.append_log(stage, message);
        s.finish(status)
    })?;
    info!(%status, "run finished");
    Ok(status)
}

fn fail(writer: &RunWriter, stage: Stage, reason: &str) -> Result<RunStatus, StateError> {
    error!(%stage, reason, "stage failed");
    writer.update(|s| {
        s.add_finding(stage, format!("Stage failed: {}", reason))?;
        s.append_log(stage, format!("{} stage failed: {}", stage, reason));
        s.finish(RunStatus::Failed)
    })?;
    Ok(RunStatus::Failed)
}
