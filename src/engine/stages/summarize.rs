use async_trait::async_trait;
use flagforge_common::Stage;

use crate::engine::context::StageContext;
use crate::engine::oracle_loop::{LoopEnd, LoopSpec, run_oracle_loop};
use crate::engine::prompts;
use crate::engine::{StageOutcome, StageRunner};
use crate::errors::StageError;

/// Oracle-driven analysis of the crawled content and any supplied source.
pub struct SummarizeStage;

#[async_trait]
impl StageRunner for SummarizeStage {
    fn stage(&self) -> Stage {
        Stage::Summarize
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let spec = LoopSpec {
            instructions: prompts::instructions(Stage::Summarize),
            focus: None,
            max_iterations: ctx.settings().summarize_max_iterations,
            progress: (0.0, 1.0),
        };
        let result = run_oracle_loop(ctx, spec).await?;
        ctx.ensure_tools_usable()?;

        match result.end {
            LoopEnd::Completed(report) => {
                let summary = report.summary.trim();
                if summary.is_empty() {
                    ctx.log("Oracle finished the analysis without a summary")?;
                } else {
                    ctx.add_finding(format!("Summary: {}", summary))?;
                    ctx.log(format!("Analysis recorded after {} oracle decisions", result.iterations))?;
                }
                Ok(StageOutcome::Advance)
            }
            LoopEnd::CapReached => {
                ctx.add_finding(format!(
                    "Analysis incomplete: {} tool calls made before the iteration cap",
                    result.history.len()
                ))?;
                Ok(StageOutcome::CapReached)
            }
            LoopEnd::FlagCaptured => {
                ctx.log("Flag captured during analysis")?;
                Ok(StageOutcome::Advance)
            }
        }
    }
}
