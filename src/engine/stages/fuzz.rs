use async_trait::async_trait;
use flagforge_common::{FuzzTask, Stage};

use super::threat_model::to_fuzz_task;
use crate::engine::context::StageContext;
use crate::engine::oracle_loop::{LoopEnd, LoopSpec, run_oracle_loop};
use crate::engine::prompts;
use crate::engine::{StageOutcome, StageRunner};
use crate::errors::StageError;

/// Follow-up tasks accepted from a single task report.
const MAX_FOLLOW_UPS: usize = 3;

/// Works through the fuzz queue in order, one oracle loop per task.
///
/// `fuzz_iterations_per_task` bounds the oracle decisions spent on one task.
/// `fuzz_max_attempts` bounds both the tool calls and the tasks worked across
/// the whole stage, so follow-ups queued without any tool call still run out.
pub struct FuzzStage;

#[async_trait]
impl StageRunner for FuzzStage {
    fn stage(&self) -> Stage {
        Stage::Fuzz
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let max_attempts = ctx.settings().fuzz_max_attempts;
        let per_task = ctx.settings().fuzz_iterations_per_task.max(1);
        let stop_on_flag = ctx.settings().stop_on_flag;
        let target = ctx.input()?.target_url;

        if ctx.next_pending_fuzz()?.is_none() {
            ctx.log("No fuzz tasks queued, nothing to exploit")?;
            return Ok(StageOutcome::Advance);
        }

        let mut attempted = 0u32;
        let mut cap_reached = false;

        while let Some((index, task)) = ctx.next_pending_fuzz()? {
            if stop_on_flag && ctx.has_flag()? {
                break;
            }
            if attempted >= max_attempts {
                ctx.log(format!("Fuzz attempt cap of {} tasks reached", max_attempts))?;
                cap_reached = true;
                break;
            }
            let remaining = max_attempts.saturating_sub(ctx.tool_stats().calls);
            if remaining == 0 {
                ctx.log(format!("Fuzz attempt cap of {} tool calls reached", max_attempts))?;
                cap_reached = true;
                break;
            }

            ctx.mark_fuzz_attempted(index)?;
            attempted += 1;
            ctx.log(format!("Fuzzing {} with {} payloads", task.target, task.payload_class))?;

            let queued = ctx.read(|s| s.fuzz_queue().len())?.max(1);
            let focus = describe(&task);
            let spec = LoopSpec {
                instructions: prompts::instructions(Stage::Fuzz),
                focus: Some(&focus),
                max_iterations: per_task.min(remaining),
                progress: (index as f64 / queued as f64, (index + 1) as f64 / queued as f64),
            };
            let result = run_oracle_loop(ctx, spec).await?;

            match result.end {
                LoopEnd::Completed(report) => {
                    if !report.summary.trim().is_empty() {
                        ctx.add_finding(format!(
                            "Fuzz {} on {}: {}",
                            task.payload_class,
                            task.target,
                            report.summary.trim()
                        ))?;
                    }
                    for follow_up in report
                        .fuzz_tasks
                        .iter()
                        .filter_map(|t| to_fuzz_task(&target, t))
                        .take(MAX_FOLLOW_UPS)
                    {
                        ctx.log(format!(
                            "Queued follow-up {} task for {}",
                            follow_up.payload_class, follow_up.target
                        ))?;
                        ctx.enqueue_fuzz(follow_up)?;
                    }
                }
                LoopEnd::CapReached => {
                    ctx.add_finding(format!(
                        "Fuzz {} on {} ended after {} iterations without a result",
                        task.payload_class, task.target, result.iterations
                    ))?;
                }
                LoopEnd::FlagCaptured => break,
            }
        }

        ctx.ensure_tools_usable()?;

        let (flags, pending) = ctx.read(|s| (s.flags().len(), s.next_pending_fuzz().is_some()))?;
        ctx.log(format!(
            "Fuzz finished: {} tasks attempted, {} tool calls, {} flags",
            attempted,
            ctx.tool_stats().calls,
            flags
        ))?;
        Ok(if cap_reached && pending {
            StageOutcome::CapReached
        } else {
            StageOutcome::Advance
        })
    }
}

fn describe(task: &FuzzTask) -> String {
    let mut text = format!("Fuzz task: {} payloads against {}", task.payload_class, task.target);
    if let Some(vulnerability) = &task.vulnerability {
        text.push_str(&format!(" (suspected {})", vulnerability));
    }
    text
}
