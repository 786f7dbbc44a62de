use crate::errors::StageError;
use crate::oracle::{Decision, HistoryEntry, OracleRequest, StageReport};
use crate::tools::truncate_output;

use super::context::StageContext;
use super::prompts;

const HISTORY_OUTPUT_BYTES: usize = 2000;

/// How an oracle loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEnd {
    /// The oracle declared the stage complete
    Completed(StageReport),
    /// The iteration cap was hit before the oracle finished
    CapReached,
    /// A flag was captured and the run stops on the first flag
    FlagCaptured,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub end: LoopEnd,
    pub iterations: u32,
    pub history: Vec<HistoryEntry>,
}

/// Parameters of one loop.
#[derive(Debug, Clone)]
pub struct LoopSpec<'a> {
    pub instructions: String,
    /// Extra context appended to the state summary, such as the current fuzz task
    pub focus: Option<&'a str>,
    pub max_iterations: u32,
    /// Slice of the stage band this loop reports progress into
    pub progress: (f64, f64),
}

/// Ask the oracle, run the tool it picks, feed the result back, and repeat
/// until it declares the stage complete or `max_iterations` decisions were
/// made. Each iteration is one oracle decision.
pub async fn run_oracle_loop(ctx: &mut StageContext<'_>, spec: LoopSpec<'_>) -> Result<LoopResult, StageError> {
    let stage = ctx.stage();
    let tools = ctx.tool_descriptors();
    let mut history: Vec<HistoryEntry> = Vec::new();
    let (from, to) = spec.progress;

    for iteration in 1..=spec.max_iterations {
        let mut state_summary = ctx.read(prompts::state_summary)?;
        if let Some(focus) = spec.focus {
            state_summary.push_str("\nCurrent focus:\n");
            state_summary.push_str(focus);
        }
        let request = OracleRequest {
            stage,
            instructions: spec.instructions.clone(),
            state_summary,
            tools: tools.clone(),
            history: history.clone(),
        };

        let decision = ctx.ask(&request).await?;
        let fraction = from + (to - from) * (iteration as f64 / spec.max_iterations as f64);

        match decision {
            Decision::StageComplete(report) => {
                ctx.scan_for_flags(&report.summary)?;
                ctx.report_progress(to)?;
                return Ok(LoopResult {
                    end: LoopEnd::Completed(report),
                    iterations: iteration,
                    history,
                });
            }
            Decision::ToolCall { tool, args } => {
                ctx.log(format!("Calling {} ({}/{})", tool, iteration, spec.max_iterations))?;
                let outcome = ctx.invoke_tool(&tool, &args).await?;
                let (output, _) = truncate_output(&outcome.output, HISTORY_OUTPUT_BYTES);
                history.push(HistoryEntry {
                    tool,
                    args,
                    error: outcome
                        .error
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    output,
                });
                ctx.report_progress(fraction)?;

                if ctx.settings().stop_on_flag && ctx.has_flag()? {
                    return Ok(LoopResult {
                        end: LoopEnd::FlagCaptured,
                        iterations: iteration,
                        history,
                    });
                }
            }
        }
    }

    ctx.log(format!(
        "{} stage iteration cap reached after {} oracle decisions",
        stage, spec.max_iterations
    ))?;
    Ok(LoopResult {
        end: LoopEnd::CapReached,
        iterations: spec.max_iterations,
        history,
    })
}
