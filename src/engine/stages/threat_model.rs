use async_trait::async_trait;
use flagforge_common::{FuzzTask, Severity, Stage, Vulnerability};
use url::Url;

use crate::engine::context::StageContext;
use crate::engine::oracle_loop::{LoopEnd, LoopSpec, run_oracle_loop};
use crate::engine::prompts;
use crate::engine::{StageOutcome, StageRunner};
use crate::errors::StageError;
use crate::oracle::{ReportedFuzzTask, ReportedVulnerability, StageReport};

/// Oracle-driven threat model: turns the analysis into vulnerabilities and
/// queued fuzz tasks.
pub struct ThreatModelStage;

#[async_trait]
impl StageRunner for ThreatModelStage {
    fn stage(&self) -> Stage {
        Stage::ThreatModel
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let spec = LoopSpec {
            instructions: prompts::instructions(Stage::ThreatModel),
            focus: None,
            max_iterations: ctx.settings().threat_model_max_iterations,
            progress: (0.0, 0.9),
        };
        let result = run_oracle_loop(ctx, spec).await?;
        ctx.ensure_tools_usable()?;

        let report = match result.end {
            LoopEnd::Completed(report) => report,
            LoopEnd::CapReached => {
                ctx.add_finding("Threat model incomplete: iteration cap reached before a report")?;
                return Ok(StageOutcome::CapReached);
            }
            LoopEnd::FlagCaptured => {
                ctx.log("Flag captured during threat modeling")?;
                return Ok(StageOutcome::Advance);
            }
        };

        let target = ctx.input()?.target_url;
        let (vulnerabilities, tasks) = apply_report(ctx, &report, &target)?;
        ctx.report_progress(1.0)?;
        ctx.log(format!(
            "Threat model identified {} vulnerabilities and queued {} fuzz tasks",
            vulnerabilities, tasks
        ))?;
        Ok(StageOutcome::Advance)
    }
}

/// Record the report's vulnerabilities and fuzz tasks. When the oracle names
/// vulnerabilities but no tasks, one task per vulnerability is derived.
fn apply_report(ctx: &StageContext<'_>, report: &StageReport, target: &str) -> Result<(usize, usize), StageError> {
    if !report.summary.trim().is_empty() {
        ctx.add_finding(format!("Threat model: {}", report.summary.trim()))?;
    }

    let mut recorded = Vec::new();
    for reported in &report.vulnerabilities {
        if reported.vuln_type.trim().is_empty() {
            continue;
        }
        let vulnerability = to_vulnerability(ctx, reported)?;
        ctx.add_vulnerability(vulnerability.clone())?;
        recorded.push(vulnerability);
    }

    let tasks: Vec<FuzzTask> = if report.fuzz_tasks.is_empty() {
        recorded
            .iter()
            .map(|v| {
                let mut task = FuzzTask::pending(
                    resolve_target(target, v.location.as_deref().unwrap_or("")),
                    v.vuln_type.clone(),
                );
                task.vulnerability = Some(v.vuln_type.clone());
                task
            })
            .collect()
    } else {
        report.fuzz_tasks.iter().filter_map(|t| to_fuzz_task(target, t)).collect()
    };

    let count = tasks.len();
    for task in tasks {
        ctx.enqueue_fuzz(task)?;
    }
    Ok((recorded.len(), count))
}

fn to_vulnerability(ctx: &StageContext<'_>, reported: &ReportedVulnerability) -> Result<Vulnerability, StageError> {
    let severity = match reported.severity.parse::<Severity>() {
        Ok(s) => s,
        Err(_) => {
            ctx.log(format!(
                "Unknown severity {:?} for {}, using medium",
                reported.severity, reported.vuln_type
            ))?;
            Severity::Medium
        }
    };
    Ok(Vulnerability {
        vuln_type: reported.vuln_type.trim().to_string(),
        description: reported.description.clone(),
        severity,
        location: reported.location.clone().filter(|l| !l.trim().is_empty()),
    })
}

pub(crate) fn to_fuzz_task(target: &str, reported: &ReportedFuzzTask) -> Option<FuzzTask> {
    if reported.payload_class.trim().is_empty() {
        return None;
    }
    let mut task = FuzzTask::pending(
        resolve_target(target, &reported.target),
        reported.payload_class.trim(),
    );
    task.vulnerability = reported.vulnerability.clone();
    Some(task)
}

/// Resolve a possibly relative location against the run's target URL.
fn resolve_target(target: &str, location: &str) -> String {
    let location = location.trim();
    if location.is_empty() {
        return target.to_string();
    }
    match Url::parse(target).and_then(|base| base.join(location)) {
        Ok(url) => url.to_string(),
        Err(_) => location.to_string(),
    }
}
