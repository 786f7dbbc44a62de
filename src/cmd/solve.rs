//! In-process solve command: `flagforge solve <url>`.
//!
//! Submits one run to a private registry and renders it by polling
//! snapshots, the same way a remote client would.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use flagforge::config::FlagforgeToml;
use flagforge_common::{RunInput, RunSnapshot, RunStatus};
use indicatif::{ProgressBar, ProgressStyle};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SolveRequest {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub source: Option<PathBuf>,
    pub flag_format: Option<String>,
    pub hint: Option<String>,
    pub json: bool,
    pub keep_going: bool,
}

impl SolveRequest {
    fn input(&self) -> Result<RunInput> {
        let source = match &self.source {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read source file {}", path.display()))?,
            ),
            None => None,
        };
        Ok(RunInput {
            target_url: self.url.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            source,
            flag_format: self.flag_format.clone(),
            hint: self.hint.clone(),
        })
    }
}

/// Run to a terminal status and report it. Returns the final status so the
/// caller can pick the exit code.
pub async fn cmd_solve(mut config: FlagforgeToml, request: SolveRequest) -> Result<RunStatus> {
    if request.keep_going {
        config.engine.stop_on_flag = false;
    }
    let input = request.input()?;
    let registry = super::build_run_registry(&config)?;
    let run_id = registry.submit(input).await?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut seen_logs = 0usize;
    let mut stop_requested = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let snapshot = loop {
        let snapshot = registry.get(run_id).await?;
        seen_logs = print_new_logs(&bar, &snapshot, seen_logs);
        bar.set_position(snapshot.progress as u64);
        bar.set_message(format!("{} ({})", snapshot.current_stage, snapshot.status));
        if snapshot.is_terminal() {
            break snapshot;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = &mut ctrl_c, if !stop_requested => {
                stop_requested = true;
                bar.println("Stop requested, waiting for the current stage to finish...");
                if let Err(e) = registry.stop(run_id).await {
                    tracing::warn!(error = %e, "stop request rejected");
                }
            }
        }
    };
    bar.finish_and_clear();

    if request.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_report(&snapshot);
    }
    Ok(snapshot.status)
}

/// Print entries added since the last poll. Entries that already scrolled out
/// of the snapshot's log tail are skipped.
fn print_new_logs(bar: &ProgressBar, snapshot: &RunSnapshot, seen: usize) -> usize {
    let new = snapshot.log_count.saturating_sub(seen).min(snapshot.logs.len());
    for entry in &snapshot.logs[snapshot.logs.len() - new..] {
        bar.println(format!(
            "{} {:<12} {}",
            style(entry.timestamp.format("%H:%M:%S")).dim(),
            entry.stage.to_string(),
            entry.message
        ));
    }
    snapshot.log_count
}

fn print_report(snapshot: &RunSnapshot) {
    let status = match snapshot.status {
        RunStatus::Completed => style(snapshot.status.to_string()).green().bold(),
        RunStatus::Stopped => style(snapshot.status.to_string()).yellow().bold(),
        _ => style(snapshot.status.to_string()).red().bold(),
    };

    println!();
    println!("Run {} {}", snapshot.run_id, status);
    println!("  Target:          {}", snapshot.input.target_url);
    println!("  Pages:           {}", snapshot.stats.pages_crawled);
    println!("  Forms:           {}", snapshot.stats.forms_found);
    match snapshot.highest_severity() {
        Some(worst) => println!(
            "  Vulnerabilities: {} (worst: {})",
            snapshot.stats.vulnerabilities_found, worst
        ),
        None => println!("  Vulnerabilities: 0"),
    }
    println!("  Fuzz attempts:   {}", snapshot.stats.exploits_attempted);

    if !snapshot.vulnerabilities.is_empty() {
        println!();
        println!("{}", style("Vulnerabilities").bold());
        for v in &snapshot.vulnerabilities {
            let location = v.location.as_deref().unwrap_or("-");
            println!("  [{}] {} at {}", v.severity, v.vuln_type, location);
        }
    }

    println!();
    if snapshot.flags.is_empty() {
        println!("No flags captured.");
    } else {
        println!("{}", style("Flags").bold());
        for flag in &snapshot.flags {
            println!("  {} ({} stage)", style(&flag.value).green(), flag.stage);
        }
    }

    if snapshot.status == RunStatus::Failed
        && let Some(last) = snapshot.findings.last()
    {
        println!();
        println!("Last finding: {}", last.text);
    }
    println!();
}
