use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flagforge_common::{RunId, RunInput, RunSnapshot, RunStatus, RunSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::engine::{Pipeline, WorkflowEngine};
use crate::errors::RegistryError;
use crate::projector::StatusProjector;
use crate::run::{RunReader, new_run};

/// Aggregate counters over every run in the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_runs: usize,
    pub active_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub stopped_runs: usize,
    /// Share of finished runs that captured at least one flag, 0.0 to 100.0
    pub success_rate: f64,
    pub total_flags: usize,
}

struct RunEntry {
    reader: RunReader,
    cancel: CancellationToken,
    /// Supervisor task plus the abort handle of the engine it watches
    tasks: Option<(JoinHandle<()>, AbortHandle)>,
}

/// Process-wide table of runs.
///
/// Created once at startup and passed around explicitly. Entries are added by
/// [`RunRegistry::submit`] and removed only by [`RunRegistry::delete`]; the
/// registry only ever reads run state, the engine task owns the writer.
pub struct RunRegistry {
    pipeline: Arc<Pipeline>,
    projector: StatusProjector,
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl RunRegistry {
    pub fn new(pipeline: Arc<Pipeline>, projector: StatusProjector) -> Self {
        Self {
            pipeline,
            projector,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Validate the input, create the run and move it to `running` before its
    /// engine is spawned, so a stop that lands before the first poll still
    /// sees a started run.
    pub async fn submit(&self, input: RunInput) -> Result<RunId, RegistryError> {
        let input = validate_input(input)?;
        let id = Uuid::new_v4();
        let (writer, reader) = new_run(id, input);
        writer.update(|s| s.start())?;
        let cancel = CancellationToken::new();

        let engine = WorkflowEngine::new(Arc::clone(&self.pipeline));
        let token = cancel.clone();
        let span = info_span!("run", run_id = %id);
        let engine_task = tokio::spawn(async move { engine.run(writer, token).await }.instrument(span));
        let engine_abort = engine_task.abort_handle();

        // A panicking or aborted engine never reaches a terminal status on
        // its own; the supervisor closes the run instead.
        let watched = reader.clone();
        let supervisor = tokio::spawn(async move {
            match engine_task.await {
                Ok(status) => info!(run_id = %id, %status, "engine finished"),
                Err(e) => {
                    let reason = if e.is_panic() {
                        "engine task panicked"
                    } else {
                        "engine task was aborted"
                    };
                    error!(run_id = %id, reason, "engine died");
                    if let Err(e) = watched.force_fail(reason) {
                        error!(run_id = %id, error = %e, "failed to record engine failure");
                    }
                }
            }
        });

        self.runs.write().await.insert(
            id,
            RunEntry {
                reader,
                cancel,
                tasks: Some((supervisor, engine_abort)),
            },
        );
        info!(run_id = %id, "run submitted");
        Ok(id)
    }

    /// Consistent snapshot of one run.
    pub async fn get(&self, id: RunId) -> Result<RunSnapshot, RegistryError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&id).ok_or(RegistryError::NotFound { id })?;
        Ok(entry.reader.read(|s| self.projector.project(s))?)
    }

    /// Request a stop. The engine observes it at the next stage boundary.
    pub async fn stop(&self, id: RunId) -> Result<(), RegistryError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&id).ok_or(RegistryError::NotFound { id })?;
        let status = entry.reader.status()?;
        if status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal { id, status });
        }
        if !entry.cancel.is_cancelled() {
            entry.cancel.cancel();
            entry
                .reader
                .append_note("Stop requested, halting at the next stage boundary")?;
            info!(run_id = %id, "stop requested");
        }
        Ok(())
    }

    /// Remove a run. A live run is cancelled first; its engine winds down
    /// in the background.
    pub async fn delete(&self, id: RunId) -> Result<(), RegistryError> {
        let entry = self
            .runs
            .write()
            .await
            .remove(&id)
            .ok_or(RegistryError::NotFound { id })?;
        entry.cancel.cancel();
        info!(run_id = %id, "run deleted");
        Ok(())
    }

    /// Every run, newest first.
    pub async fn list(&self) -> Result<Vec<RunSummary>, RegistryError> {
        let runs = self.runs.read().await;
        let mut summaries = runs
            .values()
            .map(|entry| entry.reader.read(|s| self.projector.summarize(s)))
            .collect::<Result<Vec<_>, _>>()?;
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let summaries = self.list().await?;
        let mut stats = RegistryStats {
            total_runs: summaries.len(),
            ..Default::default()
        };
        let mut successful = 0usize;
        for run in &summaries {
            match run.status {
                RunStatus::Pending | RunStatus::Running => stats.active_runs += 1,
                RunStatus::Completed => stats.completed_runs += 1,
                RunStatus::Failed => stats.failed_runs += 1,
                RunStatus::Stopped => stats.stopped_runs += 1,
            }
            if run.status.is_terminal() && run.flags_found > 0 {
                successful += 1;
            }
            stats.total_flags += run.flags_found;
        }
        let finished = stats.completed_runs + stats.failed_runs + stats.stopped_runs;
        if finished > 0 {
            stats.success_rate = successful as f64 * 100.0 / finished as f64;
        }
        Ok(stats)
    }

    /// Cancel every live run, note the shutdown in each, and wait up to
    /// `grace` for the engines. Engines still running after that are aborted
    /// and their runs marked failed.
    pub async fn shutdown(&self, grace: Duration) {
        let mut supervisors = Vec::new();
        let mut engines = Vec::new();
        {
            let mut runs = self.runs.write().await;
            for (id, entry) in runs.iter_mut() {
                let live = entry.reader.status().map(|s| !s.is_terminal()).unwrap_or(false);
                if live {
                    entry.cancel.cancel();
                    if let Err(e) = entry.reader.append_note("Server shutting down, stopping run") {
                        warn!(run_id = %id, error = %e, "could not note shutdown");
                    }
                }
                if let Some((supervisor, engine)) = entry.tasks.take() {
                    supervisors.push(supervisor);
                    engines.push(engine);
                }
            }
        }
        info!(runs = supervisors.len(), "waiting for run engines to stop");

        let all = futures::future::join_all(supervisors);
        tokio::pin!(all);
        if tokio::time::timeout(grace, &mut all).await.is_err() {
            warn!(grace_secs = grace.as_secs_f64(), "engines still running after grace period, aborting");
            for engine in &engines {
                engine.abort();
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), all).await;
        }
    }
}

fn validate_input(mut input: RunInput) -> Result<RunInput, RegistryError> {
    let target = input.target_url.trim().to_string();
    if target.is_empty() {
        return Err(RegistryError::InvalidInput("target_url is required".into()));
    }
    let url = Url::parse(&target)
        .map_err(|e| RegistryError::InvalidInput(format!("target_url is not a valid URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegistryError::InvalidInput(format!(
            "target_url must use http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(RegistryError::InvalidInput("target_url has no host".into()));
    }
    input.target_url = target;
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSettings, StageContext, StageOutcome, StageRunner};
    use crate::errors::StageError;
    use crate::oracle::{ClientSettings, Decision, Oracle, OracleRequest, RateLimitedClient, StageReport};
    use crate::errors::OracleError;
    use crate::tools::{InvokerSettings, ToolInvoker, ToolRegistry};
    use async_trait::async_trait;
    use flagforge_common::Stage;
    use std::time::Instant;

    struct DoneOracle;

    #[async_trait]
    impl Oracle for DoneOracle {
        async fn decide(&self, _request: &OracleRequest) -> Result<Decision, OracleError> {
            Ok(Decision::StageComplete(StageReport::default()))
        }
    }

    /// Logs, then waits `delay` before advancing.
    struct Slow {
        stage: Stage,
        delay: Duration,
    }

    #[async_trait]
    impl StageRunner for Slow {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
            ctx.log("working")?;
            tokio::time::sleep(self.delay).await;
            Ok(StageOutcome::Advance)
        }
    }

    struct Panicky;

    #[async_trait]
    impl StageRunner for Panicky {
        fn stage(&self) -> Stage {
            Stage::Crawl
        }

        async fn run(&self, _ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
            panic!("boom");
        }
    }

    fn registry(stages: Vec<Arc<dyn StageRunner>>) -> RunRegistry {
        let tools = ToolInvoker::new(Arc::new(ToolRegistry::new()), InvokerSettings::default());
        let oracle = RateLimitedClient::new(Arc::new(DoneOracle), ClientSettings::default());
        let pipeline = Pipeline::with_stages(stages, tools, oracle, EngineSettings::default());
        RunRegistry::new(Arc::new(pipeline), StatusProjector::default())
    }

    fn slow_stages(delay: Duration) -> Vec<Arc<dyn StageRunner>> {
        Stage::PIPELINE
            .iter()
            .map(|stage| Arc::new(Slow { stage: *stage, delay }) as Arc<dyn StageRunner>)
            .collect()
    }

    async fn wait_terminal(registry: &RunRegistry, id: RunId) -> RunSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = registry.get(id).await.unwrap();
            if snapshot.is_terminal() {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "run did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_validate_input() {
        assert!(validate_input(RunInput::new(" http://ctf.local:8080/ ")).is_ok());
        assert!(matches!(
            validate_input(RunInput::new("")),
            Err(RegistryError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_input(RunInput::new("ftp://ctf.local/")),
            Err(RegistryError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_input(RunInput::new("not a url")),
            Err(RegistryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let registry = registry(slow_stages(Duration::ZERO));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        let snapshot = wait_terminal(&registry, id).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.current_stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let registry = registry(slow_stages(Duration::ZERO));
        let id = Uuid::new_v4();
        assert!(matches!(registry.get(id).await, Err(RegistryError::NotFound { .. })));
        assert!(matches!(registry.stop(id).await, Err(RegistryError::NotFound { .. })));
        assert!(matches!(registry.delete(id).await, Err(RegistryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_stop_then_already_terminal() {
        let registry = registry(slow_stages(Duration::from_millis(100)));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        registry.stop(id).await.unwrap();

        let snapshot = wait_terminal(&registry, id).await;
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert!(snapshot.progress < 100);
        assert!(matches!(
            registry.stop(id).await,
            Err(RegistryError::AlreadyTerminal {
                status: RunStatus::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stop_right_after_submit_passes_through_running() {
        let registry = registry(slow_stages(Duration::from_millis(50)));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        let mut seen = vec![registry.get(id).await.unwrap().status];
        registry.stop(id).await.unwrap();

        let snapshot = wait_terminal(&registry, id).await;
        seen.push(snapshot.status);
        assert_eq!(seen, vec![RunStatus::Running, RunStatus::Stopped]);
        assert!(snapshot.progress < 100);

        let messages: Vec<&str> = snapshot.logs.iter().map(|l| l.message.as_str()).collect();
        let started = messages.iter().position(|m| m.starts_with("Run started")).unwrap();
        let stopped = messages.iter().position(|m| m.starts_with("Run stopped before")).unwrap();
        assert!(started < stopped);
    }

    #[tokio::test]
    async fn test_delete_removes_run() {
        let registry = registry(slow_stages(Duration::from_millis(50)));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        registry.delete(id).await.unwrap();
        assert!(matches!(registry.get(id).await, Err(RegistryError::NotFound { .. })));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_run() {
        let registry = registry(vec![Arc::new(Panicky)]);
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        let snapshot = wait_terminal(&registry, id).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.findings.iter().any(|f| f.text.contains("execution-error")));
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let registry = registry(slow_stages(Duration::ZERO));
        let a = registry.submit(RunInput::new("http://a.local/")).await.unwrap();
        let b = registry.submit(RunInput::new("http://b.local/")).await.unwrap();
        wait_terminal(&registry, a).await;
        wait_terminal(&registry, b).await;

        assert_eq!(registry.list().await.unwrap().len(), 2);
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.completed_runs, 2);
        assert_eq!(stats.active_runs, 0);
        assert_eq!(stats.total_flags, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_live_runs() {
        let registry = registry(slow_stages(Duration::from_millis(100)));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.shutdown(Duration::from_secs(2)).await;
        let snapshot = registry.get(id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert!(snapshot.logs.iter().any(|l| l.message.contains("shutting down")));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_engines_past_grace() {
        let registry = registry(slow_stages(Duration::from_secs(30)));
        let id = registry.submit(RunInput::new("http://ctf.local/")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.shutdown(Duration::from_millis(50)).await;
        let snapshot = registry.get(id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.findings.iter().any(|f| f.text.contains("aborted")));
    }
}
