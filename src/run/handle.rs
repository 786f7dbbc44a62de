use std::sync::{Arc, RwLock};

use flagforge_common::{RunId, RunInput, RunStatus, Stage};

use super::state::RunState;
use crate::errors::StateError;

/// Create the state for a new run and split it into its single writer and a
/// cloneable reader.
pub fn new_run(id: RunId, input: RunInput) -> (RunWriter, RunReader) {
    let state = Arc::new(RwLock::new(RunState::new(id, input)));
    (
        RunWriter {
            state: Arc::clone(&state),
        },
        RunReader { state },
    )
}

/// Exclusive mutation rights over one run. Deliberately not `Clone`: the
/// engine that owns it is the only writer.
///
/// Each [`RunWriter::update`] closure runs under the write lock, so a group of
/// related mutations (a flag plus its log line) becomes visible to readers
/// all at once. An update is not rolled back: if the closure fails partway,
/// the mutations it already made stay. Multi-step closures should go through
/// a `RunState` method that checks the status once up front, such as
/// [`RunState::record_flags`].
#[derive(Debug)]
pub struct RunWriter {
    state: Arc<RwLock<RunState>>,
}

impl RunWriter {
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut RunState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut guard = self.state.write().map_err(|_| StateError::LockPoisoned)?;
        f(&mut guard)
    }

    pub fn read<T>(&self, f: impl FnOnce(&RunState) -> T) -> Result<T, StateError> {
        let guard = self.state.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(f(&guard))
    }

    pub fn reader(&self) -> RunReader {
        RunReader {
            state: Arc::clone(&self.state),
        }
    }
}

/// Read-only view of a run, shared by the registry and the projector.
#[derive(Debug, Clone)]
pub struct RunReader {
    state: Arc<RwLock<RunState>>,
}

impl RunReader {
    /// Run `f` against a consistent view of the state.
    pub fn read<T>(&self, f: impl FnOnce(&RunState) -> T) -> Result<T, StateError> {
        let guard = self.state.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(f(&guard))
    }

    pub fn status(&self) -> Result<RunStatus, StateError> {
        self.read(|s| s.status())
    }

    /// Append a log line at the run's current stage, for stop and shutdown
    /// bookkeeping. Log append is the one mutation open to non-owners.
    pub fn append_note(&self, message: &str) -> Result<(), StateError> {
        let mut guard = self.state.write().map_err(|_| StateError::LockPoisoned)?;
        let stage = guard.current_stage();
        guard.append_log(stage, message);
        Ok(())
    }

    /// Used when the engine task died without reaching a terminal status.
    pub(crate) fn force_fail(&self, reason: &str) -> Result<(), StateError> {
        let mut guard = self.state.write().map_err(|_| StateError::LockPoisoned)?;
        if guard.is_terminal() {
            return Ok(());
        }
        let stage = guard.current_stage();
        guard.add_finding(stage, format!("execution-error: {reason}"))?;
        guard.append_log(stage, format!("Run failed: {reason}"));
        if guard.status() == RunStatus::Pending {
            guard.start()?;
        }
        guard.finish(RunStatus::Failed)
    }

    #[cfg(test)]
    pub(crate) fn current_stage(&self) -> Result<Stage, StateError> {
        self.read(|s| s.current_stage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sees_committed_writes() {
        let (writer, reader) = new_run(uuid::Uuid::new_v4(), RunInput::new("http://x/"));
        writer
            .update(|s| {
                s.start()?;
                s.record_flag("CTF{x}", Stage::Crawl)?;
                s.append_log(Stage::Crawl, "flag captured");
                Ok(())
            })
            .unwrap();
        let (flags, logs) = reader.read(|s| (s.flags().len(), s.logs().len())).unwrap();
        assert_eq!((flags, logs), (1, 1));
        assert_eq!(reader.status().unwrap(), RunStatus::Running);
        assert_eq!(reader.current_stage().unwrap(), Stage::Crawl);
    }

    #[test]
    fn test_append_note_after_terminal() {
        let (writer, reader) = new_run(uuid::Uuid::new_v4(), RunInput::new("http://x/"));
        writer
            .update(|s| {
                s.start()?;
                s.finish(RunStatus::Stopped)
            })
            .unwrap();
        reader.append_note("process shutting down").unwrap();
        let last = reader.read(|s| s.logs().last().cloned()).unwrap().unwrap();
        assert_eq!(last.message, "process shutting down");
        assert_eq!(last.stage, Stage::Done);
    }

    #[test]
    fn test_force_fail_leaves_explanation() {
        let (_writer, reader) = new_run(uuid::Uuid::new_v4(), RunInput::new("http://x/"));
        reader.force_fail("engine task panicked").unwrap();
        reader
            .read(|s| {
                assert_eq!(s.status(), RunStatus::Failed);
                assert_eq!(s.findings().len(), 1);
                assert!(s.logs()[0].message.contains("panicked"));
            })
            .unwrap();
        // already terminal: no-op
        reader.force_fail("again").unwrap();
        assert_eq!(reader.read(|s| s.findings().len()).unwrap(), 1);
    }
}
