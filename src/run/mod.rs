//! Per-run state and its single-writer handles.

pub mod handle;
pub mod state;

pub use handle::{RunReader, RunWriter, new_run};
pub use state::{RunState, normalize_url};
