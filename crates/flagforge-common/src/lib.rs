//! Shared domain types for flagforge.
//!
//! Everything in this crate is plain data: the enums that describe where a
//! run is in its pipeline, the records a run accumulates, and the read-only
//! snapshot handed to polling clients. Mutation rules live in the main crate.

pub mod records;
pub mod snapshot;
pub mod status;

pub use records::{Finding, Flag, FormDescriptor, FormField, FuzzTask, FuzzTaskStatus, LogEntry, RunInput, Vulnerability};
pub use snapshot::{RunSnapshot, RunStats, RunSummary};
pub use status::{RunStatus, Severity, Stage};

/// Identifier of a single run.
pub type RunId = uuid::Uuid;
