//! flagforge: staged, oracle-driven runs against web challenges.
//!
//! A run walks Crawl → Summarize → ThreatModel → Fuzz under a
//! [`engine::WorkflowEngine`]; clients submit and poll runs through the
//! [`registry::RunRegistry`], directly or over the HTTP API in [`api`].

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod flags;
pub mod logging;
pub mod oracle;
pub mod projector;
pub mod registry;
pub mod retry;
pub mod run;
pub mod server;
pub mod tools;
