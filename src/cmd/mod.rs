//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `solve`  | `Solve`          |
//! | `tools`  | `Tools`          |
//! | `config` | `Config`         |

pub mod config;
pub mod serve;
pub mod solve;
pub mod tools;

use std::sync::Arc;

use anyhow::Result;
use flagforge::config::FlagforgeToml;
use flagforge::engine::Pipeline;
use flagforge::oracle::{OpenAiCompatOracle, RateLimitedClient};
use flagforge::projector::StatusProjector;
use flagforge::registry::RunRegistry;
use flagforge::tools::{ToolInvoker, default_registry};

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use solve::{SolveRequest, cmd_solve};
pub use tools::cmd_tools;

/// Wire the production pipeline from configuration.
pub fn build_run_registry(config: &FlagforgeToml) -> Result<RunRegistry> {
    let tools = ToolInvoker::new(
        Arc::new(default_registry(&config.tools)?),
        config.tools.invoker_settings(),
    );

    let oracle = OpenAiCompatOracle::new(&config.oracle)?;
    if !oracle.has_api_key() {
        tracing::warn!(
            env = %config.oracle.api_key_env,
            "no oracle API key set, requests will be sent unauthenticated"
        );
    }
    let client = RateLimitedClient::new(Arc::new(oracle), config.oracle.client_settings());

    let pipeline = Pipeline::new(tools, client, config.engine.settings());
    Ok(RunRegistry::new(
        Arc::new(pipeline),
        StatusProjector::new(config.engine.log_tail),
    ))
}
