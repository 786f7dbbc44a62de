//! Run API server command: `flagforge serve`.

use std::time::Duration;

use anyhow::Result;
use flagforge::config::FlagforgeToml;
use flagforge::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: FlagforgeToml,
    host: Option<String>,
    port: Option<u16>,
    cors: bool,
    shutdown_grace: Duration,
) -> Result<()> {
    let registry = super::build_run_registry(&config)?;

    start_server(
        ServerConfig {
            host: host.unwrap_or(config.server.host),
            port: port.unwrap_or(config.server.port),
            permissive_cors: cors,
            shutdown_grace,
        },
        registry,
    )
    .await
}
