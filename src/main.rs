use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use flagforge::config::FlagforgeToml;
use flagforge_common::RunStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "flagforge")]
#[command(version, about = "LLM-driven solver for web CTF challenges")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to flagforge.toml (defaults to .flagforge/flagforge.toml)
    #[arg(long, global = true, env = "FLAGFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the run API over HTTP
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable permissive CORS for a browser dashboard on another origin
        #[arg(long)]
        cors: bool,

        /// Seconds live runs get to reach a stage boundary on shutdown
        #[arg(long, default_value = "30")]
        shutdown_grace: u64,
    },
    /// Solve one challenge in-process and print what was found
    Solve {
        /// Challenge URL
        url: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// File with challenge source code to include in the analysis
        #[arg(long)]
        source: Option<PathBuf>,

        /// Flag format hint, e.g. 'CTF{*}'
        #[arg(long)]
        flag_format: Option<String>,

        #[arg(long)]
        hint: Option<String>,

        /// Print the final snapshot as JSON instead of a report
        #[arg(long)]
        json: bool,

        /// Keep going after the first flag (overrides engine.stop_on_flag)
        #[arg(long)]
        keep_going: bool,
    },
    /// List the tools available to the oracle
    Tools,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default flagforge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(cli.config.as_deref(), command.clone());
    }

    let config = FlagforgeToml::resolve(cli.config.as_deref())?;
    let log_guard = flagforge::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve {
            host,
            port,
            cors,
            shutdown_grace,
        } => {
            cmd::cmd_serve(
                config,
                host.clone(),
                *port,
                *cors,
                std::time::Duration::from_secs(*shutdown_grace),
            )
            .await?;
        }
        Commands::Solve {
            url,
            title,
            description,
            source,
            flag_format,
            hint,
            json,
            keep_going,
        } => {
            let request = cmd::SolveRequest {
                url: url.clone(),
                title: title.clone(),
                description: description.clone(),
                source: source.clone(),
                flag_format: flag_format.clone(),
                hint: hint.clone(),
                json: *json,
                keep_going: *keep_going,
            };
            let status = cmd::cmd_solve(config, request).await?;
            if status != RunStatus::Completed {
                drop(log_guard);
                std::process::exit(1);
            }
        }
        Commands::Tools => cmd::cmd_tools(&config)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
