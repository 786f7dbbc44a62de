//! Configuration view and validation commands: `flagforge config`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use flagforge::config::{CONFIG_DIR, CONFIG_FILE, FlagforgeToml};

use super::super::ConfigCommands;

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No flagforge.toml found at {}, using defaults.", config_path.display());
                println!("Run 'flagforge config init' to create one.");
            }
            println!();

            // Effective values include environment overrides.
            let config = FlagforgeToml::resolve(config_path.exists().then_some(config_path.as_path()))?;
            print!("{}", toml::to_string_pretty(&config)?);
            println!();
            match config.oracle.api_key() {
                Some(_) => println!("Oracle API key: set (from {})", config.oracle.api_key_env),
                None => println!("Oracle API key: not set ({} is empty)", config.oracle.api_key_env),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No flagforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = FlagforgeToml::load(&config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("flagforge.toml already exists at {}", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            FlagforgeToml::default().save(&config_path)?;

            println!("Created flagforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] iteration caps, crawl bounds, stop_on_flag");
            println!("  - [tools] timeouts and extra [[tools.commands]]");
            println!("  - [oracle] endpoint, model and backoff schedule");
            println!();
        }
    }

    Ok(())
}
