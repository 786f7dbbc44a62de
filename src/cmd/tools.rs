//! Tool listing command: `flagforge tools`.

use anyhow::Result;
use console::style;
use flagforge::config::FlagforgeToml;
use flagforge::tools::default_registry;

pub fn cmd_tools(config: &FlagforgeToml) -> Result<()> {
    let registry = default_registry(&config.tools)?;
    let default_timeout = config.tools.default_timeout_secs;

    println!();
    println!("{} ({})", style("Available tools").bold(), registry.len());
    println!();
    for descriptor in registry.descriptors() {
        let timeout = descriptor
            .timeout
            .map(|t| t.as_secs())
            .unwrap_or(default_timeout);
        println!("  {:<18} {}s  {}", style(&descriptor.name).cyan(), timeout, descriptor.description);
    }
    println!();
    Ok(())
}
