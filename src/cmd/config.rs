//! Configuration view and validation: `conductor config`.

use anyhow::Result;
use std::path::Path;

use conductor::config::ConductorConfig;

use super::super::ConfigCommands;

pub fn cmd_config(path: &Path, config: &ConductorConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No config file at {}; using defaults.", path.display());
            }
            println!();

            let engine = &config.engine;
            println!("[engine]");
            println!("  default_retry_count = {}", engine.default_retry_count);
            println!("  action_timeout_secs = {}", engine.action_timeout_secs);
            println!("  phase_timeout_secs = {}", engine.phase_timeout_secs);
            println!("  retry_backoff_ms = {}", engine.retry_backoff_ms);
            println!("  max_backoff_ms = {}", engine.max_backoff_ms);
            println!("  rag_wait_secs = {}", engine.rag_wait_secs);
            println!("  gavel_timeout_secs = {}", engine.gavel_timeout_secs);
            println!();
            println!("[state]");
            println!("  dir = \"{}\"", config.state.dir.display());
            println!();
            println!("[logging]");
            println!("  level = \"{}\"", config.logging.level);
            println!("  format = \"{:?}\"", config.logging.format);
            if let Some(file) = &config.logging.file {
                println!("  file = \"{}\"", file.display());
            }

            if !config.workers.is_empty() {
                println!();
                println!("[workers]");
                for (id, worker) in &config.workers {
                    println!("  {} -> {}", id, worker.endpoint);
                }
            }
            if !config.teams.is_empty() {
                println!();
                println!("[teams]");
                for (team, members) in &config.teams {
                    println!("  {} = [{}]", team, members.join(", "));
                }
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
