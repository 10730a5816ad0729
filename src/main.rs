use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::{CliOverrides, ConductorConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-phase generation pipeline engine")]
pub struct Cli {
    /// Log at debug level unless a level is given explicitly
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve every gavel without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    /// Path to conductor.toml
    #[arg(long, global = true, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding run snapshots. Overrides conductor.toml.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "conductor=debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate a pipeline definition
    Validate {
        /// Pipeline file (YAML or JSON)
        pipeline: PathBuf,
    },
    /// Run a pipeline with the workers configured in conductor.toml
    Run {
        /// Pipeline file (YAML or JSON)
        pipeline: PathBuf,

        /// Run input text
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the run input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// File whose content becomes the instructions block
        #[arg(long)]
        instructions: Option<PathBuf>,

        /// Retry budget for actions that set none
        #[arg(long)]
        retry_count: Option<u32>,
    },
    /// Show a stored run, or list stored runs
    Inspect {
        /// Run id (omit to list runs)
        run_id: Option<String>,
    },
    /// Write a stored run's snapshot to a file
    Export {
        run_id: String,

        #[arg(short, long)]
        output: PathBuf,
    },
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
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let retry_count = match &self.command {
            Commands::Run { retry_count, .. } => *retry_count,
            _ => None,
        };
        CliOverrides {
            state_dir: self.state_dir.clone(),
            log_level: self
                .log_level
                .clone()
                .or_else(|| self.verbose.then(|| "debug".to_string())),
            retry_count,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(ConductorConfig::default_path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli.config_path();
    let config = ConductorConfig::resolve(&config_path, &cli.overrides())?;
    let _log_guard = conductor::telemetry::init(&config.logging)?;

    match &cli.command {
        Commands::Validate { pipeline } => cmd::cmd_validate(pipeline)?,
        Commands::Run {
            pipeline,
            input,
            input_file,
            instructions,
            ..
        } => {
            let request = cmd::RunRequest {
                pipeline: pipeline.clone(),
                input: input.clone(),
                input_file: input_file.clone(),
                instructions: instructions.clone(),
                auto_approve: cli.yes,
            };
            cmd::cmd_run(&config, request).await?;
        }
        Commands::Inspect { run_id } => cmd::cmd_inspect(&config, run_id.as_deref())?,
        Commands::Export { run_id, output } => cmd::cmd_export(&config, run_id, output)?,
        Commands::Config { command } => cmd::cmd_config(&config_path, &config, command.clone())?,
    }

    Ok(())
}
