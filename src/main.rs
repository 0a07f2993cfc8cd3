use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devjobs::config::{CliOverrides, DevJobsToml};
use devjobs::telemetry::{self, LogFormat};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "devjobs")]
#[command(version, about = "Run build and test commands and stream their output over HTTP")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to devjobs.toml. Defaults to .devjobs/devjobs.toml, then the user config dir.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: pretty, json
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Server URL for client commands. Overrides DEVJOBS_SERVER_URL and devjobs.toml.
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Bearer token. Overrides DEVJOBS_TOKEN and devjobs.toml.
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the job server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, listen on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Build one configured target and stream its output
    Build {
        /// Target name from [builds.targets]
        target: String,

        /// Also write the output, capped at client.log_cap_chars, to this file
        #[arg(long)]
        save_log: Option<PathBuf>,
    },
    /// Run the full rebuild command and stream its output
    Rebuild {
        /// Also write the output, capped at client.log_cap_chars, to this file
        #[arg(long)]
        save_log: Option<PathBuf>,
    },
    /// Start a test run and poll it until it finishes
    Test {
        /// Only run tests matching this pattern
        #[arg(short, long, default_value = "")]
        pattern: String,

        /// Collect coverage and print the summary afterwards
        #[arg(long)]
        coverage: bool,

        /// Also write the output, capped at client.log_cap_chars, to this file
        #[arg(long)]
        save_log: Option<PathBuf>,
    },
    /// Show a job's status and output from an offset
    Status {
        job_id: String,

        /// Byte offset to read output from
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Cancel a running job
    Cancel { job_id: String },
    /// List jobs known to the server
    Jobs,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default devjobs.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_format, cli.verbose)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone());
    }

    let mut config = DevJobsToml::load_or_default(cli.config.as_deref(), &project_dir)?;
    config.overrides = CliOverrides {
        port: None,
        token: cli.token.clone(),
        server_url: cli.server.clone(),
        dev_mode: false,
    };

    match &cli.command {
        Commands::Serve { port, dev } => {
            config.overrides.port = *port;
            config.overrides.dev_mode = *dev;
            cmd::cmd_serve(config, project_dir).await?;
        }
        Commands::Build { target, save_log } => {
            cmd::cmd_build(&config, Some(target), save_log.as_deref()).await?
        }
        Commands::Rebuild { save_log } => {
            cmd::cmd_build(&config, None, save_log.as_deref()).await?
        }
        Commands::Test {
            pattern,
            coverage,
            save_log,
        } => cmd::cmd_test(&config, pattern.clone(), *coverage, save_log.as_deref()).await?,
        Commands::Status { job_id, offset } => cmd::cmd_status(&config, job_id, *offset).await?,
        Commands::Cancel { job_id } => cmd::cmd_cancel(&config, job_id).await?,
        Commands::Jobs => cmd::cmd_jobs(&config).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
