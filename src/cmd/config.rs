//! Configuration view and validation commands: `devjobs config`.

use anyhow::{Context, Result};
use devjobs::config::{CONFIG_FILE_NAME, DevJobsToml, PROJECT_CONFIG_DIR};
use std::path::{Path, PathBuf};

use super::super::ConfigCommands;

const REDACTED: &str = "********";

/// The file `config` subcommands read and write: `--config` when given,
/// otherwise the first existing default location, otherwise the project one.
fn resolve_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    DevJobsToml::default_locations(project_dir)
        .into_iter()
        .find(|p| p.exists())
        .unwrap_or_else(|| project_dir.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME))
}

fn redacted(config: &DevJobsToml) -> DevJobsToml {
    let mut shown = config.clone();
    if shown.auth.token.is_some() {
        shown.auth.token = Some(REDACTED.to_string());
    }
    if shown.client.token.is_some() {
        shown.client.token = Some(REDACTED.to_string());
    }
    shown
}

pub fn cmd_config(
    project_dir: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = resolve_path(project_dir, explicit);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("devjobs Configuration");
            println!("=====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                DevJobsToml::load(&config_path)?
            } else {
                println!("No devjobs.toml found at {}", config_path.display());
                println!("Using default configuration:");
                DevJobsToml::default()
            };
            println!();

            let rendered = toml::to_string_pretty(&redacted(&toml))
                .context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective values (with env overrides):");
            println!("  port = {}", toml.port());
            println!("  server_url = \"{}\"", toml.server_url());
            println!(
                "  token = {}",
                if toml.server_token().is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();

            if !config_path.exists() {
                println!("Run 'devjobs config init' to create a devjobs.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                DevJobsToml::load(&config_path)?
            } else {
                println!("No devjobs.toml found. Checking defaults.");
                DevJobsToml::default()
            };
            let warnings = toml.validate();

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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("devjobs.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            DevJobsToml::default().save(&config_path)?;

            println!("Created devjobs.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [auth] token (required before `devjobs serve`)");
            println!("  - [builds.targets.<name>] build commands");
            println!("  - [tests] test command, coverage and pattern arguments");
            println!();
        }
    }

    Ok(())
}
