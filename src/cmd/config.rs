//! Configuration view and validation: `ratchet config`.

use anyhow::Result;
use console::style;
use std::path::Path;

use ratchet::ratchet_config::{RatchetConfig, RatchetToml};

use crate::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = RatchetConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No ratchet.toml found at {}, using defaults", config_path.display());
            }
            println!();
            println!("{}", style("Effective values (with env overrides):").underlined());
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("ratchet.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.ratchet_dir)?;
            RatchetToml::default().save(&config_path)?;
            println!("Created ratchet.toml at {}", config_path.display());
        }
    }

    Ok(())
}
