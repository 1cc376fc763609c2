//! Configuration view and validation commands - `strata config`.

use anyhow::Result;
use strata::config::{CONFIG_FILE, STRATA_DIR, StrataToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let strata_dir = project_dir.join(STRATA_DIR);
    let config_path = strata_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Strata Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                StrataToml::load(&config_path)?
            } else {
                println!("No strata.toml found at {}", config_path.display());
                println!("Using default configuration.");
                StrataToml::default()
            };
            println!();

            println!("[environment]");
            println!("  stage = \"{}\"", toml.environment.stage);
            println!("  account = \"{}\"", toml.environment.account);
            println!("  region = \"{}\"", toml.environment.region);
            println!("  name_prefix = \"{}\"", toml.environment.name_prefix);
            println!();

            println!("[execution]");
            println!("  max_parallel = {}", toml.execution.max_parallel);
            if let Some(secs) = toml.execution.provision_timeout_secs {
                println!("  provision_timeout_secs = {}", secs);
            }
            println!();

            println!("[logging]");
            println!("  json = {}", toml.logging.json);
            println!("  level = \"{}\"", toml.logging.level);
            println!();

            // Effective values including env overrides
            let env = toml.environment();
            println!("Effective environment (with env overrides):");
            println!("  stage = \"{}\"", env.stage);
            println!("  account = \"{}\"", env.account);
            println!("  region = \"{}\"", env.region);
            println!("  name_prefix = \"{}\"", env.name_prefix);
            println!();

            if !config_path.exists() {
                println!("Run 'strata config init' to create a strata.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No strata.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = StrataToml::load(&config_path)?;
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
                println!("strata.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !strata_dir.exists() {
                std::fs::create_dir_all(&strata_dir)?;
            }

            StrataToml::default().save(&config_path)?;

            println!("Created strata.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [environment] stage, account, region, name_prefix");
            println!("  - [execution] max_parallel, provision_timeout_secs");
            println!("  - [logging] json, level");
            println!();
        }
    }

    Ok(())
}
