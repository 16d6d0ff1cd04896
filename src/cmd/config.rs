//! Configuration view and validation commands: `vpc-provision config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(state_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use vpc_provision::config::Config;
    use vpc_provision::provision_config::{CONFIG_FILE, ProvisionToml};

    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("vpc-provision Configuration");
            println!("===========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No provision.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values include environment overrides
            let config = Config::new(state_dir.to_path_buf(), false, false)?;
            let toml = &config.toml;

            println!("[workspace]");
            println!("  vpc_repo = \"{}\"", toml.workspace.vpc_repo.display());
            match &toml.workspace.peering_repo {
                Some(path) => println!("  peering_repo = \"{}\"", path.display()),
                None => println!("  peering_repo = (unset)"),
            }
            println!("  scratch_dir = \"{}\"", toml.workspace.scratch_dir.display());
            println!();

            println!("[vcs]");
            println!("  trunk = \"{}\"", toml.vcs.trunk);
            println!("  remote = \"{}\"", toml.vcs.remote);
            println!("  token_env = \"{}\"", toml.vcs.token_env);
            println!();

            println!("[allocator]");
            println!("  command = \"{}\"", toml.allocator.command);
            println!("  handoff = \"{}\"", toml.allocator.handoff);
            println!();

            println!("[iac]");
            println!("  command = \"{}\"", toml.iac.command);
            println!("  status = {:?}", toml.iac.status);
            println!();

            println!("[peering]");
            println!("  generator = \"{}\"", toml.peering.generator);
            println!("  acceptance_root = \"{}\"", toml.peering.acceptance_root);
            for (classification, pair) in &toml.peering.routes {
                println!(
                    "  routes.{} = {} / {}",
                    classification, pair.current, pair.legacy
                );
            }
            println!();

            println!("[cascade]");
            println!("  regional_root = \"{}\"", toml.cascade.regional_root);
            println!("  hybrid_root = \"{}\"", toml.cascade.hybrid_root);
            println!("  stack_name = \"{}\"", toml.cascade.stack_name);
            println!();

            println!("[cloud]");
            println!("  command = \"{}\"", toml.cloud.command);
            println!("  region = \"{}\"", toml.cloud.region);
            println!();

            if !config_path.exists() {
                println!("Run 'vpc-provision config init' to create a provision.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                ProvisionToml::load(&config_path)?
            } else {
                println!("No provision.toml found. Checking defaults.");
                ProvisionToml::default()
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
                println!("provision.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(state_dir)?;
            ProvisionToml::default().save(&config_path)?;

            println!("Created provision.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [workspace] vpc_repo, peering_repo, scratch_dir");
            println!("  - [allocator] command, handoff");
            println!("  - [peering.routes.<classification>] current, legacy");
            println!();
        }
    }

    Ok(())
}
