use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::provision_config::{CONFIG_FILE, ProvisionToml};

/// Default state directory, relative to the working directory.
pub const STATE_DIR: &str = ".vpc-provision";

/// Runtime configuration for a provisioning run.
///
/// Resolves the state directory layout and carries the parsed
/// `provision.toml` (with environment overrides applied).
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub config_file: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub assume_yes: bool,
    pub toml: ProvisionToml,
}

impl Config {
    pub fn new(state_dir: PathBuf, verbose: bool, assume_yes: bool) -> Result<Self> {
        let mut toml = ProvisionToml::load_or_default(&state_dir)?;
        toml.apply_env_overrides();
        Ok(Self::from_parts(state_dir, verbose, assume_yes, toml))
    }

    pub fn from_parts(
        state_dir: PathBuf,
        verbose: bool,
        assume_yes: bool,
        toml: ProvisionToml,
    ) -> Self {
        Self {
            config_file: state_dir.join(CONFIG_FILE),
            checkpoint_dir: state_dir.join("checkpoints"),
            log_dir: state_dir.join("logs"),
            state_dir,
            verbose,
            assume_yes,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(self.checkpoint_dir.join("runs"))
            .context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
