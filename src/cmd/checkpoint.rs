//! Checkpoint inspection: `vpc-provision checkpoint`.

use anyhow::Result;
use std::path::Path;

use super::super::CheckpointCommands;

pub fn cmd_checkpoint(state_dir: &Path, command: CheckpointCommands) -> Result<()> {
    use vpc_provision::checkpoint::{CheckpointStore, SagaOutcome};
    use vpc_provision::config::Config;
    use vpc_provision::provision_config::ProvisionToml;
    use vpc_provision::ui::report;

    let config = Config::from_parts(
        state_dir.to_path_buf(),
        false,
        true,
        ProvisionToml::default(),
    );
    let store = CheckpointStore::new(&config.checkpoint_dir);

    match command {
        CheckpointCommands::Show { file } => {
            let checkpoint = match file {
                Some(path) => Some(store.load(&path)?),
                None => match store.load_current()? {
                    Some(current) => Some(current),
                    None => match store.list_runs()?.first() {
                        Some(latest) => Some(store.load(latest)?),
                        None => None,
                    },
                },
            };
            match checkpoint {
                Some(checkpoint) => {
                    println!("{}", report::render(&checkpoint));
                    println!();
                    println!("{}", checkpoint.render_remediation());
                }
                None => {
                    println!("No checkpoint found in {}", config.checkpoint_dir.display());
                }
            }
        }
        CheckpointCommands::List => {
            let runs = store.list_runs()?;
            if runs.is_empty() {
                println!("No archived runs in {}", config.checkpoint_dir.display());
                return Ok(());
            }
            for path in runs {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                match store.load(&path) {
                    Ok(cp) => {
                        let state = match cp.outcome {
                            SagaOutcome::Succeeded => "succeeded".to_string(),
                            SagaOutcome::SucceededUnmerged { .. } => "unmerged".to_string(),
                            SagaOutcome::Failed { ref class, .. } => format!("failed ({})", class),
                            SagaOutcome::InProgress => "in progress".to_string(),
                        };
                        println!(
                            "{}  {} {}/{}  {}",
                            file_name, cp.request.name, cp.request.account_id, cp.request.region, state
                        );
                    }
                    Err(e) => println!("{}  unreadable: {:#}", file_name, e),
                }
            }
        }
    }

    Ok(())
}
