//! Provisioning run: `vpc-provision run`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::{Cli, RunArgs};
use vpc_provision::request::{CidrSize, ProvisioningRequest};

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn print_settings(request: &ProvisioningRequest) {
    println!();
    println!("{}", style("Determined settings").bold());
    println!("  Account ID      : {}", request.account_id);
    println!("  Segment name    : {}", request.name);
    println!("  Region          : {}", request.region);
    println!("  IP allocation   : {}", request.size);
    println!("  Manual CIDR     : {}", request.cidr_override.as_allocator_arg());
    println!("  Transit         : {}", yes_no(request.transit));
    println!("  Peering         : {}", yes_no(request.peering));
    println!("  Merge to trunk  : {}", yes_no(request.merge));
    println!("  Change record   : {}", request.change_record);
    println!("  Staging branch  : {}", request.branch_name());
    println!();
}

/// Run the saga and return the process exit code.
pub async fn cmd_run(cli: &Cli, state_dir: &Path, args: &RunArgs) -> Result<i32> {
    use dialoguer::Confirm;
    use vpc_provision::allocator::ScriptAllocator;
    use vpc_provision::checkpoint::CheckpointStore;
    use vpc_provision::cloud::AwsCli;
    use vpc_provision::config::Config;
    use vpc_provision::errors::SagaError;
    use vpc_provision::iac::Terraform;
    use vpc_provision::logging;
    use vpc_provision::orchestrator::{Collaborators, Saga, ScriptPeeringGenerator};
    use vpc_provision::request;
    use vpc_provision::tracker::GitVcs;
    use vpc_provision::ui::{SagaUI, report};

    let config = Config::new(state_dir.to_path_buf(), cli.verbose, cli.yes)?;
    config.ensure_directories()?;
    let _guard = logging::init(&config.log_dir, config.verbose)?;

    // An unparseable size is reported like any other validation failure
    let size = match args.size.parse::<CidrSize>() {
        Ok(size) => size,
        Err(e) => {
            let err = SagaError::Validation(vec![e.to_string()]);
            eprintln!("{} {}", style("✗").red().bold(), err);
            eprintln!("  {}", err.remediation());
            return Ok(err.exit_code());
        }
    };
    let request = ProvisioningRequest {
        account_id: args.account_id.trim().to_string(),
        name: args.name.trim().to_string(),
        region: args.region.trim().to_string(),
        size,
        cidr_override: args.cidr.parse().unwrap_or(request::CidrOverride::Auto),
        transit: args.transit,
        peering: args.peering,
        merge: args.merge,
        change_record: args.change_record.trim().to_string(),
    };

    print_settings(&request);

    // Invalid requests go straight to the saga, which rejects them untouched
    if !config.assume_yes && request::validate(&request).is_ok() {
        let proceed = Confirm::new()
            .with_prompt("Proceed with these settings?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if !proceed {
            println!("Aborted. Nothing was changed.");
            return Ok(0);
        }
    }

    let settings = config.toml.clone();
    let token = std::env::var(&settings.vcs.token_env).ok();
    let collaborators = Collaborators {
        allocator: Arc::new(ScriptAllocator::new(
            settings.allocator.command.clone(),
            settings.allocator.handoff,
            settings.workspace.scratch_dir.clone(),
        )),
        vcs: Arc::new(GitVcs::new(
            settings.vcs.remote.clone(),
            token,
            settings.vcs.author_name.clone(),
            settings.vcs.author_email.clone(),
        )),
        iac: Arc::new(Terraform::new(
            settings.iac.command.clone(),
            settings.iac.status,
            settings.iac.extra_apply_args.clone(),
        )),
        cloud: Arc::new(AwsCli::new(
            settings.cloud.command.clone(),
            settings.cloud.region.clone(),
            settings.workspace.scratch_dir.clone(),
        )),
        generator: Arc::new(ScriptPeeringGenerator::new(settings.peering.generator.clone())),
    };

    let store = CheckpointStore::new(&config.checkpoint_dir);
    let ui = Arc::new(SagaUI::new(config.verbose));
    let outcome = Saga::new(request, settings, collaborators, store)
        .with_ui(ui)
        .run()
        .await;

    let rendered = report::render(&outcome.checkpoint);
    if outcome.error.is_some() {
        eprintln!();
        eprintln!("{}", rendered);
    } else {
        println!();
        println!("{}", rendered);
    }
    if let Some(ref path) = outcome.archive_path {
        println!();
        println!("{} {}", style("Checkpoint:").dim(), path.display());
    }

    Ok(outcome.exit_code())
}
