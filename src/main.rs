use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "vpc-provision")]
#[command(version, about = "Provision a network segment: allocate, stage, apply, peer and merge")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip the confirmation prompt
    #[arg(long, global = true)]
    pub yes: bool,

    /// State directory holding provision.toml, checkpoints and logs
    #[arg(long, global = true, env = "VPC_PROVISION_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a new VPC end to end
    Run(RunArgs),
    /// Print the staging branch name for a request
    BranchName {
        #[arg(long)]
        name: String,
        #[arg(long)]
        account_id: String,
        #[arg(long)]
        region: String,
    },
    /// Inspect persisted checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        other => Err(format!("expected yes or no, got '{}'", other)),
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// 12-digit account id
    #[arg(long)]
    pub account_id: String,

    /// Segment name
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub region: String,

    /// CIDR size, /18 - /28
    #[arg(long)]
    pub size: String,

    /// `auto` or a specific IPv4 CIDR block
    #[arg(long)]
    pub cidr: String,

    #[arg(long, required = true, action = ArgAction::Set, value_parser = parse_yes_no)]
    pub transit: bool,

    #[arg(long, required = true, action = ArgAction::Set, value_parser = parse_yes_no)]
    pub peering: bool,

    #[arg(long, required = true, action = ArgAction::Set, value_parser = parse_yes_no)]
    pub merge: bool,

    /// Change record cited in commit messages
    #[arg(long)]
    pub change_record: String,
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Render the current checkpoint, or the most recent archived run
    Show {
        /// Render this checkpoint file instead
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List archived runs, newest first
    List,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default provision.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(vpc_provision::config::STATE_DIR));

    let code = match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, &state_dir, args).await?,
        Commands::BranchName {
            name,
            account_id,
            region,
        } => {
            println!(
                "{}",
                vpc_provision::request::branch_name(name, account_id, region)
            );
            0
        }
        Commands::Checkpoint { command } => {
            cmd::cmd_checkpoint(&state_dir, command.clone())?;
            0
        }
        Commands::Config { command } => {
            cmd::cmd_config(&state_dir, command.clone())?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
