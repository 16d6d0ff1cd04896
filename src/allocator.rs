//! Client for the external CIDR allocator / IaC generator.
//!
//! The allocator reserves a CIDR block, writes the segment's IaC into the
//! account directory, and reports back what it did. Two return channels are
//! supported:
//!
//! - `json`: one JSON object printed on stdout (the structured contract)
//! - `files`: the legacy single-value files in a scratch directory
//!
//! The allocator guarantees it reserves nothing unless it exits zero, so an
//! allocation failure leaves no side effects behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::process;
use crate::provision_config::HandoffMode;
use crate::request::ProvisioningRequest;

/// Account classification as reported by the account mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountClassification {
    Internal,
    NonproductionCustomer,
    Production,
    ProductionPci,
    /// Anything else; rejected by stages that need a known classification.
    Unsupported(String),
}

impl AccountClassification {
    pub fn as_str(&self) -> &str {
        match self {
            AccountClassification::Internal => "internal",
            AccountClassification::NonproductionCustomer => "nonproduction-customer",
            AccountClassification::Production => "production",
            AccountClassification::ProductionPci => "production-pci",
            AccountClassification::Unsupported(other) => other,
        }
    }

    /// Shared-services environment the account is wired into.
    pub fn environment(&self) -> Option<&'static str> {
        match self {
            AccountClassification::Internal => Some("nonprod"),
            AccountClassification::NonproductionCustomer => Some("prod"),
            AccountClassification::Production => Some("prod"),
            AccountClassification::ProductionPci => Some("prod-pci"),
            AccountClassification::Unsupported(_) => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, AccountClassification::Internal)
    }
}

impl From<String> for AccountClassification {
    fn from(value: String) -> Self {
        match value.trim() {
            "internal" => AccountClassification::Internal,
            "nonproduction-customer" => AccountClassification::NonproductionCustomer,
            "production" => AccountClassification::Production,
            "production-pci" => AccountClassification::ProductionPci,
            other => AccountClassification::Unsupported(other.to_string()),
        }
    }
}

impl From<AccountClassification> for String {
    fn from(value: AccountClassification) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for AccountClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the allocator reserved and generated. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Name of the segment resource in generated IaC, e.g. `client_test-seg`
    pub resource_id: String,
    pub cidr: String,
    pub classification: AccountClassification,
    pub account_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_vpc_id: Option<String>,
    /// Set when the allocator had to create the account-regional directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_regional_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_parameter: Option<String>,
}

impl AllocationResult {
    /// IaC root holding the generated segment.
    pub fn environment_root(&self, region: &str) -> PathBuf {
        self.account_dir.join(format!(
            "environment_regional_{}",
            region.replace('-', "_")
        ))
    }

    /// Address of the core segment resource for the targeted apply.
    pub fn segment_address(&self) -> String {
        format!("aws_vpc.{}", self.resource_id)
    }
}

/// The allocator exited successfully, so a block is reserved, but its
/// result could not be read back.
#[derive(Debug, thiserror::Error)]
#[error("allocator reported success but its result could not be read: {0:#}")]
pub struct UnreadableHandoff(pub anyhow::Error);

#[async_trait]
pub trait AllocatorClient: Send + Sync {
    /// Reserve a block and generate IaC; blocks until the allocator exits.
    async fn allocate(&self, request: &ProvisioningRequest) -> Result<AllocationResult>;
}

/// Handoff file names written by the legacy allocator.
pub mod handoff {
    pub const RESOURCE_ID: &str = "vpc_module_name";
    pub const CIDR: &str = "vpc_cidr";
    pub const CLASSIFICATION: &str = "account_type";
    pub const ACCOUNT_DIR: &str = "account_dir";
    pub const SHARED_ZONE_ID: &str = "gts_bootstrap_zone_id";
    pub const SHARED_VPC_ID: &str = "ss_env_vpc_id";
    pub const REGIONAL_DIR: &str = "account_regional_dir";

    pub const ALL: &[&str] = &[
        RESOURCE_ID,
        CIDR,
        CLASSIFICATION,
        ACCOUNT_DIR,
        SHARED_ZONE_ID,
        SHARED_VPC_ID,
        REGIONAL_DIR,
    ];
}

/// Remove handoff files left by an earlier run so they can't be mistaken for ours.
pub fn clear_handoff_files(dir: &Path) -> Result<()> {
    for name in handoff::ALL {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale handoff file {}", path.display()))?;
        }
    }
    Ok(())
}

fn read_optional(dir: &Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let value = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read handoff file {}", path.display()))?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn read_required(dir: &Path, name: &str) -> Result<String> {
    read_optional(dir, name)?
        .with_context(|| format!("Allocator did not write '{}' in {}", name, dir.display()))
}

/// Build an [`AllocationResult`] from the legacy handoff files.
pub fn read_handoff_files(dir: &Path) -> Result<AllocationResult> {
    Ok(AllocationResult {
        resource_id: read_required(dir, handoff::RESOURCE_ID)?,
        cidr: read_required(dir, handoff::CIDR)?,
        classification: read_required(dir, handoff::CLASSIFICATION)?.into(),
        account_dir: PathBuf::from(read_required(dir, handoff::ACCOUNT_DIR)?),
        shared_zone_id: read_optional(dir, handoff::SHARED_ZONE_ID)?,
        shared_vpc_id: read_optional(dir, handoff::SHARED_VPC_ID)?,
        new_regional_dir: read_optional(dir, handoff::REGIONAL_DIR)?.map(PathBuf::from),
        config_parameter: None,
    })
}

/// Parse the structured result: the last stdout line holding a JSON object.
pub fn parse_json_handoff(stdout: &str) -> Result<AllocationResult> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<AllocationResult>(line).ok())
        .context("Allocator output contained no allocation result object")
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Runs the allocator script with its original argument contract.
pub struct ScriptAllocator {
    command: String,
    handoff: HandoffMode,
    scratch_dir: PathBuf,
}

impl ScriptAllocator {
    pub fn new(command: impl Into<String>, handoff: HandoffMode, scratch_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            handoff,
            scratch_dir,
        }
    }

    fn arguments(request: &ProvisioningRequest) -> Vec<String> {
        process::args([
            "--account_id",
            &request.account_id,
            "--name",
            &request.name,
            "--region",
            &request.region,
            "--ip_allocation",
            &request.size.to_string(),
            "--manual_cidr",
            request.cidr_override.as_allocator_arg(),
            "--transit",
            yes_no(request.transit),
            "--ss_peering",
            yes_no(request.peering),
        ])
    }
}

#[async_trait]
impl AllocatorClient for ScriptAllocator {
    async fn allocate(&self, request: &ProvisioningRequest) -> Result<AllocationResult> {
        if self.handoff == HandoffMode::Files {
            clear_handoff_files(&self.scratch_dir)?;
        }

        let output =
            process::run_command_line(&self.command, Self::arguments(request), None, &[]).await?;
        if !output.success() {
            anyhow::bail!("allocator {}", output.failure_summary());
        }

        let result = match self.handoff {
            HandoffMode::Json => parse_json_handoff(&output.stdout),
            HandoffMode::Files => read_handoff_files(&self.scratch_dir),
        }
        .map_err(UnreadableHandoff)?;
        tracing::info!(
            resource = %result.resource_id,
            cidr = %result.cidr,
            classification = %result.classification,
            "allocation complete"
        );
        Ok(result)
    }
}
