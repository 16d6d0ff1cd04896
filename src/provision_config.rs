//! Layered configuration for vpc-provision.
//!
//! Settings are read from `<state-dir>/provision.toml`, then individual
//! values may be overridden by environment variables, then by CLI flags.
//! Every field has a default so an empty or missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workspace]
//! vpc_repo = "/opt/terraform"
//! peering_repo = "/opt/terraform-shared-services"
//! scratch_dir = "/tmp"
//!
//! [vcs]
//! trunk = "master"
//! remote = "origin"
//! token_env = "GIT_TOKEN"
//!
//! [allocator]
//! command = "/opt/terraform/scripts/vpc-setup.py"
//! handoff = "files"
//!
//! [iac]
//! command = "terraform"
//! status = "exit-code"
//!
//! [peering.routes.internal]
//! current = "nonprod"
//! legacy = "legacy-nonprod"
//!
//! [cascade]
//! regional_root = "shared_services/{environment}/regional_{region_underscore}"
//! hybrid_root = "shared_services/hybrid/regional_{region_underscore}"
//! ```
//!
//! Path templates accept `{environment}`, `{region}`, `{region_underscore}`,
//! `{name}`, `{name_lower}`, `{resource}` and `{account_id}`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the config inside the state directory.
pub const CONFIG_FILE: &str = "provision.toml";

/// Where the repositories and the allocator scratch space live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Repository holding per-account IaC (the allocator writes here)
    #[serde(default = "default_vpc_repo")]
    pub vpc_repo: PathBuf,
    /// Shared-services repository receiving peering acceptance code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peering_repo: Option<PathBuf>,
    /// Directory the allocator uses for single-value handoff files
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

fn default_vpc_repo() -> PathBuf {
    PathBuf::from("/opt/terraform")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            vpc_repo: default_vpc_repo(),
            peering_repo: None,
            scratch_dir: default_scratch_dir(),
        }
    }
}

/// Version-control settings shared by both staging repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsSection {
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Environment variable holding the HTTPS token (unset = use ambient credentials)
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_trunk() -> String {
    "master".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_token_env() -> String {
    "GIT_TOKEN".to_string()
}

fn default_author_name() -> String {
    "vpc-provision".to_string()
}

fn default_author_email() -> String {
    "vpc-provision@localhost".to_string()
}

impl Default for VcsSection {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            remote: default_remote(),
            token_env: default_token_env(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// How the allocator hands its results back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// One JSON object on stdout
    Json,
    /// Single-value files in the scratch directory
    #[default]
    Files,
}

impl std::fmt::Display for HandoffMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffMode::Json => write!(f, "json"),
            HandoffMode::Files => write!(f, "files"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSection {
    #[serde(default = "default_allocator_command")]
    pub command: String,
    #[serde(default)]
    pub handoff: HandoffMode,
}

fn default_allocator_command() -> String {
    "/opt/terraform/scripts/vpc-setup.py".to_string()
}

impl Default for AllocatorSection {
    fn default() -> Self {
        Self {
            command: default_allocator_command(),
            handoff: HandoffMode::default(),
        }
    }
}

/// How success of an IaC invocation is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusMode {
    /// Process exit status
    #[default]
    ExitCode,
    /// Exit status plus the tool's textual completion markers
    Markers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacSection {
    #[serde(default = "default_iac_command")]
    pub command: String,
    #[serde(default)]
    pub status: StatusMode,
    /// Address of the legacy parameter imported after the targeted apply
    #[serde(default = "default_legacy_import_address")]
    pub legacy_import_address: String,
    /// Import id of the legacy parameter
    #[serde(default = "default_legacy_import_id")]
    pub legacy_import_id: String,
    /// Extra arguments appended to every apply
    #[serde(default)]
    pub extra_apply_args: Vec<String>,
}

fn default_iac_command() -> String {
    "terraform".to_string()
}

fn default_legacy_import_address() -> String {
    "module.common_{name_lower}.aws_ssm_parameter.vpc_id".to_string()
}

fn default_legacy_import_id() -> String {
    "/network/vpc/{name_lower}/id".to_string()
}

impl Default for IacSection {
    fn default() -> Self {
        Self {
            command: default_iac_command(),
            status: StatusMode::default(),
            legacy_import_address: default_legacy_import_address(),
            legacy_import_id: default_legacy_import_id(),
            extra_apply_args: Vec::new(),
        }
    }
}

/// Acceptance-route identifiers for one account classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePair {
    pub current: String,
    pub legacy: String,
}

impl RoutePair {
    fn new(current: &str, legacy: &str) -> Self {
        Self {
            current: current.to_string(),
            legacy: legacy.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringSection {
    #[serde(default = "default_generator")]
    pub generator: String,
    /// Acceptance root inside the peering repository
    #[serde(default = "default_acceptance_root")]
    pub acceptance_root: String,
    /// Classification name -> route identifiers
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<String, RoutePair>,
}

fn default_generator() -> String {
    "/opt/terraform/scripts/generate-peering-routes.py".to_string()
}

fn default_acceptance_root() -> String {
    "shared_services/{environment}/peering_{region_underscore}".to_string()
}

fn default_routes() -> BTreeMap<String, RoutePair> {
    BTreeMap::from([
        ("internal".to_string(), RoutePair::new("nonprod", "legacy-nonprod")),
        (
            "nonproduction-customer".to_string(),
            RoutePair::new("prod", "legacy-customer"),
        ),
        ("production".to_string(), RoutePair::new("prod", "legacy-prod")),
        (
            "production-pci".to_string(),
            RoutePair::new("prod-pci", "legacy-prod-pci"),
        ),
    ])
}

impl Default for PeeringSection {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            acceptance_root: default_acceptance_root(),
            routes: default_routes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeSection {
    #[serde(default = "default_regional_root")]
    pub regional_root: String,
    #[serde(default = "default_hybrid_root")]
    pub hybrid_root: String,
    #[serde(default = "default_policy_bucket")]
    pub policy_bucket: String,
    #[serde(default = "default_bucket_statement_sid")]
    pub bucket_statement_sid: String,
    #[serde(default = "default_kms_key_id")]
    pub kms_key_id: String,
    #[serde(default = "default_key_statement_sid")]
    pub key_statement_sid: String,
    #[serde(default = "default_template_bucket")]
    pub template_bucket: String,
    #[serde(default = "default_template_key")]
    pub template_key: String,
    #[serde(default = "default_stack_name")]
    pub stack_name: String,
    /// Role assumed in the customer account for the stack deploy
    #[serde(default = "default_deploy_role")]
    pub deploy_role: String,
}

fn default_regional_root() -> String {
    "shared_services/{environment}/regional_{region_underscore}".to_string()
}

fn default_hybrid_root() -> String {
    "shared_services/hybrid/regional_{region_underscore}".to_string()
}

fn default_policy_bucket() -> String {
    "transit-poller-artifacts".to_string()
}

fn default_bucket_statement_sid() -> String {
    "AllowTransitAccounts".to_string()
}

fn default_kms_key_id() -> String {
    "alias/transit-poller".to_string()
}

fn default_key_statement_sid() -> String {
    "AllowTransitAccountsDecrypt".to_string()
}

fn default_template_bucket() -> String {
    "transit-poller-artifacts".to_string()
}

fn default_template_key() -> String {
    "templates/transit-poller.yaml".to_string()
}

fn default_stack_name() -> String {
    "transit-attachment-poller".to_string()
}

fn default_deploy_role() -> String {
    "CloudServicesProvisioning".to_string()
}

impl Default for CascadeSection {
    fn default() -> Self {
        Self {
            regional_root: default_regional_root(),
            hybrid_root: default_hybrid_root(),
            policy_bucket: default_policy_bucket(),
            bucket_statement_sid: default_bucket_statement_sid(),
            kms_key_id: default_kms_key_id(),
            key_statement_sid: default_key_statement_sid(),
            template_bucket: default_template_bucket(),
            template_key: default_template_key(),
            stack_name: default_stack_name(),
            deploy_role: default_deploy_role(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSection {
    #[serde(default = "default_cloud_command")]
    pub command: String,
    /// Region used for global or management-account calls
    #[serde(default = "default_cloud_region")]
    pub region: String,
}

fn default_cloud_command() -> String {
    "aws".to_string()
}

fn default_cloud_region() -> String {
    "us-west-2".to_string()
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            command: default_cloud_command(),
            region: default_cloud_region(),
        }
    }
}

/// The complete provision.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionToml {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub vcs: VcsSection,
    #[serde(default)]
    pub allocator: AllocatorSection,
    #[serde(default)]
    pub iac: IacSection,
    #[serde(default)]
    pub peering: PeeringSection,
    #[serde(default)]
    pub cascade: CascadeSection,
    #[serde(default)]
    pub cloud: CloudSection,
}

impl ProvisionToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse provision.toml")
    }

    /// Load `<state_dir>/provision.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize provision.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `VPC_PROVISION_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VPC_PROVISION_VPC_REPO") {
            self.workspace.vpc_repo = PathBuf::from(v);
        }
        if let Some(v) = lookup("VPC_PROVISION_PEERING_REPO") {
            self.workspace.peering_repo = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("VPC_PROVISION_SCRATCH_DIR") {
            self.workspace.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VPC_PROVISION_ALLOCATOR") {
            self.allocator.command = v;
        }
        if let Some(v) = lookup("VPC_PROVISION_IAC_CMD") {
            self.iac.command = v;
        }
        if let Some(v) = lookup("VPC_PROVISION_AWS_CMD") {
            self.cloud.command = v;
        }
    }

    /// Route identifiers for a classification name, if one is mapped.
    pub fn routes_for(&self, classification: &str) -> Option<&RoutePair> {
        self.peering.routes.get(classification)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (label, value) in [
            ("allocator.command", &self.allocator.command),
            ("iac.command", &self.iac.command),
            ("peering.generator", &self.peering.generator),
            ("cloud.command", &self.cloud.command),
            ("vcs.trunk", &self.vcs.trunk),
            ("cascade.regional_root", &self.cascade.regional_root),
            ("cascade.hybrid_root", &self.cascade.hybrid_root),
            ("peering.acceptance_root", &self.peering.acceptance_root),
        ] {
            if value.trim().is_empty() {
                warnings.push(format!("{} is empty", label));
            }
        }

        for template in [
            &self.cascade.regional_root,
            &self.cascade.hybrid_root,
            &self.peering.acceptance_root,
            &self.iac.legacy_import_address,
            &self.iac.legacy_import_id,
        ] {
            for placeholder in unknown_placeholders(template) {
                warnings.push(format!(
                    "Unknown placeholder '{{{}}}' in '{}'",
                    placeholder, template
                ));
            }
        }

        for (classification, pair) in &self.peering.routes {
            if pair.current.trim().is_empty() || pair.legacy.trim().is_empty() {
                warnings.push(format!(
                    "Route mapping for '{}' must set both current and legacy",
                    classification
                ));
            }
        }

        if self.workspace.peering_repo.is_none() {
            warnings.push(
                "workspace.peering_repo is not set; requests with peering=yes will fail to bind"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Placeholders understood by [`expand_template`].
pub const PLACEHOLDERS: &[&str] = &[
    "environment",
    "region",
    "region_underscore",
    "name",
    "name_lower",
    "resource",
    "account_id",
];

fn unknown_placeholders(template: &str) -> Vec<String> {
    let mut unknown = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let key = &rest[start + 1..start + len];
        if !PLACEHOLDERS.contains(&key) {
            unknown.push(key.to_string());
        }
        rest = &rest[start + len + 1..];
    }
    unknown
}

/// Replace `{key}` placeholders with their values.
pub fn expand_template(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = ProvisionToml::parse("").unwrap();
        assert_eq!(cfg.vcs.trunk, "master");
        assert_eq!(cfg.iac.command, "terraform");
        assert_eq!(cfg.iac.status, StatusMode::ExitCode);
        assert_eq!(cfg.allocator.handoff, HandoffMode::Files);
        assert_eq!(cfg.peering.routes.len(), 4);
    }

    #[test]
    fn test_parse_sections() {
        let cfg = ProvisionToml::parse(
            r#"
[workspace]
vpc_repo = "/srv/tf"
peering_repo = "/srv/ss"

[allocator]
handoff = "json"

[iac]
status = "markers"
extra_apply_args = ["-parallelism=4"]

[peering.routes.internal]
current = "np-accept"
legacy = "np-legacy"
"#,
        )
        .unwrap();
        assert_eq!(cfg.workspace.vpc_repo, PathBuf::from("/srv/tf"));
        assert_eq!(cfg.workspace.peering_repo, Some(PathBuf::from("/srv/ss")));
        assert_eq!(cfg.allocator.handoff, HandoffMode::Json);
        assert_eq!(cfg.iac.status, StatusMode::Markers);
        assert_eq!(cfg.iac.extra_apply_args, vec!["-parallelism=4"]);
        // A partial routes table replaces the default map
        assert_eq!(cfg.routes_for("internal").unwrap().current, "np-accept");
        assert!(cfg.routes_for("production").is_none());
    }

    #[test]
    fn test_invalid_enum_is_rejected() {
        assert!(ProvisionToml::parse("[iac]\nstatus = \"vibes\"\n").is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut cfg = ProvisionToml::default();
        cfg.workspace.peering_repo = Some(PathBuf::from("/srv/ss"));
        cfg.save(&dir.path().join(CONFIG_FILE)).unwrap();
        let loaded = ProvisionToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.workspace.peering_repo, cfg.workspace.peering_repo);
        assert_eq!(loaded.peering.routes, cfg.peering.routes);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let cfg = ProvisionToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.cloud.command, "aws");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("VPC_PROVISION_VPC_REPO", "/override/tf"),
            ("VPC_PROVISION_IAC_CMD", "tofu"),
        ]);
        let mut cfg = ProvisionToml::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.workspace.vpc_repo, PathBuf::from("/override/tf"));
        assert_eq!(cfg.iac.command, "tofu");
        assert_eq!(cfg.allocator.command, default_allocator_command());
    }

    #[test]
    fn test_validate_flags_unknown_placeholder() {
        let mut cfg = ProvisionToml::default();
        cfg.workspace.peering_repo = Some(PathBuf::from("/srv/ss"));
        assert!(cfg.validate().is_empty());

        cfg.cascade.hybrid_root = "hybrid/{zone}".to_string();
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("{zone}"));
    }

    #[test]
    fn test_validate_flags_missing_peering_repo() {
        let cfg = ProvisionToml::default();
        assert!(cfg.validate().iter().any(|w| w.contains("peering_repo")));
    }

    #[test]
    fn test_expand_template() {
        let out = expand_template(
            "shared_services/{environment}/regional_{region_underscore}",
            &[("environment", "prod"), ("region_underscore", "us_east_1")],
        );
        assert_eq!(out, "shared_services/prod/regional_us_east_1");
    }
}
