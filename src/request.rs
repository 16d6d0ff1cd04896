//! Provisioning request model and preflight validation.
//!
//! A [`ProvisioningRequest`] is built once from the CLI and never mutated
//! afterwards. [`validate`] runs before any external call; a failing report
//! stops the saga with nothing reserved, created or pushed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::LazyLock;

static ACCOUNT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("static regex"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));
static REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(us|ap|sa|eu|ca)-(east|west|northeast|southeast|south|central)-[1-3]$")
        .expect("static regex")
});

/// Smallest prefix the allocator accepts for a new request.
pub const MIN_REQUEST_PREFIX: u8 = 18;
/// Largest prefix the allocator accepts.
pub const MAX_PREFIX: u8 = 28;
/// The allocator may fall back to blocks this large while searching.
pub const MIN_FALLBACK_PREFIX: u8 = 16;

/// CIDR size class, written `/NN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CidrSize(u8);

impl CidrSize {
    pub fn new(prefix: u8) -> anyhow::Result<Self> {
        if !(MIN_FALLBACK_PREFIX..=MAX_PREFIX).contains(&prefix) {
            anyhow::bail!(
                "CIDR size /{} is outside /{}-/{}",
                prefix,
                MIN_FALLBACK_PREFIX,
                MAX_PREFIX
            );
        }
        Ok(Self(prefix))
    }

    pub fn prefix(self) -> u8 {
        self.0
    }

    /// Whether a new request may ask for this size.
    pub fn is_requestable(self) -> bool {
        (MIN_REQUEST_PREFIX..=MAX_PREFIX).contains(&self.0)
    }
}

impl std::fmt::Display for CidrSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl std::str::FromStr for CidrSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix('/').unwrap_or(s.trim());
        let prefix: u8 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid CIDR size '{}' (expected /18 - /28)", s))?;
        Self::new(prefix)
    }
}

impl TryFrom<String> for CidrSize {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CidrSize> for String {
    fn from(value: CidrSize) -> Self {
        value.to_string()
    }
}

/// Either let the allocator pick a free block, or force a specific one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "cidr")]
pub enum CidrOverride {
    Auto,
    Manual(String),
}

impl CidrOverride {
    /// Value passed to the allocator's `--manual_cidr` flag.
    pub fn as_allocator_arg(&self) -> &str {
        match self {
            CidrOverride::Auto => "no",
            CidrOverride::Manual(cidr) => cidr,
        }
    }
}

impl std::str::FromStr for CidrOverride {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "no" | "auto" => Ok(CidrOverride::Auto),
            other => Ok(CidrOverride::Manual(other.to_string())),
        }
    }
}

/// Parse `a.b.c.d/n` into its address and prefix length.
pub fn parse_ipv4_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

/// Everything the saga needs to provision one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub account_id: String,
    pub name: String,
    pub region: String,
    pub size: CidrSize,
    pub cidr_override: CidrOverride,
    pub transit: bool,
    pub peering: bool,
    pub merge: bool,
    pub change_record: String,
}

impl ProvisioningRequest {
    /// Region with dashes replaced, as used in IaC directory names.
    pub fn region_underscore(&self) -> String {
        self.region.replace('-', "_")
    }

    /// Staging branch name; a pure function of name, account and region.
    pub fn branch_name(&self) -> String {
        branch_name(&self.name, &self.account_id, &self.region)
    }
}

pub fn branch_name(name: &str, account_id: &str, region: &str) -> String {
    format!("hotfix/new_vpc_{}_{}_{}", name, account_id, region)
}

/// Violations found by [`validate`], in check order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check a request before anything external happens.
pub fn validate(request: &ProvisioningRequest) -> ValidationReport {
    let mut violations = Vec::new();

    if request.account_id.chars().count() != 12 {
        violations.push(format!(
            "Account ID '{}' must be exactly 12 characters (got {})",
            request.account_id,
            request.account_id.chars().count()
        ));
    } else if !ACCOUNT_ID_RE.is_match(&request.account_id) {
        violations.push(format!(
            "Account ID '{}' must contain digits only",
            request.account_id
        ));
    }

    if !NAME_RE.is_match(&request.name) {
        violations.push(format!(
            "Segment name '{}' may only contain letters, digits, '-' and '_'",
            request.name
        ));
    }

    if !REGION_RE.is_match(&request.region) {
        violations.push(format!("Region '{}' looks invalid", request.region));
    }

    if !request.size.is_requestable() {
        violations.push(format!(
            "IP allocation {} looks invalid (should be /{} - /{})",
            request.size, MIN_REQUEST_PREFIX, MAX_PREFIX
        ));
    }

    if let CidrOverride::Manual(cidr) = &request.cidr_override
        && parse_ipv4_cidr(cidr).is_none()
    {
        violations.push(format!("Manual CIDR '{}' is not an IPv4 CIDR block", cidr));
    }

    if request.change_record.trim().is_empty() {
        violations.push("Change record reference must not be empty".to_string());
    }

    ValidationReport { violations }
}

#[cfg(test)]
pub(crate) fn sample_request() -> ProvisioningRequest {
    ProvisioningRequest {
        account_id: "123456789012".to_string(),
        name: "test-seg".to_string(),
        region: "us-east-1".to_string(),
        size: CidrSize::new(24).unwrap(),
        cidr_override: CidrOverride::Auto,
        transit: false,
        peering: false,
        merge: true,
        change_record: "CHG0001".to_string(),
    }
}
