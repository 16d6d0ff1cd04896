//! In-memory collaborators for stage and saga tests.
//!
//! Each fake records its calls as short strings so tests can assert on
//! order and count, and can be told to fail specific operations.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::allocator::{
    AccountClassification, AllocationResult, AllocatorClient, UnreadableHandoff,
};
use crate::cloud::{CloudClient, Credentials, StackDeployment};
use crate::iac::{IacEngine, IacRun};
use crate::orchestrator::peering::{PeeringGenerator, PeeringRequest, RouteScheme};
use crate::policy::account_root_arn;
use crate::provision_config::CascadeSection;
use crate::request::ProvisioningRequest;
use crate::tracker::VersionControl;

pub(crate) fn sample_allocation() -> AllocationResult {
    AllocationResult {
        resource_id: "client_test-seg".to_string(),
        cidr: "10.20.1.0/24".to_string(),
        classification: AccountClassification::Production,
        account_dir: PathBuf::from("accounts/123456789012"),
        shared_zone_id: Some("Z0SHAREDZONE".to_string()),
        shared_vpc_id: Some("vpc-0shared".to_string()),
        new_regional_dir: None,
        config_parameter: None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub(crate) struct FakeVcs {
    calls: Mutex<Vec<String>>,
    // `None` repo means the branch exists on every remote
    remote: Mutex<HashSet<(Option<PathBuf>, String)>>,
    local: Mutex<HashSet<(PathBuf, String)>>,
    // `None` repo means the operation fails in every repository
    failures: Mutex<HashSet<(String, Option<PathBuf>)>>,
    empty_commits: Mutex<bool>,
}

impl FakeVcs {
    pub fn add_remote_branch(&self, branch: &str) {
        lock(&self.remote).insert((None, branch.to_string()));
    }

    pub fn fail_on(&self, op: &str) {
        lock(&self.failures).insert((op.to_string(), None));
    }

    /// Fail `op` only when it acts on `repo`.
    pub fn fail_on_repo(&self, op: &str, repo: &Path) {
        lock(&self.failures).insert((op.to_string(), Some(repo.to_path_buf())));
    }

    /// Make every commit find nothing to commit.
    pub fn commit_nothing(&self) {
        *lock(&self.empty_commits) = true;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn enter(&self, op: &str, repo: &Path, call: String) -> Result<()> {
        lock(&self.calls).push(call);
        let failures = lock(&self.failures);
        if failures.contains(&(op.to_string(), None))
            || failures.contains(&(op.to_string(), Some(repo.to_path_buf())))
        {
            bail!("{} rejected by remote", op);
        }
        Ok(())
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn remote_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        self.enter("remote_branch_exists", repo, format!("remote_branch_exists {}", branch))?;
        let remote = lock(&self.remote);
        Ok(remote.contains(&(None, branch.to_string()))
            || remote.contains(&(Some(repo.to_path_buf()), branch.to_string())))
    }

    async fn local_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        self.enter("local_branch_exists", repo, format!("local_branch_exists {}", branch))?;
        Ok(lock(&self.local).contains(&(repo.to_path_buf(), branch.to_string())))
    }

    async fn create_branch(&self, repo: &Path, name: &str, base: &str) -> Result<()> {
        self.enter("create_branch", repo, format!("create_branch {} from {}", name, base))?;
        lock(&self.local).insert((repo.to_path_buf(), name.to_string()));
        Ok(())
    }

    async fn checkout_existing(&self, repo: &Path, name: &str) -> Result<()> {
        self.enter("checkout_existing", repo, format!("checkout_existing {}", name))?;
        lock(&self.local).insert((repo.to_path_buf(), name.to_string()));
        Ok(())
    }

    async fn commit_all(
        &self,
        repo: &Path,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<Option<String>> {
        let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        self.enter(
            "commit_all",
            repo,
            format!("commit_all {}: {}", paths.join(" "), message),
        )?;
        if *lock(&self.empty_commits) {
            return Ok(None);
        }
        Ok(Some("0123abcd".to_string()))
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<()> {
        self.enter("push", repo, format!("push {}", branch))?;
        lock(&self.remote).insert((Some(repo.to_path_buf()), branch.to_string()));
        Ok(())
    }

    async fn merge_into_trunk(&self, repo: &Path, branch: &str, trunk: &str) -> Result<()> {
        self.enter(
            "merge_into_trunk",
            repo,
            format!("merge_into_trunk {} into {}", branch, trunk),
        )
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.enter("delete_branch", repo, format!("delete_branch {}", branch))?;
        lock(&self.remote).remove(&(Some(repo.to_path_buf()), branch.to_string()));
        lock(&self.local).remove(&(repo.to_path_buf(), branch.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeIac {
    resource_id: Option<String>,
    calls: Mutex<Vec<String>>,
    // (operation, root); an empty root matches every root
    failures: Mutex<Vec<(&'static str, String)>>,
}

impl FakeIac {
    pub fn with_resource_id(id: &str) -> Self {
        Self {
            resource_id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn fail_init(&self, root: &str) {
        lock(&self.failures).push(("init", root.to_string()));
    }

    /// Fail targeted applies in `root`.
    pub fn fail_targeted(&self, root: &str) {
        lock(&self.failures).push(("targeted", root.to_string()));
    }

    /// Fail untargeted applies in `root`.
    pub fn fail_apply(&self, root: &str) {
        lock(&self.failures).push(("apply", root.to_string()));
    }

    pub fn fail_import(&self) {
        lock(&self.failures).push(("import", String::new()));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn fails(&self, op: &str, root: &Path) -> bool {
        let root = root.display().to_string();
        lock(&self.failures)
            .iter()
            .any(|(o, r)| *o == op && (r.is_empty() || *r == root))
    }

    fn outcome(&self, op: &str, root: &Path) -> IacRun {
        if self.fails(op, root) {
            IacRun::failed(format!("exit code 1: {} failed", op))
        } else {
            IacRun::ok()
        }
    }
}

#[async_trait]
impl IacEngine for FakeIac {
    async fn init(&self, root: &Path) -> Result<IacRun> {
        lock(&self.calls).push(format!("init {}", root.display()));
        Ok(self.outcome("init", root))
    }

    async fn apply(&self, root: &Path, targets: &[String]) -> Result<IacRun> {
        let mut call = format!("apply {}", root.display());
        for target in targets {
            call.push_str(&format!(" target={}", target));
        }
        lock(&self.calls).push(call);
        let op = if targets.is_empty() { "apply" } else { "targeted" };
        Ok(self.outcome(op, root))
    }

    async fn import(&self, root: &Path, address: &str, _id: &str) -> Result<IacRun> {
        lock(&self.calls).push(format!("import {} {}", root.display(), address));
        Ok(self.outcome("import", root))
    }

    async fn resource_id(&self, root: &Path, address: &str) -> Result<Option<String>> {
        lock(&self.calls).push(format!("resource_id {} {}", root.display(), address));
        Ok(self.resource_id.clone())
    }
}

pub(crate) struct FakeAllocator {
    result: Option<AllocationResult>,
    // Exit successfully but hand back nothing readable
    unreadable: bool,
    calls: Mutex<usize>,
}

impl FakeAllocator {
    pub fn new(result: AllocationResult) -> Self {
        Self {
            result: Some(result),
            unreadable: false,
            calls: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            unreadable: false,
            calls: Mutex::new(0),
        }
    }

    pub fn unreadable_handoff() -> Self {
        Self {
            result: None,
            unreadable: true,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl AllocatorClient for FakeAllocator {
    async fn allocate(&self, _request: &ProvisioningRequest) -> Result<AllocationResult> {
        *lock(&self.calls) += 1;
        if self.unreadable {
            return Err(UnreadableHandoff(anyhow::anyhow!("no allocation result object")).into());
        }
        match self.result {
            Some(ref result) => Ok(result.clone()),
            None => bail!("allocator exit code 1: no free block of requested size"),
        }
    }
}

fn policy_with(sid: &str, principals: &[String]) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            { "Sid": sid, "Effect": "Allow", "Principal": { "AWS": principals } }
        ]
    })
}

pub(crate) struct FakeCloud {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
    bucket_policy: Mutex<Value>,
    key_policy: Mutex<Value>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        let section = CascadeSection::default();
        let existing = vec![account_root_arn("999999999999")];
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            bucket_policy: Mutex::new(policy_with(&section.bucket_statement_sid, &existing)),
            key_policy: Mutex::new(policy_with(&section.key_statement_sid, &existing)),
        }
    }
}

impl FakeCloud {
    pub fn fail_on(&self, op: &str) {
        lock(&self.failures).insert(op.to_string());
    }

    /// Pre-grant `account_id` in both policies.
    pub fn grant_existing(&self, account_id: &str) {
        let section = CascadeSection::default();
        let principals = vec![account_root_arn("999999999999"), account_root_arn(account_id)];
        *lock(&self.bucket_policy) = policy_with(&section.bucket_statement_sid, &principals);
        *lock(&self.key_policy) = policy_with(&section.key_statement_sid, &principals);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn bucket_policy_doc(&self) -> Value {
        lock(&self.bucket_policy).clone()
    }

    fn enter(&self, op: &str, call: String) -> Result<()> {
        lock(&self.calls).push(call);
        if lock(&self.failures).contains(op) {
            bail!("{}: AccessDenied", op);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn associate_zone(&self, zone_id: &str, vpc_id: &str, _vpc_region: &str) -> Result<()> {
        self.enter("associate_zone", format!("associate_zone {} {}", zone_id, vpc_id))
    }

    async fn authorize_zone_association(
        &self,
        zone_id: &str,
        vpc_id: &str,
        _vpc_region: &str,
    ) -> Result<()> {
        self.enter(
            "authorize_zone_association",
            format!("authorize_zone_association {} {}", zone_id, vpc_id),
        )
    }

    async fn assume_role(&self, role_arn: &str, _session_name: &str) -> Result<Credentials> {
        self.enter("assume_role", format!("assume_role {}", role_arn))?;
        Ok(Credentials {
            access_key_id: "ASIAFAKE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
        })
    }

    async fn bucket_policy(&self, bucket: &str) -> Result<Value> {
        self.enter("bucket_policy", format!("bucket_policy {}", bucket))?;
        Ok(lock(&self.bucket_policy).clone())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &Value) -> Result<()> {
        self.enter("put_bucket_policy", format!("put_bucket_policy {}", bucket))?;
        *lock(&self.bucket_policy) = policy.clone();
        Ok(())
    }

    async fn key_policy(&self, key_id: &str) -> Result<Value> {
        self.enter("key_policy", format!("key_policy {}", key_id))?;
        Ok(lock(&self.key_policy).clone())
    }

    async fn put_key_policy(&self, key_id: &str, policy: &Value) -> Result<()> {
        self.enter("put_key_policy", format!("put_key_policy {}", key_id))?;
        *lock(&self.key_policy) = policy.clone();
        Ok(())
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<String> {
        self.enter("fetch_object", format!("fetch_object {}/{}", bucket, key))?;
        Ok("AWSTemplateFormatVersion: '2010-09-09'\nResources: {}\n".to_string())
    }

    async fn deploy_stack(&self, stack: &StackDeployment, _credentials: &Credentials) -> Result<()> {
        self.enter(
            "deploy_stack",
            format!("deploy_stack {} {}", stack.stack_name, stack.region),
        )
    }
}

#[derive(Default)]
pub(crate) struct FakeGenerator {
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<RouteScheme>>,
}

impl FakeGenerator {
    pub fn fail_on(&self, scheme: RouteScheme) {
        lock(&self.failures).push(scheme);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PeeringGenerator for FakeGenerator {
    async fn generate(&self, peering: &PeeringRequest<'_>) -> Result<()> {
        lock(&self.calls).push(format!("{} {}", peering.scheme.as_str(), peering.route));
        if lock(&self.failures).contains(&peering.scheme) {
            bail!("route generator exited 1 for {}", peering.route);
        }
        Ok(())
    }
}
