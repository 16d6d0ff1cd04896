//! Cascading applies into shared regional infrastructure.
//!
//! Root applies are fatal on failure. The transit-only steps patch policies
//! and deploy a stack; each is idempotent, so a failure there is retryable.

use std::path::{Path, PathBuf};

use super::phased_apply::DeployedVpc;
use super::staging::repo_path;
use crate::allocator::AllocationResult;
use crate::checkpoint::{ApplyCheckpoint, Stage, StageStatus, SurvivingArtifact};
use crate::cloud::{CloudClient, StackDeployment};
use crate::errors::{CascadeSeverity, SagaError};
use crate::iac::{self, IacEngine};
use crate::policy;
use crate::provision_config::{CascadeSection, expand_template};
use crate::request::ProvisioningRequest;

/// Whether the cascade stage has anything to do for this run.
pub fn should_run(request: &ProvisioningRequest, allocation: &AllocationResult) -> bool {
    request.peering || (request.transit && allocation.new_regional_dir.is_none())
}

/// One IaC root to init and apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeTarget {
    pub label: &'static str,
    pub root: PathBuf,
}

/// Roots and steps the cascade will run, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    pub targets: Vec<CascadeTarget>,
    pub transit: bool,
}

/// Work out the cascade for a run.
///
/// A freshly created account-regional directory is bootstrapped first and
/// replaces the transit-only path. The hybrid root is only included for
/// internal accounts.
pub fn plan(
    section: &CascadeSection,
    vpc_repo: &Path,
    request: &ProvisioningRequest,
    allocation: &AllocationResult,
) -> Result<CascadePlan, SagaError> {
    let environment = allocation.classification.environment().ok_or_else(|| {
        SagaError::UnsupportedClassification(allocation.classification.as_str().to_string())
    })?;
    let region_underscore = request.region_underscore();
    let values = [
        ("environment", environment),
        ("region", request.region.as_str()),
        ("region_underscore", region_underscore.as_str()),
        ("name", request.name.as_str()),
        ("account_id", request.account_id.as_str()),
    ];

    let mut targets = Vec::new();
    if let Some(ref regional) = allocation.new_regional_dir {
        targets.push(CascadeTarget {
            label: "account regional bootstrap",
            root: repo_path(vpc_repo, regional),
        });
    }
    targets.push(CascadeTarget {
        label: "shared regional root",
        root: vpc_repo.join(expand_template(&section.regional_root, &values)),
    });
    if allocation.classification.is_internal() {
        targets.push(CascadeTarget {
            label: "hybrid root",
            root: vpc_repo.join(expand_template(&section.hybrid_root, &values)),
        });
    }

    Ok(CascadePlan {
        targets,
        transit: request.transit && allocation.new_regional_dir.is_none(),
    })
}

fn retryable(target: &str, e: anyhow::Error) -> SagaError {
    SagaError::CascadeApply {
        target: target.to_string(),
        severity: CascadeSeverity::Retryable,
        message: format!("{:#}", e),
    }
}

async fn apply_target(
    iac: &dyn IacEngine,
    target: &CascadeTarget,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<(), SagaError> {
    let fatal = |message: String| SagaError::CascadeApply {
        target: format!("{} ({})", target.label, target.root.display()),
        severity: CascadeSeverity::Fatal,
        message,
    };
    checkpoint.add_artifact(SurvivingArtifact::Infrastructure {
        root: target.root.clone(),
        resource: None,
        applied: false,
    });
    match iac::init_and_apply(iac, &target.root)
        .await
        .map_err(|e| fatal(format!("{:#}", e)))?
    {
        Ok(()) => {
            checkpoint.mark_applied(&target.root);
            checkpoint.record(
                Stage::Cascade,
                Some(target.label),
                StageStatus::Succeeded,
                target.root.display().to_string(),
            );
            Ok(())
        }
        Err((step, detail)) => {
            checkpoint.record(Stage::Cascade, Some(target.label), StageStatus::Failed, &detail);
            Err(fatal(format!("{}: {}", step, detail)))
        }
    }
}

async fn patch_bucket_policy(
    cloud: &dyn CloudClient,
    section: &CascadeSection,
    account_id: &str,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<(), SagaError> {
    const STEP: &str = "bucket policy";
    let mut doc = cloud
        .bucket_policy(&section.policy_bucket)
        .await
        .map_err(|e| retryable(STEP, e))?;
    let changed = policy::grant_account(&mut doc, &section.bucket_statement_sid, account_id)
        .map_err(|e| retryable(STEP, e))?;
    if changed {
        cloud
            .put_bucket_policy(&section.policy_bucket, &doc)
            .await
            .map_err(|e| retryable(STEP, e))?;
    }
    checkpoint.record(
        Stage::Cascade,
        Some(STEP),
        StageStatus::Succeeded,
        if changed { "granted" } else { "already present" },
    );
    Ok(())
}

async fn patch_key_policy(
    cloud: &dyn CloudClient,
    section: &CascadeSection,
    account_id: &str,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<(), SagaError> {
    const STEP: &str = "key policy";
    let mut doc = cloud
        .key_policy(&section.kms_key_id)
        .await
        .map_err(|e| retryable(STEP, e))?;
    let changed = policy::grant_account(&mut doc, &section.key_statement_sid, account_id)
        .map_err(|e| retryable(STEP, e))?;
    if changed {
        cloud
            .put_key_policy(&section.kms_key_id, &doc)
            .await
            .map_err(|e| retryable(STEP, e))?;
    }
    checkpoint.record(
        Stage::Cascade,
        Some(STEP),
        StageStatus::Succeeded,
        if changed { "granted" } else { "already present" },
    );
    Ok(())
}

async fn deploy_transit_stack(
    cloud: &dyn CloudClient,
    section: &CascadeSection,
    request: &ProvisioningRequest,
    vpc: &DeployedVpc,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<(), SagaError> {
    const STEP: &str = "stack deploy";
    let template_body = cloud
        .fetch_object(&section.template_bucket, &section.template_key)
        .await
        .map_err(|e| retryable(STEP, e))?;

    let role_arn = format!(
        "arn:aws:iam::{}:role/{}",
        request.account_id, section.deploy_role
    );
    let credentials = cloud
        .assume_role(&role_arn, &format!("vpc-provision-{}", request.account_id))
        .await
        .map_err(|e| retryable(STEP, e))?;

    let stack = StackDeployment {
        stack_name: section.stack_name.clone(),
        template_body,
        region: request.region.clone(),
        parameters: vec![("VpcId".to_string(), vpc.vpc_id.clone())],
    };
    cloud
        .deploy_stack(&stack, &credentials)
        .await
        .map_err(|e| retryable(STEP, e))?;
    checkpoint.record(
        Stage::Cascade,
        Some(STEP),
        StageStatus::Succeeded,
        format!("{} in {}", section.stack_name, request.region),
    );
    Ok(())
}

/// Run every planned root, then the transit-only steps if planned.
pub async fn run_cascade(
    iac: &dyn IacEngine,
    cloud: &dyn CloudClient,
    section: &CascadeSection,
    plan: &CascadePlan,
    request: &ProvisioningRequest,
    vpc: &DeployedVpc,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<(), SagaError> {
    for target in &plan.targets {
        tracing::info!(target = target.label, root = %target.root.display(), "cascade apply");
        apply_target(iac, target, checkpoint).await?;
    }

    if plan.transit {
        patch_bucket_policy(cloud, section, &request.account_id, checkpoint).await?;
        patch_key_policy(cloud, section, &request.account_id, checkpoint).await?;
        deploy_transit_stack(cloud, section, request, vpc, checkpoint).await?;
    }
    Ok(())
}
