//! Wiring a new segment into the shared-services fabric.
//!
//! Order matters: classification is checked before anything is touched,
//! DNS associations are best-effort, and the generated acceptance code is
//! committed only after both route schemes generated cleanly.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::phased_apply::DeployedVpc;
use super::staging::StagingHandle;
use crate::allocator::AllocationResult;
use crate::checkpoint::{ApplyCheckpoint, Stage, StageStatus, SurvivingArtifact};
use crate::cloud::CloudClient;
use crate::errors::SagaError;
use crate::iac::{self, IacEngine};
use crate::process;
use crate::provision_config::{ProvisionToml, RoutePair, expand_template};
use crate::request::ProvisioningRequest;
use crate::tracker::VersionControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScheme {
    Current,
    Legacy,
}

impl RouteScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteScheme::Current => "current",
            RouteScheme::Legacy => "legacy",
        }
    }
}

/// Everything the route generator needs for one invocation.
#[derive(Debug, Clone)]
pub struct PeeringRequest<'a> {
    pub repo: &'a Path,
    pub request: &'a ProvisioningRequest,
    pub allocation: &'a AllocationResult,
    pub vpc: &'a DeployedVpc,
    pub scheme: RouteScheme,
    pub route: &'a str,
}

/// External generator that writes peering-acceptance code into the peering
/// repository.
#[async_trait]
pub trait PeeringGenerator: Send + Sync {
    async fn generate(&self, peering: &PeeringRequest<'_>) -> Result<()>;
}

/// Runs the generator script inside the peering repository.
pub struct ScriptPeeringGenerator {
    command: String,
}

impl ScriptPeeringGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn arguments(peering: &PeeringRequest<'_>) -> Vec<String> {
        process::args([
            "--account_id",
            peering.request.account_id.as_str(),
            "--name",
            peering.request.name.as_str(),
            "--region",
            peering.request.region.as_str(),
            "--vpc_id",
            peering.vpc.vpc_id.as_str(),
            "--cidr",
            peering.allocation.cidr.as_str(),
            "--route",
            peering.route,
            "--scheme",
            peering.scheme.as_str(),
        ])
    }
}

#[async_trait]
impl PeeringGenerator for ScriptPeeringGenerator {
    async fn generate(&self, peering: &PeeringRequest<'_>) -> Result<()> {
        let output = process::run_command_line(
            &self.command,
            Self::arguments(peering),
            Some(peering.repo),
            &[],
        )
        .await?;
        if !output.success() {
            anyhow::bail!(
                "{} generation ({}) {}",
                peering.scheme.as_str(),
                peering.route,
                output.failure_summary()
            );
        }
        Ok(())
    }
}

/// Collaborators the peering stage drives.
pub struct PeeringDeps<'a> {
    pub vcs: &'a dyn VersionControl,
    pub iac: &'a dyn IacEngine,
    pub cloud: &'a dyn CloudClient,
    pub generator: &'a dyn PeeringGenerator,
}

/// Route pair for the classification, or `UnsupportedClassification`.
pub fn resolve_routes<'c>(
    settings: &'c ProvisionToml,
    allocation: &AllocationResult,
) -> Result<&'c RoutePair, SagaError> {
    let classification = allocation.classification.as_str();
    if allocation.classification.environment().is_none() {
        return Err(SagaError::UnsupportedClassification(classification.to_string()));
    }
    settings
        .routes_for(classification)
        .ok_or_else(|| SagaError::UnsupportedClassification(classification.to_string()))
}

/// Both DNS operations; failures become checkpoint warnings.
async fn associate_dns(
    cloud: &dyn CloudClient,
    request: &ProvisioningRequest,
    allocation: &AllocationResult,
    vpc: &DeployedVpc,
    checkpoint: &mut ApplyCheckpoint,
) {
    let Some(ref zone) = allocation.shared_zone_id else {
        checkpoint.warn("No shared zone id from allocator; DNS association skipped");
        return;
    };

    match cloud.associate_zone(zone, &vpc.vpc_id, &request.region).await {
        Ok(()) => checkpoint.record(
            Stage::Peering,
            Some("dns_association"),
            StageStatus::Succeeded,
            zone,
        ),
        Err(e) => {
            checkpoint.record(
                Stage::Peering,
                Some("dns_association"),
                StageStatus::Skipped,
                format!("{:#}", e),
            );
            checkpoint.warn(format!(
                "PeeringAssociationWarning: associating {} with zone {} failed: {:#}",
                vpc.vpc_id, zone, e
            ));
        }
    }

    let Some(ref shared_vpc) = allocation.shared_vpc_id else {
        checkpoint.warn("No shared-services VPC id from allocator; DNS sharing skipped");
        return;
    };
    match cloud
        .authorize_zone_association(zone, shared_vpc, &request.region)
        .await
    {
        Ok(()) => checkpoint.record(
            Stage::Peering,
            Some("dns_sharing"),
            StageStatus::Succeeded,
            shared_vpc,
        ),
        Err(e) => {
            checkpoint.record(
                Stage::Peering,
                Some("dns_sharing"),
                StageStatus::Skipped,
                format!("{:#}", e),
            );
            checkpoint.warn(format!(
                "PeeringAssociationWarning: authorizing {} on zone {} failed: {:#}",
                shared_vpc, zone, e
            ));
        }
    }
}

/// Run the peering stage against the peering repository.
pub async fn run_peering(
    deps: &PeeringDeps<'_>,
    settings: &ProvisionToml,
    repo: &Path,
    request: &ProvisioningRequest,
    allocation: &AllocationResult,
    vpc: &DeployedVpc,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<StagingHandle, SagaError> {
    let routes = resolve_routes(settings, allocation)?.clone();

    associate_dns(deps.cloud, request, allocation, vpc, checkpoint).await;

    let branch = request.branch_name();
    let generation = |e: anyhow::Error| SagaError::PeeringGeneration(format!("{:#}", e));

    let exists = deps.vcs.remote_branch_exists(repo, &branch).await.map_err(generation)?
        || deps.vcs.local_branch_exists(repo, &branch).await.map_err(generation)?;
    if exists {
        deps.vcs
            .checkout_existing(repo, &branch)
            .await
            .map_err(generation)?;
    } else {
        deps.vcs
            .create_branch(repo, &branch, &settings.vcs.trunk)
            .await
            .map_err(generation)?;
    }
    checkpoint.track_branch(repo.to_path_buf(), &branch, false);

    for (scheme, route) in [
        (RouteScheme::Current, routes.current.as_str()),
        (RouteScheme::Legacy, routes.legacy.as_str()),
    ] {
        let peering = PeeringRequest {
            repo,
            request,
            allocation,
            vpc,
            scheme,
            route,
        };
        deps.generator.generate(&peering).await.map_err(generation)?;
        checkpoint.record(
            Stage::Peering,
            Some(scheme.as_str()),
            StageStatus::Succeeded,
            route,
        );
    }

    deps.vcs
        .commit_all(
            repo,
            &[PathBuf::from("*")],
            &format!(
                "{}: peering acceptance for {} ({})",
                request.change_record, request.name, vpc.vpc_id
            ),
        )
        .await
        .map_err(generation)?;
    deps.vcs.push(repo, &branch).await.map_err(generation)?;
    checkpoint.track_branch(repo.to_path_buf(), &branch, true);

    let environment = allocation.classification.environment().unwrap_or_default();
    let region_underscore = request.region_underscore();
    let acceptance_root = repo.join(expand_template(
        &settings.peering.acceptance_root,
        &[
            ("environment", environment),
            ("region", request.region.as_str()),
            ("region_underscore", region_underscore.as_str()),
            ("name", request.name.as_str()),
            ("account_id", request.account_id.as_str()),
        ],
    ));
    checkpoint.add_artifact(SurvivingArtifact::Infrastructure {
        root: acceptance_root.clone(),
        resource: None,
        applied: false,
    });
    let peering_apply = |message: String| SagaError::PeeringApply {
        root: acceptance_root.clone(),
        message,
    };
    match iac::init_and_apply(deps.iac, &acceptance_root)
        .await
        .map_err(|e| peering_apply(format!("{:#}", e)))?
    {
        Ok(()) => {
            checkpoint.mark_applied(&acceptance_root);
            checkpoint.record(
                Stage::Peering,
                Some("acceptance_apply"),
                StageStatus::Succeeded,
                acceptance_root.display().to_string(),
            );
        }
        Err((step, detail)) => {
            return Err(peering_apply(format!("{}: {}", step, detail)));
        }
    }

    Ok(StagingHandle {
        repo: repo.to_path_buf(),
        branch,
        pushed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AccountClassification;
    use crate::request::sample_request;
    use crate::testing::{FakeCloud, FakeGenerator, FakeIac, FakeVcs, sample_allocation};

    fn vpc() -> DeployedVpc {
        DeployedVpc {
            vpc_id: "vpc-0abc".into(),
            address: "aws_vpc.client_test-seg".into(),
        }
    }

    struct Harness {
        vcs: FakeVcs,
        iac: FakeIac,
        cloud: FakeCloud,
        generator: FakeGenerator,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                vcs: FakeVcs::default(),
                iac: FakeIac::with_resource_id("vpc-0abc"),
                cloud: FakeCloud::default(),
                generator: FakeGenerator::default(),
            }
        }

        fn deps(&self) -> PeeringDeps<'_> {
            PeeringDeps {
                vcs: &self.vcs,
                iac: &self.iac,
                cloud: &self.cloud,
                generator: &self.generator,
            }
        }

        async fn run(
            &self,
            allocation: &AllocationResult,
            cp: &mut ApplyCheckpoint,
        ) -> Result<StagingHandle, SagaError> {
            let settings = ProvisionToml::default();
            run_peering(
                &self.deps(),
                &settings,
                Path::new("/peering"),
                &sample_request(),
                allocation,
                &vpc(),
                cp,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_generates_current_then_legacy_and_applies() {
        let h = Harness::new();
        let mut cp = ApplyCheckpoint::new(sample_request());
        let handle = h.run(&sample_allocation(), &mut cp).await.unwrap();

        assert!(handle.pushed);
        assert_eq!(h.generator.calls(), vec!["current prod", "legacy legacy-prod"]);
        assert_eq!(
            h.iac.calls(),
            vec![
                "init /peering/shared_services/prod/peering_us_east_1",
                "apply /peering/shared_services/prod/peering_us_east_1",
            ]
        );
        assert!(h.vcs.calls().iter().any(|c| c.starts_with("create_branch")));
        assert!(cp.warnings.is_empty());
        assert!(cp.artifacts.contains(&SurvivingArtifact::Infrastructure {
            root: PathBuf::from("/peering/shared_services/prod/peering_us_east_1"),
            resource: None,
            applied: true,
        }));
    }

    #[tokio::test]
    async fn test_unsupported_classification_touches_nothing() {
        let h = Harness::new();
        let mut allocation = sample_allocation();
        allocation.classification = AccountClassification::Unsupported("unsupported-type".into());
        let mut cp = ApplyCheckpoint::new(sample_request());

        let err = h.run(&allocation, &mut cp).await.unwrap_err();
        assert_eq!(err.class(), "UnsupportedClassificationError");
        assert!(h.cloud.calls().is_empty());
        assert!(h.vcs.calls().is_empty());
        assert!(h.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dns_failures_are_warnings() {
        let h = Harness::new();
        h.cloud.fail_on("associate_zone");
        h.cloud.fail_on("authorize_zone_association");
        let mut cp = ApplyCheckpoint::new(sample_request());

        h.run(&sample_allocation(), &mut cp).await.unwrap();
        assert_eq!(cp.warnings.len(), 2);
        assert!(cp.warnings.iter().all(|w| w.starts_with("PeeringAssociationWarning")));
    }

    #[tokio::test]
    async fn test_existing_branch_is_reused() {
        let h = Harness::new();
        h.vcs.add_remote_branch(&sample_request().branch_name());
        let mut cp = ApplyCheckpoint::new(sample_request());

        h.run(&sample_allocation(), &mut cp).await.unwrap();
        let calls = h.vcs.calls();
        assert!(calls.iter().any(|c| c.starts_with("checkout_existing")));
        assert!(!calls.iter().any(|c| c.starts_with("create_branch")));
    }

    #[tokio::test]
    async fn test_legacy_generation_failure_is_fatal_and_uncommitted() {
        let h = Harness::new();
        h.generator.fail_on(RouteScheme::Legacy);
        let mut cp = ApplyCheckpoint::new(sample_request());

        let err = h.run(&sample_allocation(), &mut cp).await.unwrap_err();
        assert_eq!(err.class(), "PeeringGenerationError");
        assert!(!h.vcs.calls().iter().any(|c| c.starts_with("commit_all")));
        assert!(h.iac.calls().is_empty());
    }

    #[tokio::test]
    async fn test_acceptance_apply_failure() {
        let h = Harness::new();
        h.iac.fail_apply("/peering/shared_services/prod/peering_us_east_1");
        let mut cp = ApplyCheckpoint::new(sample_request());

        let err = h.run(&sample_allocation(), &mut cp).await.unwrap_err();
        assert_eq!(err.class(), "PeeringApplyError");
        assert!(cp.artifacts.iter().any(|a| matches!(
            a,
            SurvivingArtifact::StagingBranch { pushed: true, .. }
        )));
        assert!(cp.artifacts.iter().any(|a| matches!(
            a,
            SurvivingArtifact::Infrastructure { applied: false, .. }
        )));
    }
}
