//! The provisioning saga as an explicit state machine.
//!
//! [`Saga::advance`] runs exactly one [`Stage`] and persists the checkpoint
//! before returning. Stages only read artifacts produced by stages that
//! already succeeded; any error halts the saga with the checkpoint marked
//! failed. Nothing is rolled back.

use std::path::PathBuf;
use std::sync::Arc;

use super::cascade;
use super::finalize::finalize;
use super::peering::{PeeringDeps, PeeringGenerator, run_peering};
use super::phased_apply::{DeployedVpc, LegacyImport, PhasedApply};
use super::staging::{self, StagingHandle, repo_path};
use crate::allocator::{AllocationResult, AllocatorClient, UnreadableHandoff};
use crate::checkpoint::{
    ApplyCheckpoint, CheckpointStore, SagaOutcome, Stage, StageStatus, SurvivingArtifact,
};
use crate::cloud::CloudClient;
use crate::errors::SagaError;
use crate::iac::IacEngine;
use crate::provision_config::{ProvisionToml, expand_template};
use crate::request::{self, ProvisioningRequest};
use crate::tracker::VersionControl;
use crate::ui::SagaUI;
use crate::workspace::{self, Workspace};

/// External collaborators, one per seam.
#[derive(Clone)]
pub struct Collaborators {
    pub allocator: Arc<dyn AllocatorClient>,
    pub vcs: Arc<dyn VersionControl>,
    pub iac: Arc<dyn IacEngine>,
    pub cloud: Arc<dyn CloudClient>,
    pub generator: Arc<dyn PeeringGenerator>,
}

/// How a stage ended when it did not fail.
enum StageResult {
    Done(String),
    Skipped(String),
}

/// Final state of a run.
pub struct SagaRun {
    pub checkpoint: ApplyCheckpoint,
    pub error: Option<SagaError>,
    /// Where the checkpoint was archived, if archiving worked
    pub archive_path: Option<PathBuf>,
}

impl SagaRun {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map(SagaError::exit_code).unwrap_or(0)
    }
}

pub struct Saga {
    settings: ProvisionToml,
    collaborators: Collaborators,
    store: CheckpointStore,
    ui: Option<Arc<SagaUI>>,
    checkpoint: ApplyCheckpoint,
    next: Option<Stage>,
    workspace: Option<Workspace>,
    deployed: Option<DeployedVpc>,
    handles: Vec<StagingHandle>,
}

fn missing(what: &str) -> SagaError {
    SagaError::Checkpoint(anyhow::anyhow!("{} not available from an earlier stage", what))
}

impl Saga {
    pub fn new(
        request: ProvisioningRequest,
        settings: ProvisionToml,
        collaborators: Collaborators,
        store: CheckpointStore,
    ) -> Self {
        Self {
            settings,
            collaborators,
            store,
            ui: None,
            checkpoint: ApplyCheckpoint::new(request),
            next: Some(Stage::Validate),
            workspace: None,
            deployed: None,
            handles: Vec::new(),
        }
    }

    pub fn with_ui(mut self, ui: Arc<SagaUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn checkpoint(&self) -> &ApplyCheckpoint {
        &self.checkpoint
    }

    /// Stage the next call to [`advance`](Self::advance) will run.
    pub fn next_stage(&self) -> Option<Stage> {
        self.next
    }

    fn persist(&self) -> Result<(), SagaError> {
        self.store.save(&self.checkpoint).map_err(SagaError::Checkpoint)
    }

    fn step(&self, msg: &str) {
        tracing::info!("{}", msg);
        if let Some(ref ui) = self.ui {
            ui.log_step(msg);
        }
    }

    /// Run the next stage. Returns the stage after it, or `None` once the
    /// saga has reached a terminal state.
    pub async fn advance(&mut self) -> Result<Option<Stage>, SagaError> {
        let Some(stage) = self.next else {
            return Ok(None);
        };
        if let Some(ref ui) = self.ui {
            ui.start_stage(stage);
        }
        tracing::info!(stage = %stage, run_id = %self.checkpoint.run_id, "stage started");
        let warnings_before = self.checkpoint.warnings.len();

        let result = self.execute(stage).await;

        if let Some(ref ui) = self.ui {
            for warning in &self.checkpoint.warnings[warnings_before..] {
                ui.warn(warning);
            }
        }

        match result {
            Ok(StageResult::Done(detail)) => {
                self.checkpoint
                    .record(stage, None, StageStatus::Succeeded, detail.as_str());
                if let Some(ref ui) = self.ui {
                    ui.stage_complete(stage, &detail);
                }
            }
            Ok(StageResult::Skipped(reason)) => {
                self.checkpoint
                    .record(stage, None, StageStatus::Skipped, reason.as_str());
                if let Some(ref ui) = self.ui {
                    ui.stage_skipped(stage, &reason);
                }
            }
            Err(e) => {
                tracing::error!(stage = %stage, class = e.class(), "{}", e);
                self.checkpoint.fail(stage, &e);
                self.next = None;
                if let Some(ref ui) = self.ui {
                    ui.stage_failed(stage, &e.to_string());
                }
                if let Err(persist) = self.persist() {
                    tracing::error!("{}", persist);
                }
                return Err(e);
            }
        }

        self.next = stage.next();
        if let Err(e) = self.persist() {
            self.checkpoint.fail(stage, &e);
            self.next = None;
            return Err(e);
        }
        Ok(self.next)
    }

    async fn execute(&mut self, stage: Stage) -> Result<StageResult, SagaError> {
        match stage {
            Stage::Validate => self.validate(),
            Stage::BindWorkspace => self.bind_workspace(),
            Stage::BranchPreflight => self.branch_preflight().await,
            Stage::Allocate => self.allocate().await,
            Stage::StageChanges => self.stage_changes().await,
            Stage::PhasedApply => self.phased_apply().await,
            Stage::Peering => self.peering().await,
            Stage::Cascade => self.cascade().await,
            Stage::Finalize => self.finalize().await,
        }
    }

    fn validate(&mut self) -> Result<StageResult, SagaError> {
        let report = request::validate(&self.checkpoint.request);
        if !report.is_ok() {
            return Err(SagaError::Validation(report.violations));
        }
        Ok(StageResult::Done(String::new()))
    }

    fn bind_workspace(&mut self) -> Result<StageResult, SagaError> {
        let bound = workspace::bind(
            &self.settings.workspace,
            &self.settings.vcs.remote,
            &self.checkpoint.request,
        )?;
        let detail = bound.vpc_repo.display().to_string();
        self.workspace = Some(bound);
        Ok(StageResult::Done(detail))
    }

    fn workspace(&self) -> Result<&Workspace, SagaError> {
        self.workspace.as_ref().ok_or_else(|| missing("workspace"))
    }

    fn allocation(&self) -> Result<AllocationResult, SagaError> {
        self.checkpoint
            .allocation
            .clone()
            .ok_or_else(|| missing("allocation"))
    }

    async fn branch_preflight(&mut self) -> Result<StageResult, SagaError> {
        let branch = self.checkpoint.request.branch_name();
        self.step(&format!("checking remote for {}", branch));
        let repo = self.workspace()?.vpc_repo.clone();
        staging::preflight(
            self.collaborators.vcs.as_ref(),
            &repo,
            &branch,
            &self.settings.vcs.remote,
        )
        .await?;
        Ok(StageResult::Done(branch))
    }

    async fn allocate(&mut self) -> Result<StageResult, SagaError> {
        self.step("running allocator");
        let allocation = match self
            .collaborators
            .allocator
            .allocate(&self.checkpoint.request)
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                let reserved = e.downcast_ref::<UnreadableHandoff>().is_some();
                if reserved {
                    let request = &self.checkpoint.request;
                    let artifact = SurvivingArtifact::UnconfirmedReservation {
                        account_id: request.account_id.clone(),
                        name: request.name.clone(),
                        region: request.region.clone(),
                    };
                    self.checkpoint.add_artifact(artifact);
                }
                return Err(SagaError::Allocation {
                    message: format!("{:#}", e),
                    reserved,
                });
            }
        };

        self.checkpoint.add_artifact(SurvivingArtifact::CidrReservation {
            resource_id: allocation.resource_id.clone(),
            cidr: allocation.cidr.clone(),
        });
        if let Some(ref name) = allocation.config_parameter {
            self.checkpoint
                .add_artifact(SurvivingArtifact::ConfigParameter { name: name.clone() });
        }
        let detail = format!("{} ({})", allocation.cidr, allocation.classification);
        self.checkpoint.allocation = Some(allocation);
        Ok(StageResult::Done(detail))
    }

    async fn stage_changes(&mut self) -> Result<StageResult, SagaError> {
        let allocation = self.allocation()?;
        let repo = self.workspace()?.vpc_repo.clone();
        let request = self.checkpoint.request.clone();
        self.step("committing generated code");
        let handle = staging::stage_changes(
            self.collaborators.vcs.as_ref(),
            &repo,
            &request,
            &allocation,
            &self.settings.vcs.trunk,
            &self.settings.vcs.remote,
            &mut self.checkpoint,
        )
        .await?;
        let detail = handle.branch.clone();
        self.handles.push(handle);
        Ok(StageResult::Done(detail))
    }

    fn legacy_import(&self, allocation: &AllocationResult) -> Option<LegacyImport> {
        let request = &self.checkpoint.request;
        let name_lower = request.name.to_lowercase();
        let region_underscore = request.region_underscore();
        let values = [
            ("environment", allocation.classification.environment().unwrap_or_default()),
            ("region", request.region.as_str()),
            ("region_underscore", region_underscore.as_str()),
            ("name", request.name.as_str()),
            ("name_lower", name_lower.as_str()),
            ("resource", allocation.resource_id.as_str()),
            ("account_id", request.account_id.as_str()),
        ];
        let address = expand_template(&self.settings.iac.legacy_import_address, &values);
        let id = expand_template(&self.settings.iac.legacy_import_id, &values);
        (!address.trim().is_empty() && !id.trim().is_empty()).then_some(LegacyImport { address, id })
    }

    async fn phased_apply(&mut self) -> Result<StageResult, SagaError> {
        let allocation = self.allocation()?;
        let repo = self.workspace()?.vpc_repo.clone();
        let root = repo_path(
            &repo,
            &allocation.environment_root(&self.checkpoint.request.region),
        );
        self.step(&format!("applying {}", root.display()));

        let import = self.legacy_import(&allocation);
        let engine = self.collaborators.iac.clone();
        let deployed = PhasedApply::new(
            engine.as_ref(),
            root,
            allocation.segment_address(),
            import,
        )
        .run(&mut self.checkpoint)
        .await?;
        let detail = deployed.vpc_id.clone();
        self.deployed = Some(deployed);
        Ok(StageResult::Done(detail))
    }

    async fn peering(&mut self) -> Result<StageResult, SagaError> {
        if !self.checkpoint.request.peering {
            return Ok(StageResult::Skipped("peering not requested".to_string()));
        }
        let allocation = self.allocation()?;
        let vpc = self.deployed.clone().ok_or_else(|| missing("deployed VPC"))?;
        let repo = self
            .workspace()?
            .peering_repo
            .clone()
            .ok_or_else(|| missing("peering repository"))?;
        self.step("wiring peering");

        let collaborators = self.collaborators.clone();
        let deps = PeeringDeps {
            vcs: collaborators.vcs.as_ref(),
            iac: collaborators.iac.as_ref(),
            cloud: collaborators.cloud.as_ref(),
            generator: collaborators.generator.as_ref(),
        };
        let request = self.checkpoint.request.clone();
        let handle = run_peering(
            &deps,
            &self.settings,
            &repo,
            &request,
            &allocation,
            &vpc,
            &mut self.checkpoint,
        )
        .await?;
        let detail = handle.branch.clone();
        self.handles.push(handle);
        Ok(StageResult::Done(detail))
    }

    async fn cascade(&mut self) -> Result<StageResult, SagaError> {
        let allocation = self.allocation()?;
        let request = self.checkpoint.request.clone();

        if !cascade::should_run(&request, &allocation) {
            if request.transit {
                self.checkpoint.warn(format!(
                    "Transit requested but the allocator created {}; the transit-only steps were not run",
                    allocation
                        .new_regional_dir
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                ));
                return Ok(StageResult::Skipped(
                    "new account-regional directory without peering".to_string(),
                ));
            }
            return Ok(StageResult::Skipped("not required".to_string()));
        }

        let vpc = self.deployed.clone().ok_or_else(|| missing("deployed VPC"))?;
        let repo = self.workspace()?.vpc_repo.clone();
        let plan = cascade::plan(&self.settings.cascade, &repo, &request, &allocation)?;
        self.step(&format!("cascading into {} root(s)", plan.targets.len()));

        let collaborators = self.collaborators.clone();
        cascade::run_cascade(
            collaborators.iac.as_ref(),
            collaborators.cloud.as_ref(),
            &self.settings.cascade,
            &plan,
            &request,
            &vpc,
            &mut self.checkpoint,
        )
        .await?;

        let mut detail = format!("{} root(s)", plan.targets.len());
        if plan.transit {
            detail.push_str(" + transit");
        }
        Ok(StageResult::Done(detail))
    }

    async fn finalize(&mut self) -> Result<StageResult, SagaError> {
        let merge = self.checkpoint.request.merge;
        self.step(if merge { "merging to trunk" } else { "leaving branches unmerged" });
        let outcome = finalize(
            self.collaborators.vcs.as_ref(),
            &self.handles,
            merge,
            &self.settings.vcs.trunk,
            &mut self.checkpoint,
        )
        .await?;
        let detail = match outcome {
            SagaOutcome::Succeeded => "merged".to_string(),
            _ => "left unmerged".to_string(),
        };
        self.checkpoint.finish(outcome);
        Ok(StageResult::Done(detail))
    }

    /// Advance until the saga finishes or fails, then archive the checkpoint.
    pub async fn run(mut self) -> SagaRun {
        if let Some(ref ui) = self.ui {
            ui.print_header(&self.checkpoint.request);
        }
        if let Err(e) = self.persist() {
            tracing::warn!("{}", e);
        }

        let error = loop {
            match self.advance().await {
                Ok(Some(_)) => continue,
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        let archive_path = match self.store.archive(&self.checkpoint) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("Failed to archive checkpoint: {:#}", e);
                None
            }
        };

        if let Some(ref ui) = self.ui {
            ui.finish(matches!(self.checkpoint.outcome, SagaOutcome::Succeeded));
        }
        tracing::info!(
            run_id = %self.checkpoint.run_id,
            success = self.checkpoint.outcome.is_success(),
            "saga finished"
        );

        SagaRun {
            checkpoint: self.checkpoint,
            error,
            archive_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AccountClassification;
    use crate::errors::CascadeSeverity;
    use crate::request::sample_request;
    use crate::testing::{
        FakeAllocator, FakeCloud, FakeGenerator, FakeIac, FakeVcs, sample_allocation,
    };
    use git2::Repository;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        settings: ProvisionToml,
        allocator: Arc<FakeAllocator>,
        vcs: Arc<FakeVcs>,
        iac: Arc<FakeIac>,
        cloud: Arc<FakeCloud>,
        generator: Arc<FakeGenerator>,
    }

    fn init_repo(path: &Path) {
        let repo = Repository::init(path).unwrap();
        repo.remote("origin", "https://git.example.com/network/repo.git")
            .unwrap();
    }

    impl Fixture {
        fn new(allocation: AllocationResult) -> Self {
            Self::with_allocator(FakeAllocator::new(allocation))
        }

        fn with_allocator(allocator: FakeAllocator) -> Self {
            let dir = TempDir::new().unwrap();
            init_repo(&dir.path().join("terraform"));
            init_repo(&dir.path().join("shared-services"));

            let mut settings = ProvisionToml::default();
            settings.workspace.vpc_repo = dir.path().join("terraform");
            settings.workspace.peering_repo = Some(dir.path().join("shared-services"));
            settings.workspace.scratch_dir = dir.path().join("scratch");

            Self {
                dir,
                settings,
                allocator: Arc::new(allocator),
                vcs: Arc::new(FakeVcs::default()),
                iac: Arc::new(FakeIac::with_resource_id("vpc-0abc123")),
                cloud: Arc::new(FakeCloud::default()),
                generator: Arc::new(FakeGenerator::default()),
            }
        }

        fn store(&self) -> CheckpointStore {
            CheckpointStore::new(&self.dir.path().join("checkpoints"))
        }

        fn saga(&self, request: ProvisioningRequest) -> Saga {
            let collaborators = Collaborators {
                allocator: self.allocator.clone(),
                vcs: self.vcs.clone(),
                iac: self.iac.clone(),
                cloud: self.cloud.clone(),
                generator: self.generator.clone(),
            };
            Saga::new(request, self.settings.clone(), collaborators, self.store())
        }

        async fn run(&self, request: ProvisioningRequest) -> SagaRun {
            self.saga(request).run().await
        }
    }

    fn stages_with(cp: &ApplyCheckpoint, status: StageStatus) -> Vec<Stage> {
        cp.records
            .iter()
            .filter(|r| r.step.is_none() && r.status == status)
            .map(|r| r.stage)
            .collect()
    }

    #[tokio::test]
    async fn scenario_a_provisions_merges_and_exits_zero() {
        let fx = Fixture::new(sample_allocation());
        let run = fx.run(sample_request()).await;

        assert!(run.error.is_none(), "{:?}", run.error);
        assert_eq!(run.exit_code(), 0);
        assert_eq!(run.checkpoint.outcome, SagaOutcome::Succeeded);
        assert_eq!(run.checkpoint.vpc_id.as_deref(), Some("vpc-0abc123"));

        let branch = "hotfix/new_vpc_test-seg_123456789012_us-east-1";
        let calls = fx.vcs.calls();
        assert!(calls.contains(&format!("push {}", branch)));
        assert!(calls.contains(&format!("merge_into_trunk {} into master", branch)));
        assert!(calls.contains(&format!("delete_branch {}", branch)));
        assert!(run.checkpoint.open_branches().is_empty());

        assert_eq!(
            stages_with(&run.checkpoint, StageStatus::Skipped),
            vec![Stage::Peering, Stage::Cascade]
        );
        assert!(fx.cloud.calls().is_empty());

        // archived, and current.json cleared
        let archive = run.archive_path.unwrap();
        assert!(archive.exists());
        assert!(!fx.store().current_path().exists());
        let stored = fx.store().load(&archive).unwrap();
        assert_eq!(stored.outcome, SagaOutcome::Succeeded);
    }

    #[tokio::test]
    async fn scenario_b_repeat_request_conflicts_before_allocation() {
        let fx = Fixture::new(sample_allocation());
        let mut request = sample_request();
        request.merge = false;

        let first = fx.run(request.clone()).await;
        assert_eq!(first.exit_code(), 0);
        assert!(matches!(
            first.checkpoint.outcome,
            SagaOutcome::SucceededUnmerged { .. }
        ));

        let second = fx.run(request).await;
        let err = second.error.as_ref().unwrap();
        assert_eq!(err.class(), "StagingConflictError");
        assert_ne!(second.exit_code(), 0);
        assert_eq!(fx.allocator.calls(), 1);
        assert!(second.checkpoint.artifacts.is_empty());
        assert!(matches!(
            second.checkpoint.outcome,
            SagaOutcome::Failed {
                stage: Stage::BranchPreflight,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scenario_c_targeted_apply_failure_reports_survivors() {
        let fx = Fixture::new(sample_allocation());
        fx.iac.fail_targeted("");
        let run = fx.run(sample_request()).await;

        assert_eq!(run.error.as_ref().unwrap().class(), "ApplyExecError");
        assert_eq!(run.exit_code(), 1);
        assert!(
            !fx.iac
                .calls()
                .iter()
                .any(|c| c.starts_with("apply ") && !c.contains("target=")),
            "full apply must not run"
        );

        let artifacts = &run.checkpoint.artifacts;
        assert!(artifacts.contains(&SurvivingArtifact::CidrReservation {
            resource_id: "client_test-seg".into(),
            cidr: "10.20.1.0/24".into(),
        }));
        assert!(artifacts.iter().any(|a| matches!(
            a,
            SurvivingArtifact::StagingBranch { pushed: true, .. }
        )));
        assert!(!fx.vcs.calls().iter().any(|c| c.starts_with("merge_into_trunk")));

        let summary = run.checkpoint.render_remediation();
        assert!(summary.contains("ApplyExecError"));
        assert!(summary.contains("10.20.1.0/24"));
    }

    #[tokio::test]
    async fn scenario_d_unsupported_classification_leaves_vpc_unmerged() {
        let mut allocation = sample_allocation();
        allocation.classification = AccountClassification::Unsupported("unsupported-type".into());
        let fx = Fixture::new(allocation);
        let mut request = sample_request();
        request.peering = true;

        let run = fx.run(request.clone()).await;
        assert_eq!(
            run.error.as_ref().unwrap().class(),
            "UnsupportedClassificationError"
        );
        assert_eq!(run.exit_code(), 1);
        // VPC apply completed and is left in place
        assert_eq!(run.checkpoint.vpc_id.as_deref(), Some("vpc-0abc123"));
        assert_eq!(run.checkpoint.stage_status(Stage::PhasedApply), Some(StageStatus::Succeeded));
        assert_eq!(run.checkpoint.open_branches(), vec![request.branch_name()]);
        // Nothing peering-related was touched
        assert!(fx.cloud.calls().is_empty());
        assert!(fx.generator.calls().is_empty());
        assert_eq!(
            fx.vcs
                .calls()
                .iter()
                .filter(|c| c.starts_with("create_branch"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn scenario_e_transit_path_runs_once_regardless_of_peering() {
        for peering in [false, true] {
            let fx = Fixture::new(sample_allocation());
            let mut request = sample_request();
            request.transit = true;
            request.peering = peering;

            let run = fx.run(request).await;
            assert!(run.error.is_none(), "peering={peering}: {:?}", run.error);

            let calls = fx.cloud.calls();
            for op in [
                "put_bucket_policy",
                "put_key_policy",
                "fetch_object",
                "assume_role",
                "deploy_stack",
            ] {
                assert_eq!(
                    calls.iter().filter(|c| c.starts_with(op)).count(),
                    1,
                    "peering={peering}: {op} in {calls:?}"
                );
            }
            let doc = fx.cloud.bucket_policy_doc();
            assert!(doc.to_string().contains("arn:aws:iam::123456789012:root"));
        }
    }

    #[tokio::test]
    async fn invalid_account_id_halts_before_allocator() {
        let fx = Fixture::new(sample_allocation());
        let mut request = sample_request();
        request.account_id = "12345".into();

        let run = fx.run(request).await;
        assert_eq!(run.error.as_ref().unwrap().class(), "ValidationError");
        assert_eq!(run.exit_code(), 2);
        assert_eq!(fx.allocator.calls(), 0);
        assert!(fx.vcs.calls().is_empty());
        assert!(run.checkpoint.artifacts.is_empty());
    }

    #[tokio::test]
    async fn invalid_segment_name_halts_before_any_side_effect() {
        let fx = Fixture::new(sample_allocation());
        let mut request = sample_request();
        request.name = "bad name!".into();

        let run = fx.run(request).await;
        assert_eq!(run.exit_code(), 2);
        assert_eq!(fx.allocator.calls(), 0);
        assert!(fx.iac.calls().is_empty());
    }

    #[tokio::test]
    async fn allocator_failure_has_no_side_effects() {
        let fx = Fixture::with_allocator(FakeAllocator::failing());
        let run = fx.run(sample_request()).await;
        assert_eq!(run.error.as_ref().unwrap().class(), "AllocationError");
        assert!(run.error.as_ref().unwrap().is_side_effect_free());
        assert_eq!(run.exit_code(), 1);
        assert!(!fx.vcs.calls().iter().any(|c| c.starts_with("create_branch")));
    }

    #[tokio::test]
    async fn unreadable_allocator_result_records_the_reservation() {
        let fx = Fixture::with_allocator(FakeAllocator::unreadable_handoff());
        let run = fx.run(sample_request()).await;

        let err = run.error.as_ref().unwrap();
        assert_eq!(err.class(), "AllocationError");
        assert!(!err.is_side_effect_free());
        assert!(err.remediation().contains("allocation registry"));
        assert_eq!(run.exit_code(), 1);
        assert_eq!(
            run.checkpoint.artifacts,
            vec![SurvivingArtifact::UnconfirmedReservation {
                account_id: "123456789012".into(),
                name: "test-seg".into(),
                region: "us-east-1".into(),
            }]
        );
        assert!(!fx.vcs.calls().iter().any(|c| c.starts_with("create_branch")));
    }

    #[tokio::test]
    async fn hybrid_root_applied_only_for_internal_accounts() {
        for (classification, expect_hybrid) in [
            (AccountClassification::Internal, true),
            (AccountClassification::Production, false),
        ] {
            let mut allocation = sample_allocation();
            allocation.classification = classification;
            let fx = Fixture::new(allocation);
            let mut request = sample_request();
            request.peering = true;

            let run = fx.run(request).await;
            assert!(run.error.is_none(), "{:?}", run.error);
            let hybrid = fx
                .iac
                .calls()
                .iter()
                .any(|c| c.contains("shared_services/hybrid/"));
            assert_eq!(hybrid, expect_hybrid);
        }
    }

    #[tokio::test]
    async fn peering_run_merges_both_repositories() {
        let fx = Fixture::new(sample_allocation());
        let mut request = sample_request();
        request.peering = true;

        let run = fx.run(request.clone()).await;
        assert!(run.error.is_none(), "{:?}", run.error);
        let merges = fx
            .vcs
            .calls()
            .iter()
            .filter(|c| c.starts_with("merge_into_trunk"))
            .count();
        assert_eq!(merges, 2);
        assert_eq!(fx.generator.calls(), vec!["current prod", "legacy legacy-prod"]);
    }

    #[tokio::test]
    async fn transit_with_new_regional_dir_and_no_peering_skips_with_warning() {
        let mut allocation = sample_allocation();
        allocation.new_regional_dir =
            Some(PathBuf::from("accounts/123456789012/account_regional_us_east_1"));
        let fx = Fixture::new(allocation);
        let mut request = sample_request();
        request.transit = true;

        let run = fx.run(request).await;
        assert!(run.error.is_none());
        assert_eq!(run.checkpoint.stage_status(Stage::Cascade), Some(StageStatus::Skipped));
        assert!(run.checkpoint.warnings.iter().any(|w| w.contains("Transit requested")));
        assert!(fx.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn retryable_cascade_failure_is_recorded_with_severity() {
        let fx = Fixture::new(sample_allocation());
        fx.cloud.fail_on("deploy_stack");
        let mut request = sample_request();
        request.transit = true;

        let run = fx.run(request).await;
        match run.checkpoint.outcome {
            SagaOutcome::Failed {
                stage, severity, ..
            } => {
                assert_eq!(stage, Stage::Cascade);
                assert_eq!(severity, Some(CascadeSeverity::Retryable));
            }
            ref other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn advance_steps_one_stage_and_persists() {
        let fx = Fixture::new(sample_allocation());
        let mut saga = fx.saga(sample_request());
        assert_eq!(saga.next_stage(), Some(Stage::Validate));

        let next = saga.advance().await.unwrap();
        assert_eq!(next, Some(Stage::BindWorkspace));
        let stored = fx.store().load_current().unwrap().unwrap();
        assert_eq!(stored.run_id, saga.checkpoint().run_id);
        assert_eq!(stored.stage_status(Stage::Validate), Some(StageStatus::Succeeded));
        assert_eq!(fx.allocator.calls(), 0);
    }

    #[tokio::test]
    async fn missing_peering_repo_is_a_workspace_error() {
        let mut fx = Fixture::new(sample_allocation());
        fx.settings.workspace.peering_repo = None;
        let mut request = sample_request();
        request.peering = true;

        let run = fx.run(request).await;
        assert_eq!(run.error.as_ref().unwrap().class(), "WorkspaceError");
        assert_eq!(run.exit_code(), 2);
        assert_eq!(fx.allocator.calls(), 0);
    }
}
