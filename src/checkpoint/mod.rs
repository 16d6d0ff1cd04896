//! The saga's recovery record.
//!
//! An [`ApplyCheckpoint`] is an ordered log of every stage the saga attempted
//! plus the external side effects that outlive the run. It is persisted after
//! each transition by [`CheckpointStore`] and rendered to the operator on any
//! fatal abort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::allocator::AllocationResult;
use crate::errors::{CascadeSeverity, SagaError};
use crate::request::ProvisioningRequest;

pub mod store;
pub use store::CheckpointStore;

/// Saga stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    BindWorkspace,
    BranchPreflight,
    Allocate,
    StageChanges,
    PhasedApply,
    Peering,
    Cascade,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Validate,
        Stage::BindWorkspace,
        Stage::BranchPreflight,
        Stage::Allocate,
        Stage::StageChanges,
        Stage::PhasedApply,
        Stage::Peering,
        Stage::Cascade,
        Stage::Finalize,
    ];

    /// The stage after this one, or `None` after finalize.
    pub fn next(self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Validate => "Validate request",
            Stage::BindWorkspace => "Bind workspace",
            Stage::BranchPreflight => "Branch preflight",
            Stage::Allocate => "Allocate CIDR",
            Stage::StageChanges => "Stage changes",
            Stage::PhasedApply => "Phased apply",
            Stage::Peering => "Peering",
            Stage::Cascade => "Cascade apply",
            Stage::Finalize => "Finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One entry in the checkpoint log. `step` names a sub-step within the
/// stage, e.g. `targeted_apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub status: StageStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// A side effect that exists outside this process and that no one will
/// undo automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurvivingArtifact {
    CidrReservation {
        resource_id: String,
        cidr: String,
    },
    ConfigParameter {
        name: String,
    },
    /// The allocator succeeded but its result was unreadable, so the
    /// reserved block is not known.
    UnconfirmedReservation {
        account_id: String,
        name: String,
        region: String,
    },
    StagingBranch {
        repo: PathBuf,
        branch: String,
        pushed: bool,
    },
    Infrastructure {
        root: PathBuf,
        /// Confirmed identity, once known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        /// Set once the apply in `root` completed
        #[serde(default)]
        applied: bool,
    },
}

impl SurvivingArtifact {
    pub fn describe(&self) -> String {
        match self {
            SurvivingArtifact::CidrReservation { resource_id, cidr } => {
                format!("CIDR reservation {} for {}", cidr, resource_id)
            }
            SurvivingArtifact::ConfigParameter { name } => {
                format!("Configuration parameter {}", name)
            }
            SurvivingArtifact::UnconfirmedReservation {
                account_id,
                name,
                region,
            } => format!(
                "CIDR reservation for {} in {}/{} (block unknown; check the allocation registry)",
                name, account_id, region
            ),
            SurvivingArtifact::StagingBranch {
                repo,
                branch,
                pushed,
            } => format!(
                "Branch {} in {} ({})",
                branch,
                repo.display(),
                if *pushed { "pushed" } else { "local only" }
            ),
            SurvivingArtifact::Infrastructure {
                root,
                resource,
                applied,
            } => match (resource, applied) {
                (Some(id), _) => {
                    format!("Infrastructure applied from {} ({})", root.display(), id)
                }
                (None, true) => format!("Infrastructure applied from {}", root.display()),
                (None, false) => format!(
                    "Infrastructure possibly applied from {} (unconfirmed)",
                    root.display()
                ),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SagaOutcome {
    InProgress,
    Succeeded,
    /// Everything deployed, but trunk does not contain the staged code.
    SucceededUnmerged { branches: Vec<String> },
    Failed {
        stage: Stage,
        class: String,
        message: String,
        remediation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<CascadeSeverity>,
    },
}

impl SagaOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaOutcome::InProgress)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SagaOutcome::Succeeded | SagaOutcome::SucceededUnmerged { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyCheckpoint {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub request: ProvisioningRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
    pub records: Vec<StageRecord>,
    pub artifacts: Vec<SurvivingArtifact>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    pub outcome: SagaOutcome,
}

impl ApplyCheckpoint {
    pub fn new(request: ProvisioningRequest) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            request,
            allocation: None,
            records: Vec::new(),
            artifacts: Vec::new(),
            warnings: Vec::new(),
            vpc_id: None,
            outcome: SagaOutcome::InProgress,
        }
    }

    pub fn record(
        &mut self,
        stage: Stage,
        step: Option<&str>,
        status: StageStatus,
        detail: impl Into<String>,
    ) {
        self.records.push(StageRecord {
            stage,
            step: step.map(str::to_string),
            status,
            at: Utc::now(),
            detail: detail.into(),
        });
    }

    /// Add an artifact unless an equal one is already listed.
    pub fn add_artifact(&mut self, artifact: SurvivingArtifact) {
        if !self.artifacts.contains(&artifact) {
            self.artifacts.push(artifact);
        }
    }

    /// Record a local branch, or flip an existing entry to pushed.
    pub fn track_branch(&mut self, repo: PathBuf, branch: &str, pushed: bool) {
        for artifact in &mut self.artifacts {
            if let SurvivingArtifact::StagingBranch {
                repo: r,
                branch: b,
                pushed: p,
            } = artifact
                && *r == repo
                && b == branch
            {
                *p = pushed;
                return;
            }
        }
        self.artifacts.push(SurvivingArtifact::StagingBranch {
            repo,
            branch: branch.to_string(),
            pushed,
        });
    }

    /// Drop a branch from one repository after it was merged and deleted.
    /// The same branch name in another repository stays listed.
    pub fn forget_branch(&mut self, repo: &std::path::Path, branch: &str) {
        self.artifacts.retain(|a| {
            !matches!(
                a,
                SurvivingArtifact::StagingBranch { repo: r, branch: b, .. }
                    if r == repo && b == branch
            )
        });
    }

    /// Attach a confirmed identity to an infrastructure artifact.
    pub fn confirm_infrastructure(&mut self, root: &std::path::Path, resource: &str) {
        for artifact in &mut self.artifacts {
            if let SurvivingArtifact::Infrastructure {
                root: r,
                resource: id,
                applied,
            } = artifact
                && r == root
            {
                *id = Some(resource.to_string());
                *applied = true;
            }
        }
    }

    /// Mark an infrastructure root as applied when it has no single identity
    /// to confirm.
    pub fn mark_applied(&mut self, root: &std::path::Path) {
        for artifact in &mut self.artifacts {
            if let SurvivingArtifact::Infrastructure {
                root: r, applied, ..
            } = artifact
                && r == root
            {
                *applied = true;
            }
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn fail(&mut self, stage: Stage, error: &SagaError) {
        let severity = match error {
            SagaError::CascadeApply { severity, .. } => Some(*severity),
            _ => None,
        };
        self.record(stage, None, StageStatus::Failed, error.to_string());
        self.finish(SagaOutcome::Failed {
            stage,
            class: error.class().to_string(),
            message: error.to_string(),
            remediation: error.remediation(),
            severity,
        });
    }

    pub fn finish(&mut self, outcome: SagaOutcome) {
        self.outcome = outcome;
        self.ended_at = Some(Utc::now());
    }

    /// Branches still listed as surviving artifacts.
    pub fn open_branches(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|a| match a {
                SurvivingArtifact::StagingBranch { branch, .. } => Some(branch.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last recorded status for `stage` (stage-level entries only).
    pub fn stage_status(&self, stage: Stage) -> Option<StageStatus> {
        self.records
            .iter()
            .rev()
            .find(|r| r.stage == stage && r.step.is_none())
            .map(|r| r.status)
    }

    /// Plain-text recovery summary: outcome, surviving side effects, warnings.
    pub fn render_remediation(&self) -> String {
        let mut out = String::new();
        match &self.outcome {
            SagaOutcome::Failed {
                stage,
                class,
                message,
                remediation,
                ..
            } => {
                out.push_str(&format!("{} at stage '{}'\n", class, stage));
                out.push_str(&format!("  {}\n", message));
                out.push_str(&format!("Next step: {}\n", remediation));
            }
            SagaOutcome::SucceededUnmerged { branches } => {
                out.push_str(
                    "Provisioned, but trunk is OUT OF SYNC with deployed infrastructure.\n",
                );
                for branch in branches {
                    out.push_str(&format!("  unmerged: {}\n", branch));
                }
            }
            SagaOutcome::Succeeded => out.push_str("Provisioned and merged.\n"),
            SagaOutcome::InProgress => out.push_str("Run did not reach a terminal state.\n"),
        }

        if self.artifacts.is_empty() {
            out.push_str("No external side effects were created.\n");
        } else {
            out.push_str("Still existing:\n");
            for artifact in &self.artifacts {
                out.push_str(&format!("  - {}\n", artifact.describe()));
            }
        }

        if !self.warnings.is_empty() {
            out.push_str("Warnings:\n");
            for warning in &self.warnings {
                out.push_str(&format!("  - {}\n", warning));
            }
        }
        out
    }
}
