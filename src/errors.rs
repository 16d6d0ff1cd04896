//! Typed error taxonomy for the provisioning saga.
//!
//! Every variant of [`SagaError`] is fatal: the saga halts at the stage that
//! raised it and the checkpoint is rendered to the operator. Nothing is rolled
//! back, so each class carries its own forward-recovery guidance via
//! [`SagaError::remediation`]. Best-effort failures (DNS association and
//! sharing, the legacy parameter import) never become a `SagaError`; they are
//! recorded as checkpoint warnings instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// How a cascade failure should be treated by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeSeverity {
    /// A regional root failed to apply; shared infrastructure may be inconsistent.
    Fatal,
    /// An idempotent step (policy patch, stack deploy) failed and can be re-run as is.
    Retryable,
}

impl std::fmt::Display for CascadeSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CascadeSeverity::Fatal => write!(f, "fatal"),
            CascadeSeverity::Retryable => write!(f, "retryable"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Request validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Workspace binding failed: {0}")]
    Workspace(String),

    /// `reserved` is set when the allocator exited successfully but its
    /// result was unreadable.
    #[error("Allocator failed: {message}")]
    Allocation { message: String, reserved: bool },

    #[error("Staging branch {branch} already exists on remote {remote}")]
    StagingConflict { branch: String, remote: String },

    #[error("Failed to stage branch {branch}: {message}")]
    StagingPush { branch: String, message: String },

    #[error("IaC init failed in {}: {message}", root.display())]
    ApplyInit { root: PathBuf, message: String },

    #[error("IaC {phase} failed in {}: {message}", root.display())]
    ApplyExec {
        phase: String,
        root: PathBuf,
        message: String,
    },

    #[error("Apply succeeded but the identity of {address} in {} could not be confirmed", root.display())]
    IdentityLookup { root: PathBuf, address: String },

    #[error("Unsupported account classification '{0}'")]
    UnsupportedClassification(String),

    #[error("Peering route generation failed: {0}")]
    PeeringGeneration(String),

    #[error("Peering acceptance apply failed in {}: {message}", root.display())]
    PeeringApply { root: PathBuf, message: String },

    #[error("Cascade apply of {target} failed ({severity}): {message}")]
    CascadeApply {
        target: String,
        severity: CascadeSeverity,
        message: String,
    },

    #[error("Failed to merge {branch} into {trunk}: {message}")]
    Merge {
        branch: String,
        trunk: String,
        message: String,
    },

    #[error("Failed to persist checkpoint: {0:#}")]
    Checkpoint(#[source] anyhow::Error),
}

impl SagaError {
    /// Stable class name used in the checkpoint and the operator summary.
    pub fn class(&self) -> &'static str {
        match self {
            SagaError::Validation(_) => "ValidationError",
            SagaError::Workspace(_) => "WorkspaceError",
            SagaError::Allocation { .. } => "AllocationError",
            SagaError::StagingConflict { .. } => "StagingConflictError",
            SagaError::StagingPush { .. } => "StagingPushError",
            SagaError::ApplyInit { .. } => "ApplyInitError",
            SagaError::ApplyExec { .. } => "ApplyExecError",
            SagaError::IdentityLookup { .. } => "IdentityLookupError",
            SagaError::UnsupportedClassification(_) => "UnsupportedClassificationError",
            SagaError::PeeringGeneration(_) => "PeeringGenerationError",
            SagaError::PeeringApply { .. } => "PeeringApplyError",
            SagaError::CascadeApply { .. } => "CascadeApplyError",
            SagaError::Merge { .. } => "MergeError",
            SagaError::Checkpoint(_) => "CheckpointError",
        }
    }

    /// True for classes raised before the saga touched anything external.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            SagaError::Validation(_)
                | SagaError::Workspace(_)
                | SagaError::Allocation {
                    reserved: false,
                    ..
                }
                | SagaError::StagingConflict { .. }
        )
    }

    /// Process exit code: 2 when the request itself was rejected (invalid,
    /// unbindable, or already in flight), 1 for every other fatal class.
    pub fn exit_code(&self) -> i32 {
        match self {
            SagaError::Validation(_)
            | SagaError::Workspace(_)
            | SagaError::StagingConflict { .. } => 2,
            _ => 1,
        }
    }

    /// Forward-recovery guidance for the operator.
    pub fn remediation(&self) -> String {
        match self {
            SagaError::Validation(_) => {
                "Fix the request parameters and re-run. Nothing was reserved or pushed.".to_string()
            }
            SagaError::Workspace(_) => {
                "Fix the workspace configuration (repository paths, scratch directory) and re-run. Nothing was reserved or pushed.".to_string()
            }
            SagaError::Allocation {
                reserved: false, ..
            } => {
                "The allocator reserves nothing unless it succeeds. Inspect its output and re-run.".to_string()
            }
            SagaError::Allocation { reserved: true, .. } => {
                "The allocator reported success, so a CIDR block is most likely reserved. Look the reservation up in the allocation registry and finish from it by hand; re-running reserves another block.".to_string()
            }
            SagaError::StagingConflict { branch, .. } => format!(
                "Another run owns {branch}. Wait for it to finish, or merge/delete that branch before retrying."
            ),
            SagaError::StagingPush { branch, .. } => format!(
                "The CIDR reservation still exists; do not re-run allocation. Make sure {branch} carries the generated code, then push it manually (or fix credentials and retry the push)."
            ),
            SagaError::ApplyInit { root, .. } => format!(
                "Generated code is on the staging branch. Fix the backend/provider issue and run init + apply in {} from that branch.",
                root.display()
            ),
            SagaError::ApplyExec { root, .. } => format!(
                "Infrastructure in {} may be partially applied. Check out the staging branch, review the plan and re-apply; do not destroy the segment.",
                root.display()
            ),
            SagaError::IdentityLookup { root, address } => format!(
                "{address} was applied but its id could not be read. Confirm it exists (state show in {}) before any retry; never abandon it.",
                root.display()
            ),
            SagaError::UnsupportedClassification(c) => format!(
                "Classification '{c}' has no peering routes. The segment stays deployed and unmerged; add a route mapping and finish peering manually."
            ),
            SagaError::PeeringGeneration(_) => {
                "Generated peering code may be uncommitted in the peering repository. Clean the working tree, then regenerate from the reported branch.".to_string()
            }
            SagaError::PeeringApply { root, .. } => format!(
                "Peering code is pushed. Re-apply {} from the peering branch.",
                root.display()
            ),
            SagaError::CascadeApply {
                target,
                severity: CascadeSeverity::Retryable,
                ..
            } => format!("{target} is idempotent and safe to re-run as is."),
            SagaError::CascadeApply { target, .. } => format!(
                "Shared regional root {target} failed mid-apply. Re-apply it from trunk plus the staging branch before provisioning anything else in the region."
            ),
            SagaError::Merge { branch, trunk, .. } => format!(
                "Infrastructure is deployed but {trunk} is out of sync. Resolve the merge of {branch} manually and push {trunk}."
            ),
            SagaError::Checkpoint(_) => {
                "The saga could not record its progress. Check the state directory permissions; the operator log holds the stage history.".to_string()
            }
        }
    }
}
