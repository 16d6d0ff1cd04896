//! Staging generated code on a uniquely named branch.
//!
//! A pushed staging branch is the run's durability point: from here on the
//! generated code survives any abort.

use std::path::{Path, PathBuf};

use crate::allocator::AllocationResult;
use crate::checkpoint::ApplyCheckpoint;
use crate::errors::SagaError;
use crate::request::ProvisioningRequest;
use crate::tracker::VersionControl;

/// A staging branch in one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingHandle {
    pub repo: PathBuf,
    pub branch: String,
    pub pushed: bool,
}

/// Fail with `StagingConflict` if `branch` already exists on the remote.
///
/// Runs before the allocator so a repeated request reserves nothing.
pub async fn preflight(
    vcs: &dyn VersionControl,
    repo: &Path,
    branch: &str,
    remote: &str,
) -> Result<(), SagaError> {
    let exists = vcs
        .remote_branch_exists(repo, branch)
        .await
        .map_err(|e| SagaError::Workspace(format!("cannot query remote branches: {:#}", e)))?;
    if exists {
        return Err(SagaError::StagingConflict {
            branch: branch.to_string(),
            remote: remote.to_string(),
        });
    }
    Ok(())
}

/// Commit message citing the change record.
pub fn commit_message(request: &ProvisioningRequest, allocation: &AllocationResult) -> String {
    format!(
        "{}: new VPC {} ({}) in {} {}",
        request.change_record, request.name, allocation.cidr, request.account_id, request.region
    )
}

/// Path of `path` relative to `repo` when it lies inside it.
pub(crate) fn repo_relative(repo: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(repo)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `path` resolved against `repo` unless already absolute.
pub(crate) fn repo_path(repo: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo.join(path)
    }
}

/// Create the branch from trunk, commit the generated IaC and push.
///
/// The branch is tracked in the checkpoint as soon as it exists locally, so
/// a push failure still reports it. Finding nothing to commit is fatal: the
/// branch would carry none of the generated code.
pub async fn stage_changes(
    vcs: &dyn VersionControl,
    repo: &Path,
    request: &ProvisioningRequest,
    allocation: &AllocationResult,
    trunk: &str,
    remote: &str,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<StagingHandle, SagaError> {
    let branch = request.branch_name();
    preflight(vcs, repo, &branch, remote).await?;

    let push_error = |message: String| SagaError::StagingPush {
        branch: branch.clone(),
        message,
    };

    vcs.create_branch(repo, &branch, trunk)
        .await
        .map_err(|e| push_error(format!("{:#}", e)))?;
    checkpoint.track_branch(repo.to_path_buf(), &branch, false);

    let mut paths = vec![repo_relative(repo, &allocation.account_dir)];
    if let Some(ref regional) = allocation.new_regional_dir {
        paths.push(repo_relative(repo, regional));
    }
    let commit = vcs
        .commit_all(repo, &paths, &commit_message(request, allocation))
        .await
        .map_err(|e| push_error(format!("{:#}", e)))?;
    if commit.is_none() {
        return Err(push_error(format!(
            "the allocator generated no code under {}; nothing to stage",
            allocation.account_dir.display()
        )));
    }

    vcs.push(repo, &branch)
        .await
        .map_err(|e| push_error(format!("{:#}", e)))?;
    checkpoint.track_branch(repo.to_path_buf(), &branch, true);

    Ok(StagingHandle {
        repo: repo.to_path_buf(),
        branch,
        pushed: true,
    })
}
