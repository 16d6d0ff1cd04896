//! Binding the working copies and scratch space a run operates in.

use git2::Repository;
use std::path::{Path, PathBuf};

use crate::errors::SagaError;
use crate::provision_config::WorkspaceSection;
use crate::request::ProvisioningRequest;

/// Directories a run is bound to. Fixed for the lifetime of the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub vpc_repo: PathBuf,
    /// Only bound when the request asks for peering
    pub peering_repo: Option<PathBuf>,
    pub scratch_dir: PathBuf,
}

/// Resolve the configured directories for `request`.
///
/// Both repositories must be git working copies with `remote` configured.
/// The scratch directory is created if missing. Nothing outside the local
/// filesystem is touched.
pub fn bind(
    section: &WorkspaceSection,
    remote: &str,
    request: &ProvisioningRequest,
) -> Result<Workspace, SagaError> {
    let vpc_repo = check_repository(&section.vpc_repo, remote)?;

    let peering_repo = if request.peering {
        let path = section.peering_repo.as_ref().ok_or_else(|| {
            SagaError::Workspace(
                "peering requested but workspace.peering_repo is not configured".to_string(),
            )
        })?;
        Some(check_repository(path, remote)?)
    } else {
        None
    };

    std::fs::create_dir_all(&section.scratch_dir).map_err(|e| {
        SagaError::Workspace(format!(
            "cannot create scratch dir {}: {}",
            section.scratch_dir.display(),
            e
        ))
    })?;

    tracing::debug!(vpc_repo = %vpc_repo.display(), peering = request.peering, "workspace bound");
    Ok(Workspace {
        vpc_repo,
        peering_repo,
        scratch_dir: section.scratch_dir.clone(),
    })
}

fn check_repository(path: &Path, remote: &str) -> Result<PathBuf, SagaError> {
    let repo = Repository::open(path).map_err(|e| {
        SagaError::Workspace(format!("{} is not a git repository: {}", path.display(), e.message()))
    })?;
    if repo.is_bare() {
        return Err(SagaError::Workspace(format!(
            "{} is a bare repository",
            path.display()
        )));
    }
    repo.find_remote(remote).map_err(|_| {
        SagaError::Workspace(format!(
            "{} has no remote named '{}'",
            path.display(),
            remote
        ))
    })?;
    let root = repo
        .workdir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf());
    Ok(root)
}
