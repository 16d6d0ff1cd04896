//! Merging staging branches back to trunk, or leaving them for review.

use super::staging::StagingHandle;
use crate::checkpoint::{ApplyCheckpoint, SagaOutcome, Stage, StageStatus};
use crate::errors::SagaError;
use crate::tracker::VersionControl;

/// Merge and delete each staging branch in order, or report them unmerged.
///
/// Handles are processed in the order given (VPC repository first). A
/// failure leaves the remaining branches in the checkpoint.
pub async fn finalize(
    vcs: &dyn VersionControl,
    handles: &[StagingHandle],
    merge: bool,
    trunk: &str,
    checkpoint: &mut ApplyCheckpoint,
) -> Result<SagaOutcome, SagaError> {
    if !merge {
        let branches: Vec<String> = handles.iter().map(|h| h.branch.clone()).collect();
        for handle in handles {
            checkpoint.warn(format!(
                "{} is not merged; {} in {} is out of sync with deployed infrastructure",
                handle.branch,
                trunk,
                handle.repo.display()
            ));
        }
        return Ok(SagaOutcome::SucceededUnmerged { branches });
    }

    for handle in handles {
        let merge_error = |e: anyhow::Error| SagaError::Merge {
            branch: handle.branch.clone(),
            trunk: trunk.to_string(),
            message: format!("{:#}", e),
        };
        vcs.merge_into_trunk(&handle.repo, &handle.branch, trunk)
            .await
            .map_err(merge_error)?;
        vcs.delete_branch(&handle.repo, &handle.branch)
            .await
            .map_err(merge_error)?;
        checkpoint.forget_branch(&handle.repo, &handle.branch);
        checkpoint.record(
            Stage::Finalize,
            Some("merge"),
            StageStatus::Succeeded,
            format!("{} -> {} in {}", handle.branch, trunk, handle.repo.display()),
        );
    }
    Ok(SagaOutcome::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::sample_request;
    use crate::checkpoint::SurvivingArtifact;
    use crate::testing::FakeVcs;
    use std::path::{Path, PathBuf};

    fn handles() -> Vec<StagingHandle> {
        vec![
            StagingHandle {
                repo: PathBuf::from("/tf"),
                branch: "hotfix/a".into(),
                pushed: true,
            },
            StagingHandle {
                repo: PathBuf::from("/ss"),
                branch: "hotfix/a".into(),
                pushed: true,
            },
        ]
    }

    #[tokio::test]
    async fn test_merge_then_delete_each_repo() {
        let vcs = FakeVcs::default();
        let mut cp = ApplyCheckpoint::new(sample_request());
        for h in handles() {
            cp.track_branch(h.repo.clone(), &h.branch, true);
        }

        let outcome = finalize(&vcs, &handles(), true, "master", &mut cp).await.unwrap();
        assert_eq!(outcome, SagaOutcome::Succeeded);
        assert_eq!(
            vcs.calls(),
            vec![
                "merge_into_trunk hotfix/a into master",
                "delete_branch hotfix/a",
                "merge_into_trunk hotfix/a into master",
                "delete_branch hotfix/a",
            ]
        );
        assert!(cp.open_branches().is_empty());
    }

    #[tokio::test]
    async fn test_unmerged_warns_and_names_branches() {
        let vcs = FakeVcs::default();
        let mut cp = ApplyCheckpoint::new(sample_request());
        let outcome = finalize(&vcs, &handles()[..1], false, "master", &mut cp)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SagaOutcome::SucceededUnmerged {
                branches: vec!["hotfix/a".into()]
            }
        );
        assert!(vcs.calls().is_empty());
        assert!(cp.warnings[0].contains("out of sync"));
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_branch() {
        let vcs = FakeVcs::default();
        vcs.fail_on("merge_into_trunk");
        let mut cp = ApplyCheckpoint::new(sample_request());
        cp.track_branch(PathBuf::from("/tf"), "hotfix/a", true);

        let err = finalize(&vcs, &handles(), true, "master", &mut cp)
            .await
            .unwrap_err();
        assert_eq!(err.class(), "MergeError");
        assert_eq!(cp.open_branches(), vec!["hotfix/a"]);
    }

    #[tokio::test]
    async fn test_second_repo_merge_failure_keeps_its_branch() {
        let vcs = FakeVcs::default();
        vcs.fail_on_repo("merge_into_trunk", Path::new("/ss"));
        let mut cp = ApplyCheckpoint::new(sample_request());
        for h in handles() {
            cp.track_branch(h.repo.clone(), &h.branch, true);
        }

        let err = finalize(&vcs, &handles(), true, "master", &mut cp)
            .await
            .unwrap_err();
        assert_eq!(err.class(), "MergeError");
        assert_eq!(
            cp.artifacts,
            vec![SurvivingArtifact::StagingBranch {
                repo: PathBuf::from("/ss"),
                branch: "hotfix/a".into(),
                pushed: true,
            }]
        );
        assert_eq!(cp.open_branches(), vec!["hotfix/a"]);
        assert_eq!(
            vcs.calls(),
            vec![
                "merge_into_trunk hotfix/a into master",
                "delete_branch hotfix/a",
                "merge_into_trunk hotfix/a into master",
            ]
        );
    }
}
