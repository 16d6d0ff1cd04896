use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, IndexAddOption, Repository, Signature, build::CheckoutBuilder};
use std::path::{Path, PathBuf};

use crate::process::{self, CommandOutput};

/// Version-control operations the saga performs against a staging repository.
///
/// Every method names the working copy it acts on, since one run can stage
/// changes in two repositories.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Whether `branch` exists on the remote.
    async fn remote_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// Whether `branch` exists in the local working copy.
    async fn local_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// Bring `base` up to date with the remote, then create and check out
    /// `name` at its tip. Untracked files in the working tree are kept.
    async fn create_branch(&self, repo: &Path, name: &str, base: &str) -> Result<()>;

    /// Check out an existing branch, fetching it from the remote when only
    /// the remote copy exists.
    async fn checkout_existing(&self, repo: &Path, name: &str) -> Result<()>;

    /// Stage `paths` (relative to the repository root) and commit them.
    /// Returns `None` when there was nothing to commit.
    async fn commit_all(&self, repo: &Path, paths: &[PathBuf], message: &str)
    -> Result<Option<String>>;

    async fn push(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Merge `branch` into `trunk` with a merge commit and push `trunk`.
    async fn merge_into_trunk(&self, repo: &Path, branch: &str, trunk: &str) -> Result<()>;

    /// Delete `branch` locally and on the remote.
    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;
}

/// [`VersionControl`] backed by git2 for local object work and the `git`
/// CLI for anything that talks to the remote.
pub struct GitVcs {
    remote: String,
    token: Option<String>,
    author_name: String,
    author_email: String,
}

impl GitVcs {
    pub fn new(
        remote: impl Into<String>,
        token: Option<String>,
        author_name: impl Into<String>,
        author_email: impl Into<String>,
    ) -> Self {
        Self {
            remote: remote.into(),
            token: token.filter(|t| !t.is_empty()),
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    fn remote_url(&self, repo: &Path) -> Result<String> {
        let repository = open(repo)?;
        let remote = repository
            .find_remote(&self.remote)
            .with_context(|| format!("Remote '{}' not configured in {}", self.remote, repo.display()))?;
        let url = remote
            .url()
            .with_context(|| format!("Remote '{}' has no usable URL", self.remote))?;
        Ok(authenticated_url(url, self.token.as_deref()))
    }

    /// Run `git` in `repo`, failing on a non-zero exit. The token is scrubbed
    /// from any error text.
    async fn git(&self, repo: &Path, args: Vec<String>) -> Result<CommandOutput> {
        let mut full = vec![
            "-c".to_string(),
            format!("user.name={}", self.author_name),
            "-c".to_string(),
            format!("user.email={}", self.author_email),
        ];
        let verb = args.first().cloned().unwrap_or_default();
        full.extend(args);
        let envs = [("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        let output = process::run("git", &full, Some(repo), &envs).await?;
        if !output.success() {
            bail!(
                "git {} failed: {}",
                verb,
                redact(&output.failure_summary(), self.token.as_deref())
            );
        }
        Ok(output)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Signature::now(&self.author_name, &self.author_email)
            .context("Failed to build commit signature")
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn remote_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let url = self.remote_url(repo)?;
        let head_ref = format!("refs/heads/{}", branch);
        let output = self
            .git(
                repo,
                process::args(["ls-remote", "--heads", url.as_str(), head_ref.as_str()]),
            )
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn local_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let repository = open(repo)?;
        Ok(repository.find_branch(branch, BranchType::Local).is_ok())
    }

    async fn create_branch(&self, repo: &Path, name: &str, base: &str) -> Result<()> {
        checkout_local(repo, base)?;
        let url = self.remote_url(repo)?;
        self.git(repo, process::args(["pull", "--ff-only", url.as_str(), base]))
            .await
            .with_context(|| format!("Failed to update {} from remote", base))?;

        {
            let repository = open(repo)?;
            let tip = repository
                .revparse_single(&format!("refs/heads/{}", base))
                .and_then(|obj| obj.peel_to_commit())
                .with_context(|| format!("Base branch '{}' has no commits", base))?;
            repository
                .branch(name, &tip, false)
                .with_context(|| format!("Failed to create branch '{}'", name))?;
        }
        checkout_local(repo, name)?;
        tracing::info!(branch = %name, base = %base, "created staging branch");
        Ok(())
    }

    async fn checkout_existing(&self, repo: &Path, name: &str) -> Result<()> {
        if !self.local_branch_exists(repo, name).await? {
            let url = self.remote_url(repo)?;
            let refspec = format!("refs/heads/{0}:refs/heads/{0}", name);
            self.git(repo, process::args(["fetch", url.as_str(), refspec.as_str()]))
            .await
            .with_context(|| format!("Failed to fetch branch '{}'", name))?;
        }
        checkout_local(repo, name)?;
        tracing::info!(branch = %name, "reusing staging branch");
        Ok(())
    }

    async fn commit_all(
        &self,
        repo: &Path,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<Option<String>> {
        let repository = open(repo)?;
        let mut index = repository.index()?;
        let specs: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        index
            .add_all(specs.iter(), IndexAddOption::DEFAULT, None)
            .context("Failed to stage generated files")?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repository
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        if let Some(ref parent) = parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repository.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repository
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to commit staged files")?;
        Ok(Some(oid.to_string()))
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<()> {
        let url = self.remote_url(repo)?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.git(repo, process::args(["push", url.as_str(), refspec.as_str()]))
            .await?;
        tracing::info!(branch = %branch, "pushed");
        Ok(())
    }

    async fn merge_into_trunk(&self, repo: &Path, branch: &str, trunk: &str) -> Result<()> {
        checkout_local(repo, trunk)?;
        let url = self.remote_url(repo)?;
        self.git(repo, process::args(["pull", "--ff-only", url.as_str(), trunk]))
            .await?;
        self.git(
            repo,
            vec![
                "merge".to_string(),
                "--no-ff".to_string(),
                "-m".to_string(),
                format!("Merge branch '{}'", branch),
                branch.to_string(),
            ],
        )
        .await?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", trunk);
        self.git(repo, process::args(["push", url.as_str(), refspec.as_str()]))
            .await?;
        tracing::info!(branch = %branch, trunk = %trunk, "merged");
        Ok(())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        {
            let repository = open(repo)?;
            if let Ok(mut local) = repository.find_branch(branch, BranchType::Local) {
                local
                    .delete()
                    .with_context(|| format!("Failed to delete local branch '{}'", branch))?;
            }
        }
        let url = self.remote_url(repo)?;
        self.git(repo, process::args(["push", url.as_str(), "--delete", branch]))
            .await?;
        tracing::info!(branch = %branch, "deleted branch");
        Ok(())
    }
}

fn open(repo: &Path) -> Result<Repository> {
    Repository::open(repo)
        .with_context(|| format!("Failed to open git repository at {}", repo.display()))
}

/// Check out a local branch, leaving untracked files alone.
fn checkout_local(repo: &Path, branch: &str) -> Result<()> {
    let repository = open(repo)?;
    let refname = format!("refs/heads/{}", branch);
    let target = repository
        .revparse_single(&refname)
        .with_context(|| format!("Branch '{}' not found", branch))?;
    repository
        .checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
        .with_context(|| format!("Failed to check out '{}'", branch))?;
    repository.set_head(&refname)?;
    Ok(())
}

/// Embed an access token in an HTTPS remote URL. Other URL schemes pass
/// through untouched.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (token, url.strip_prefix("https://")) {
        (Some(token), Some(rest)) => {
            let host_and_path = rest.split_once('@').map_or(rest, |(_, after)| after);
            format!("https://x-access-token:{}@{}", token, host_and_path)
        }
        _ => url.to_string(),
    }
}

fn redact(text: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => text.replace(token, "***"),
        None => text.to_string(),
    }
}
