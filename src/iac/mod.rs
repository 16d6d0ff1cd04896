//! Infrastructure-as-code engine seam.
//!
//! The saga only needs four capabilities from the engine: initialize a root,
//! apply it (optionally restricted to target addresses), import an existing
//! object, and read a resource's id back from state. [`Terraform`] implements
//! them by invoking the CLI; tests substitute a fake.

pub mod markers;
pub mod terraform;

pub use terraform::Terraform;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IacRun {
    pub succeeded: bool,
    /// Short diagnostic (exit code and output tail) for failed runs
    pub detail: String,
}

impl IacRun {
    pub fn ok() -> Self {
        Self {
            succeeded: true,
            detail: String::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait IacEngine: Send + Sync {
    async fn init(&self, root: &Path) -> Result<IacRun>;

    /// Apply the root; a non-empty `targets` restricts the apply to those addresses.
    async fn apply(&self, root: &Path, targets: &[String]) -> Result<IacRun>;

    async fn import(&self, root: &Path, address: &str, id: &str) -> Result<IacRun>;

    /// Read the `id` attribute of `address` from state; `None` if absent or empty.
    async fn resource_id(&self, root: &Path, address: &str) -> Result<Option<String>>;
}

/// Run init then a full apply, returning the first failing step.
pub async fn init_and_apply(
    engine: &dyn IacEngine,
    root: &Path,
) -> Result<Result<(), (&'static str, String)>> {
    let init = engine.init(root).await?;
    if !init.succeeded {
        return Ok(Err(("init", init.detail)));
    }
    let apply = engine.apply(root, &[]).await?;
    if !apply.succeeded {
        return Ok(Err(("apply", apply.detail)));
    }
    Ok(Ok(()))
}
