use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

use super::markers::{APPLY_MARKER, IMPORT_MARKER, INIT_MARKER, contains_marker};
use super::{IacEngine, IacRun};
use crate::process::{self, CommandOutput};
use crate::provision_config::StatusMode;

/// Terraform (or a compatible CLI such as OpenTofu) driven as a subprocess.
pub struct Terraform {
    command: String,
    status: StatusMode,
    extra_apply_args: Vec<String>,
}

impl Terraform {
    pub fn new(command: impl Into<String>, status: StatusMode, extra_apply_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            status,
            extra_apply_args,
        }
    }

    fn judge(&self, output: &CommandOutput, marker: &str) -> IacRun {
        let passed = match self.status {
            StatusMode::ExitCode => output.success(),
            StatusMode::Markers => output.success() && contains_marker(&output.stdout, marker),
        };
        if passed {
            IacRun::ok()
        } else {
            IacRun::failed(output.failure_summary())
        }
    }

    async fn invoke(&self, root: &Path, args: Vec<String>) -> Result<CommandOutput> {
        process::run_command_line(&self.command, args, Some(root), &[])
            .await
            .with_context(|| format!("Failed to run {} in {}", self.command, root.display()))
    }

    pub(crate) fn apply_args(&self, targets: &[String]) -> Vec<String> {
        let mut args = process::args(["apply", "-auto-approve", "-input=false", "-no-color"]);
        args.extend(targets.iter().map(|t| format!("-target={}", t)));
        args.extend(self.extra_apply_args.iter().cloned());
        args
    }
}

#[async_trait]
impl IacEngine for Terraform {
    async fn init(&self, root: &Path) -> Result<IacRun> {
        let output = self
            .invoke(root, process::args(["init", "-input=false", "-no-color"]))
            .await?;
        Ok(self.judge(&output, INIT_MARKER))
    }

    async fn apply(&self, root: &Path, targets: &[String]) -> Result<IacRun> {
        let output = self.invoke(root, self.apply_args(targets)).await?;
        Ok(self.judge(&output, APPLY_MARKER))
    }

    async fn import(&self, root: &Path, address: &str, id: &str) -> Result<IacRun> {
        let output = self
            .invoke(
                root,
                process::args(["import", "-input=false", "-no-color", address, id]),
            )
            .await?;
        Ok(self.judge(&output, IMPORT_MARKER))
    }

    async fn resource_id(&self, root: &Path, address: &str) -> Result<Option<String>> {
        let output = self
            .invoke(root, process::args(["show", "-json", "-no-color"]))
            .await?;
        if !output.success() {
            anyhow::bail!("state show {}", output.failure_summary());
        }
        let state: Value =
            serde_json::from_str(output.stdout.trim()).context("State output is not JSON")?;
        Ok(find_resource_id(&state, address))
    }
}

/// Walk `values.root_module` (and nested child modules) for `address`.
pub fn find_resource_id(state: &Value, address: &str) -> Option<String> {
    fn walk(module: &Value, address: &str) -> Option<String> {
        let in_resources = module
            .get("resources")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|r| r.get("address").and_then(Value::as_str) == Some(address))
            .and_then(|r| r.pointer("/values/id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        in_resources.or_else(|| {
            module
                .get("child_modules")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find_map(|child| walk(child, address))
        })
    }

    state
        .pointer("/values/root_module")
        .and_then(|root| walk(root, address))
}
