use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use super::{CloudClient, Credentials, StackDeployment};
use crate::process::{self, CommandOutput};

/// [`CloudClient`] that shells out to the `aws` CLI with JSON output.
pub struct AwsCli {
    command: String,
    region: String,
    scratch_dir: PathBuf,
}

impl AwsCli {
    /// `region` is used for global and control-plane calls; per-VPC calls
    /// carry the VPC's own region.
    pub fn new(command: impl Into<String>, region: impl Into<String>, scratch_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            region: region.into(),
            scratch_dir,
        }
    }

    async fn call(&self, args: Vec<String>, envs: &[(String, String)]) -> Result<CommandOutput> {
        let mut full = args;
        full.extend(process::args(["--region", self.region.as_str(), "--output", "json"]));
        let label = full.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        let output = process::run_command_line(&self.command, full, None, envs).await?;
        if !output.success() {
            bail!("aws {} failed: {}", label, output.failure_summary());
        }
        Ok(output)
    }

    async fn call_json(&self, args: Vec<String>) -> Result<Value> {
        let output = self.call(args, &[]).await?;
        serde_json::from_str(output.stdout.trim()).context("aws CLI returned non-JSON output")
    }

    /// KMS policy calls reject aliases, so resolve them to the key id first.
    async fn resolve_key_id(&self, key_id: &str) -> Result<String> {
        if !key_id.starts_with("alias/") {
            return Ok(key_id.to_string());
        }
        let described = self
            .call_json(process::args(["kms", "describe-key", "--key-id", key_id]))
            .await?;
        described
            .pointer("/KeyMetadata/KeyId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("No key behind {}", key_id))
    }
}

/// Policies come back as a JSON document embedded in a string field.
fn embedded_policy(response: &Value) -> Result<Value> {
    let raw = response
        .get("Policy")
        .and_then(Value::as_str)
        .context("Response has no Policy document")?;
    serde_json::from_str(raw).context("Policy document is not valid JSON")
}

fn vpc_arg(vpc_id: &str, vpc_region: &str) -> String {
    format!("VPCRegion={},VPCId={}", vpc_region, vpc_id)
}

#[async_trait]
impl CloudClient for AwsCli {
    async fn associate_zone(&self, zone_id: &str, vpc_id: &str, vpc_region: &str) -> Result<()> {
        let vpc = vpc_arg(vpc_id, vpc_region);
        self.call(
            process::args([
                "route53",
                "associate-vpc-with-hosted-zone",
                "--hosted-zone-id",
                zone_id,
                "--vpc",
                vpc.as_str(),
            ]),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn authorize_zone_association(
        &self,
        zone_id: &str,
        vpc_id: &str,
        vpc_region: &str,
    ) -> Result<()> {
        let vpc = vpc_arg(vpc_id, vpc_region);
        self.call(
            process::args([
                "route53",
                "create-vpc-association-authorization",
                "--hosted-zone-id",
                zone_id,
                "--vpc",
                vpc.as_str(),
            ]),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn assume_role(&self, role_arn: &str, session_name: &str) -> Result<Credentials> {
        let response = self
            .call_json(process::args([
                "sts",
                "assume-role",
                "--role-arn",
                role_arn,
                "--role-session-name",
                session_name,
            ]))
            .await?;
        let field = |name: &str| -> Result<String> {
            response
                .pointer(&format!("/Credentials/{}", name))
                .and_then(Value::as_str)
                .map(str::to_string)
                .with_context(|| format!("assume-role response missing {}", name))
        };
        Ok(Credentials {
            access_key_id: field("AccessKeyId")?,
            secret_access_key: field("SecretAccessKey")?,
            session_token: field("SessionToken")?,
        })
    }

    async fn bucket_policy(&self, bucket: &str) -> Result<Value> {
        let response = self
            .call_json(process::args(["s3api", "get-bucket-policy", "--bucket", bucket]))
            .await?;
        embedded_policy(&response)
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &Value) -> Result<()> {
        let document = serde_json::to_string(policy)?;
        self.call(
            process::args([
                "s3api",
                "put-bucket-policy",
                "--bucket",
                bucket,
                "--policy",
                document.as_str(),
            ]),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn key_policy(&self, key_id: &str) -> Result<Value> {
        let key = self.resolve_key_id(key_id).await?;
        let response = self
            .call_json(process::args([
                "kms",
                "get-key-policy",
                "--key-id",
                key.as_str(),
                "--policy-name",
                "default",
            ]))
            .await?;
        embedded_policy(&response)
    }

    async fn put_key_policy(&self, key_id: &str, policy: &Value) -> Result<()> {
        let key = self.resolve_key_id(key_id).await?;
        let document = serde_json::to_string(policy)?;
        self.call(
            process::args([
                "kms",
                "put-key-policy",
                "--key-id",
                key.as_str(),
                "--policy-name",
                "default",
                "--policy",
                document.as_str(),
            ]),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<String> {
        let uri = format!("s3://{}/{}", bucket, key);
        let output = process::run_command_line(
            &self.command,
            process::args(["s3", "cp", uri.as_str(), "-", "--region", self.region.as_str()]),
            None,
            &[],
        )
        .await?;
        if !output.success() {
            bail!("Failed to fetch {}: {}", uri, output.failure_summary());
        }
        Ok(output.stdout)
    }

    async fn deploy_stack(&self, stack: &StackDeployment, credentials: &Credentials) -> Result<()> {
        std::fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!("Failed to create scratch dir {}", self.scratch_dir.display())
        })?;
        let template = self
            .scratch_dir
            .join(format!("{}.template.yaml", stack.stack_name));
        std::fs::write(&template, &stack.template_body)
            .with_context(|| format!("Failed to write {}", template.display()))?;

        let mut args = vec![
            "cloudformation".to_string(),
            "deploy".to_string(),
            "--stack-name".to_string(),
            stack.stack_name.clone(),
            "--template-file".to_string(),
            template.to_string_lossy().to_string(),
            "--capabilities".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
            "--no-fail-on-empty-changeset".to_string(),
        ];
        if !stack.parameters.is_empty() {
            args.push("--parameter-overrides".to_string());
            args.extend(
                stack
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v)),
            );
        }
        args.extend(process::args(["--region", stack.region.as_str()]));

        let output =
            process::run_command_line(&self.command, args, None, &credentials.to_env()).await?;
        if !output.success() {
            bail!(
                "Stack deploy {} failed: {}",
                stack.stack_name,
                output.failure_summary()
            );
        }
        tracing::info!(stack = %stack.stack_name, region = %stack.region, "stack deployed");
        Ok(())
    }
}
