//! Cloud-provider operations used by peering and cascade stages.

pub mod aws;

pub use aws::AwsCli;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Temporary credentials from a role assumption.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Environment variables that hand these credentials to a child process.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.secret_access_key.clone(),
            ),
            ("AWS_SESSION_TOKEN".to_string(), self.session_token.clone()),
        ]
    }
}

/// A stack to create or update from an in-memory template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDeployment {
    pub stack_name: String,
    pub template_body: String,
    pub region: String,
    pub parameters: Vec<(String, String)>,
}

#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Associate a VPC with a private hosted zone.
    async fn associate_zone(&self, zone_id: &str, vpc_id: &str, vpc_region: &str) -> Result<()>;

    /// Authorize a VPC to be associated with a private hosted zone.
    async fn authorize_zone_association(
        &self,
        zone_id: &str,
        vpc_id: &str,
        vpc_region: &str,
    ) -> Result<()>;

    async fn assume_role(&self, role_arn: &str, session_name: &str) -> Result<Credentials>;

    async fn bucket_policy(&self, bucket: &str) -> Result<Value>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &Value) -> Result<()>;

    async fn key_policy(&self, key_id: &str) -> Result<Value>;

    async fn put_key_policy(&self, key_id: &str, policy: &Value) -> Result<()>;

    /// Read an object from storage as UTF-8 text.
    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<String>;

    /// Create or update a stack. Re-deploying an unchanged template succeeds.
    async fn deploy_stack(&self, stack: &StackDeployment, credentials: &Credentials) -> Result<()>;
}
