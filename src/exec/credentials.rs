use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Temporary credentials injected into engine subprocesses.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

/// Ambient provider able to assume an IAM role. The real STS client lives
/// outside the core.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn assume_role(&self, role_arn: &str) -> Result<Credentials>;
}

/// Provider that shells out to the AWS CLI, the ambient credential chain of
/// the host.
pub struct CliCredentialsProvider;

#[async_trait]
impl CredentialsProvider for CliCredentialsProvider {
    async fn assume_role(&self, role_arn: &str) -> Result<Credentials> {
        let output = tokio::process::Command::new("aws")
            .args([
                "sts",
                "assume-role",
                "--role-arn",
                role_arn,
                "--role-session-name",
                "armada",
                "--output",
                "json",
            ])
            .output()
            .await
            .context("Failed to run 'aws sts assume-role'")?;
        if !output.status.success() {
            bail!(
                "Failed to assume role {}: {}",
                role_arn,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let body: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("Unexpected assume-role response")?;
        let credentials = body
            .get("Credentials")
            .context("Assume-role response has no Credentials")?;
        let field = |name: &str| -> Result<String> {
            Ok(credentials
                .get(name)
                .and_then(|v| v.as_str())
                .with_context(|| format!("Assume-role response has no {}", name))?
                .to_string())
        };
        Ok(Credentials {
            access_key_id: field("AccessKeyId")?,
            secret_access_key: field("SecretAccessKey")?,
            session_token: field("SessionToken")?,
        })
    }
}

/// Seconds during which the same temporary credentials are reused by
/// workers assuming the same role.
const CREDENTIAL_CACHE_SECS: i64 = 15 * 60;

/// Cache of assumed-role credentials shared by all workers, so parallel
/// steps targeting the same role do not each assume it.
pub struct CredentialCache {
    provider: Arc<dyn CredentialsProvider>,
    cache: DashMap<String, (DateTime<Utc>, Credentials)>,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
        }
    }

    pub async fn credentials_for(&self, role_arn: &str) -> Result<Credentials> {
        if let Some(entry) = self.cache.get(role_arn) {
            let (created_at, credentials) = entry.value();
            if (Utc::now() - *created_at).num_seconds() < CREDENTIAL_CACHE_SECS {
                return Ok(credentials.clone());
            }
        }
        debug!(role = role_arn, "Assuming role");
        let credentials = self.provider.assume_role(role_arn).await?;
        self.cache
            .insert(role_arn.to_string(), (Utc::now(), credentials.clone()));
        Ok(credentials)
    }
}
