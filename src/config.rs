use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::oauth::OAuthConfig;
use crate::core::worker::RetryPolicy;

/// Runtime configuration, read once from the environment at startup.
///
/// Every tunable has a documented default; nothing beyond `AGENTQ_JWT_SECRET`
/// is required to run locally.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,

    /// Named queue agent-run tasks are published to.
    pub queue_name: String,
    pub worker_count: usize,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// A `running` job untouched for this long is considered abandoned and
    /// reclaimed to `pending`.
    pub staleness_secs: u64,
    /// Queue lease duration; an unacknowledged message is redelivered after
    /// this expires.
    pub lease_visibility_secs: u64,
    /// A `pending` job older than this with no queued message is re-published.
    pub orphan_age_secs: u64,
    /// Terminal records older than this are purged by the retention sweep.
    pub retention_days: u64,

    pub toolkit_base_url: String,
    pub toolkit_model: String,
    pub toolkit_timeout_secs: u64,
    pub openai_api_key: Option<String>,

    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub oauth_token_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: PathBuf::from(env_or("AGENTQ_DB_PATH", "agentq.db")),
            api_host: env_or("AGENTQ_API_HOST", "127.0.0.1"),
            api_port: parse_env("AGENTQ_API_PORT", 8080)?,
            jwt_secret: std::env::var("AGENTQ_JWT_SECRET")
                .context("AGENTQ_JWT_SECRET environment variable is required")?,
            token_ttl_secs: parse_env("AGENTQ_TOKEN_TTL_SECS", 24 * 60 * 60)?,
            queue_name: env_or("AGENTQ_QUEUE", "agent"),
            worker_count: parse_env("AGENTQ_WORKERS", 4)?,
            retry_max_attempts: parse_env("AGENTQ_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: parse_env("AGENTQ_RETRY_BASE_DELAY_MS", 500)?,
            retry_max_delay_ms: parse_env("AGENTQ_RETRY_MAX_DELAY_MS", 30_000)?,
            staleness_secs: parse_env("AGENTQ_STALENESS_SECS", 1800)?,
            lease_visibility_secs: parse_env("AGENTQ_LEASE_VISIBILITY_SECS", 600)?,
            orphan_age_secs: parse_env("AGENTQ_ORPHAN_AGE_SECS", 60)?,
            retention_days: parse_env("AGENTQ_RETENTION_DAYS", 7)?,
            toolkit_base_url: env_or("AGENTQ_TOOLKIT_BASE_URL", "https://api.openai.com/v1"),
            toolkit_model: env_or("AGENTQ_TOOLKIT_MODEL", "gpt-4o"),
            toolkit_timeout_secs: parse_env("AGENTQ_TOOLKIT_TIMEOUT_SECS", 25 * 60)?,
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            google_client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            oauth_token_url: env_or(
                "AGENTQ_OAUTH_TOKEN_URL",
                "https://oauth2.googleapis.com/token",
            ),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn lease_visibility(&self) -> Duration {
        Duration::from_secs(self.lease_visibility_secs)
    }

    pub fn orphan_age(&self) -> Duration {
        Duration::from_secs(self.orphan_age_secs)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn toolkit_timeout(&self) -> Duration {
        Duration::from_secs(self.toolkit_timeout_secs)
    }

    /// Credential refresh is only available when the OAuth client is
    /// configured; workers fall back to the stored token otherwise.
    pub fn oauth_config(&self) -> Option<OAuthConfig> {
        match (&self.google_client_id, &self.google_client_secret) {
            (Some(id), Some(secret)) => Some(OAuthConfig {
                token_url: self.oauth_token_url.clone(),
                client_id: id.clone(),
                client_secret: secret.clone(),
            }),
            _ => None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_uses_default_when_unset() {
        let value: u64 = parse_env("AGENTQ_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn retry_policy_reflects_settings() {
        let config = Config {
            db_path: PathBuf::from("x.db"),
            api_host: "127.0.0.1".into(),
            api_port: 8080,
            jwt_secret: "s".into(),
            token_ttl_secs: 60,
            queue_name: "agent".into(),
            worker_count: 1,
            retry_max_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1000,
            staleness_secs: 10,
            lease_visibility_secs: 10,
            orphan_age_secs: 10,
            retention_days: 1,
            toolkit_base_url: "http://localhost".into(),
            toolkit_model: "m".into(),
            toolkit_timeout_secs: 10,
            openai_api_key: None,
            google_client_id: None,
            google_client_secret: None,
            oauth_token_url: "http://localhost/token".into(),
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert!(config.oauth_config().is_none());
    }
}
