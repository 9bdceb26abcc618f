#![forbid(unsafe_code)]

// Service configuration, loaded from environment variables at startup.

use anyhow::{bail, Context};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (e.g. "0.0.0.0:8080")
    pub listen_address: String,
    /// Base URL of the homeserver (client-server and Synapse admin APIs)
    pub synapse_url: String,
    /// Admin API access token; when unset, username+password login is used
    pub admin_access_token: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    /// Base URL of the external room router's forget API (optional)
    pub router_url: Option<String>,
    /// Bearer token for the forget API
    pub router_access_token: Option<String>,
    /// Postgres URL of the router database; enables DB-backed room enumeration
    pub router_database_url: Option<String>,
    /// Redis URL; enables the persistent queue backend
    pub redis_url: Option<String>,
    /// Number of concurrent workers for bulk cleanup
    pub worker_count: usize,
    /// Fixed sleep between delete-queue pops
    pub queue_sleep: Duration,
    /// Minimum dwell time in the delete queue before a room may be purged
    pub postpone_deletion: Duration,
    /// Skip all destructive calls, log what would happen instead
    pub dry_run: bool,
    /// Trust X-Forwarded-For when logging client addresses
    pub trust_forward_headers: bool,
    /// Enable debug-level logging by default
    pub debug: bool,
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes"
    )
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64) -> anyhow::Result<Duration> {
    let secs = match env_opt(name) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{name} is not an integer number of seconds"))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            listen_address: env_opt("LISTEN_ADDRESS").unwrap_or_default(),
            synapse_url: env_opt("SYNAPSE_URL").unwrap_or_default(),
            admin_access_token: env_opt("ADMIN_ACCESS_TOKEN"),
            admin_username: env_opt("ADMIN_USERNAME"),
            admin_password: env_opt("ADMIN_PASSWORD"),
            router_url: env_opt("ROUTER_URL"),
            router_access_token: env_opt("ROUTER_ACCESS_TOKEN"),
            router_database_url: env_opt("ROUTER_DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            worker_count: env_opt("WORKER_COUNT")
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("WORKER_COUNT is not an integer")?
                .unwrap_or(5),
            queue_sleep: env_secs("QUEUE_SLEEP", 60)?,
            postpone_deletion: env_secs("POSTPONE_DELETION", 0)?,
            dry_run: env_opt("DRY_RUN").as_deref().is_some_and(is_truthy),
            trust_forward_headers: env_opt("TRUST_FORWARD_HEADERS")
                .as_deref()
                .is_some_and(is_truthy),
            debug: env_opt("DEBUG").as_deref().is_some_and(is_truthy),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.listen_address.is_empty() {
            bail!("LISTEN_ADDRESS environment variable is not set");
        }
        if self.synapse_url.is_empty() {
            bail!("SYNAPSE_URL environment variable is not set");
        }
        if self.worker_count == 0 {
            bail!("WORKER_COUNT must be at least 1");
        }
        if self.admin_access_token.is_none()
            && (self.admin_username.is_none() || self.admin_password.is_none())
        {
            bail!("ADMIN_ACCESS_TOKEN is not set and ADMIN_USERNAME+ADMIN_PASSWORD is not set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_truthy() {
        for v in ["1", "t", "true", "y", "yes", " TRUE ", "Yes"] {
            assert!(is_truthy(v), "{v:?} should be truthy");
        }
        for v in ["", "0", "false", "no", "maybe"] {
            assert!(!is_truthy(v), "{v:?} should be falsy");
        }
    }

    #[test]
    fn test_validate_requires_admin_credentials() {
        let config = Config {
            listen_address: "127.0.0.1:8080".to_string(),
            synapse_url: "http://localhost:8008".to_string(),
            admin_access_token: None,
            admin_username: Some("admin".to_string()),
            admin_password: None,
            router_url: None,
            router_access_token: None,
            router_database_url: None,
            redis_url: None,
            worker_count: 5,
            queue_sleep: Duration::from_secs(60),
            postpone_deletion: Duration::ZERO,
            dry_run: false,
            trust_forward_headers: false,
            debug: false,
        };
        assert!(config.validate().is_err());

        let config = Config {
            admin_password: Some("hunter2".to_string()),
            ..config
        };
        assert!(config.validate().is_ok());
    }
}
