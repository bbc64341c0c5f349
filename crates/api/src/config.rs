//! Server configuration.
//!
//! # Security Features
//!
//! - Config file permission validation on Unix systems
//! - Rejects world-readable files containing an API key
//! - Warns about API keys stored in config files

use crate::rate_limit::RateLimitConfig;
use lifeline_dispatch::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Top-level configuration file for `lifeline-api`.
///
/// ```toml
/// [dispatch.alerts]
/// ttl_secs = 300
///
/// [rate_limit]
/// max_signals = 10
///
/// [session_webhook]
/// url = "https://sessions.internal/launch"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Where granted sessions are announced; log-only when absent
    #[serde(default)]
    pub session_webhook: Option<WebhookConfig>,

    /// Bearer key for the signal and admin endpoints. Prefer LIFELINE_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    5
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_webhook_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// On Unix, the file must be a regular file that is not world-writable,
    /// and must not be world-readable if it contains an API key.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let config = Self::from_file_unchecked(path)?;

        if config.api_key.is_some() {
            warn!(
                "API key found in config file '{}'. For better security, \
                 use the LIFELINE_API_KEY environment variable instead.",
                path.display()
            );
        }

        Ok(config)
    }

    /// Load configuration from a TOML file without permission checks.
    pub fn from_file_unchecked(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.dispatch.validate()?;
        self.rate_limit.validate()?;
        if let Some(webhook) = &self.session_webhook {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                anyhow::bail!(
                    "session_webhook.url must be an http(s) URL, got '{}'",
                    webhook.url
                );
            }
        }
        Ok(())
    }
}

/// Validate config file permissions on Unix systems.
#[cfg(unix)]
fn validate_config_file_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

    if !metadata.is_file() {
        anyhow::bail!(
            "Config path '{}' is not a regular file. Symlinks and directories are not allowed.",
            path.display()
        );
    }

    let permission_bits = metadata.permissions().mode() & 0o777;

    if permission_bits & 0o002 != 0 {
        anyhow::bail!(
            "Config file '{}' is world-writable (mode {:04o}). Fix with: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path)?;
    let has_api_key = content
        .lines()
        .any(|line| line.trim_start().starts_with("api_key"));

    if has_api_key && permission_bits & 0o004 != 0 {
        anyhow::bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). \
             Fix with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    if has_api_key && permission_bits & 0o040 != 0 {
        warn!(
            "Config file '{}' contains an API key and is group-readable (mode {:04o}). \
             Consider restricting access with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}
