//! Server configuration.
//!
//! Settings come from environment variables first; an optional TOML file
//! fills in anything the environment leaves unset. Required keys missing
//! from both places fail startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use hubsync_core::{CrmError, CrmResult, DEFAULT_TENANT_ID};

/// Default signature timestamp tolerance in seconds.
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base64-encoded 32-byte key used for new encryptions.
    pub encryption_key: String,
    /// Retired encryption keys, oldest first.
    pub rotation_keys: Vec<String>,
    /// Shared secret for webhook signature verification.
    pub webhook_signing_secret: String,
    /// Tenant assigned to webhooks that cannot be routed by account.
    pub default_tenant_id: String,
    /// Signature timestamp tolerance in seconds.
    pub webhook_tolerance_secs: i64,
    /// Log level handed to the tracing subscriber.
    pub log_level: String,
}

/// Optional TOML file contents. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    encryption_key: Option<String>,
    rotation_keys: Option<Vec<String>>,
    webhook_signing_secret: Option<String>,
    default_tenant_id: Option<String>,
    webhook_tolerance_secs: Option<i64>,
    log_level: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the environment, with `path` (when given)
    /// supplying values for unset variables.
    pub fn load(path: Option<&Path>) -> CrmResult<Self> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> CrmResult<Self> {
        // Blank environment values count as unset.
        let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let encryption_key =
            lookup("ENCRYPTION_KEY")
                .or(file.encryption_key)
                .ok_or(CrmError::MissingConfiguration {
                    key: "ENCRYPTION_KEY".to_string(),
                })?;

        let rotation_keys = match lookup("ENCRYPTION_KEY_ROTATION") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(String::from)
                .collect(),
            None => file.rotation_keys.unwrap_or_default(),
        };

        let webhook_signing_secret = lookup("WEBHOOK_SIGNING_SECRET")
            .or(file.webhook_signing_secret)
            .ok_or(CrmError::MissingConfiguration {
                key: "WEBHOOK_SIGNING_SECRET".to_string(),
            })?;

        let webhook_tolerance_secs = match lookup("WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw.parse().map_err(|_| {
                CrmError::config(format!(
                    "WEBHOOK_TOLERANCE_SECS must be an integer, got {raw:?}"
                ))
            })?,
            None => file
                .webhook_tolerance_secs
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
        };

        let config = Self {
            encryption_key,
            rotation_keys,
            webhook_signing_secret,
            default_tenant_id: lookup("DEFAULT_TENANT_ID")
                .or(file.default_tenant_id)
                .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
            webhook_tolerance_secs,
            log_level: lookup("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks constraints that presence alone does not cover. Key material
    /// itself is validated when the ring is built.
    pub fn validate(&self) -> CrmResult<()> {
        if self.webhook_tolerance_secs <= 0 {
            return Err(CrmError::config("WEBHOOK_TOLERANCE_SECS must be positive"));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> CrmResult<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| CrmError::config(format!("cannot read {}: {err}", path.display())))?;
    toml::from_str(&content)
        .map_err(|err| CrmError::config(format!("cannot parse {}: {err}", path.display())))
}
