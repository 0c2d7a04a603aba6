//! Process configuration read from the environment

use policy_sync_executor::{ReconcilerConfig, DEFAULT_MAX_WORKERS};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of the policy-sync process
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub host: String,
    pub port: u16,
    pub data_source_id: String,
    /// Prefix used when a sync request does not carry its own
    pub fullname_prefix: String,
    pub max_workers: usize,
    pub default_owner_to_caller: bool,
    /// One-shot mode: sync this manifest and exit instead of serving
    pub manifest_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: e.to_string(),
                value,
            })?,
            None => 8080,
        };

        let max_workers = match lookup("SYNC_MAX_WORKERS") {
            Some(value) => match value.parse::<usize>() {
                Ok(workers) if workers >= 1 => workers,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        name: "SYNC_MAX_WORKERS",
                        value,
                        reason: "must be at least 1".to_string(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        name: "SYNC_MAX_WORKERS",
                        reason: e.to_string(),
                        value,
                    })
                }
            },
            None => DEFAULT_MAX_WORKERS,
        };

        let default_owner_to_caller = match lookup("SYNC_DEFAULT_OWNER") {
            Some(value) => parse_flag("SYNC_DEFAULT_OWNER", value)?,
            None => true,
        };

        let data_source_id = lookup("DATA_SOURCE_ID")
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::Missing { name: "DATA_SOURCE_ID" })?;

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            data_source_id,
            fullname_prefix: lookup("FULLNAME_PREFIX").unwrap_or_default(),
            max_workers,
            default_owner_to_caller,
            manifest_path: lookup("MANIFEST_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            data_source_id: self.data_source_id.clone(),
            max_workers: self.max_workers,
            default_owner_to_caller: self.default_owner_to_caller,
        }
    }
}

fn parse_flag(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}
