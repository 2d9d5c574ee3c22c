//! Configuration module
//!
//! Loads Dataverse service-principal credentials from environment variables,
//! with an optional TOML file filling in anything the environment leaves unset.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const ENV_HOST: &str = "DATAVERSE_HOST";
pub const ENV_TENANT_ID: &str = "DATAVERSE_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "DATAVERSE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "DATAVERSE_CLIENT_SECRET";

/// Path override for the optional TOML config file
pub const ENV_CONFIG_FILE: &str = "DATAVERSE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "dataverse.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Failed to read config file '{path}': {reason}")]
    File { path: String, reason: String },
}

/// Service-principal credentials, immutable for the process lifetime
#[derive(Debug, Clone)]
pub struct Credentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Environment base URL without trailing slash,
    /// e.g. "https://org.crm.dynamics.com"
    pub host: String,
}

/// Optional TOML file shape; every field may be omitted
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// Resolved configuration. May be unconfigured: `health` still works,
/// everything else fails fast through `credentials()`.
#[derive(Debug)]
pub struct Config {
    credentials: Option<Credentials>,
    missing: Vec<&'static str>,
}

impl Config {
    /// Load configuration: environment variables first, then the optional
    /// TOML file for whatever the environment left unset.
    pub fn load() -> Result<Self, ConfigError> {
        let file = load_file_config()?;
        Ok(Self::resolve(
            env_or(ENV_HOST, file.host),
            env_or(ENV_TENANT_ID, file.tenant_id),
            env_or(ENV_CLIENT_ID, file.client_id),
            env_or(ENV_CLIENT_SECRET, file.client_secret),
        ))
    }

    /// Build a config from already-resolved values (used by tests)
    pub fn resolve(
        host: Option<String>,
        tenant_id: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        let mut missing = Vec::new();
        if host.is_none() {
            missing.push(ENV_HOST);
        }
        if tenant_id.is_none() {
            missing.push(ENV_TENANT_ID);
        }
        if client_id.is_none() {
            missing.push(ENV_CLIENT_ID);
        }
        if client_secret.is_none() {
            missing.push(ENV_CLIENT_SECRET);
        }

        if !missing.is_empty() {
            tracing::warn!("Dataverse not configured, missing: {}", missing.join(", "));
            return Self {
                credentials: None,
                missing,
            };
        }

        let credentials = Credentials {
            host: host.unwrap().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.unwrap(),
            client_id: client_id.unwrap(),
            client_secret: client_secret.unwrap(),
        };

        Self {
            credentials: Some(credentials),
            missing,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// Credentials, or a `ConfigError::Missing` naming every absent variable
    pub fn credentials(&self) -> Result<&Credentials, ConfigError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ConfigError::Missing(self.missing.join(", ")))
    }
}

fn env_or(key: &str, fallback: Option<String>) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty()).or(fallback)
}

fn load_file_config() -> Result<FileConfig, ConfigError> {
    let explicit = env::var(ENV_CONFIG_FILE).ok();
    let path = explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);

    if !Path::new(path).exists() {
        // The default file is optional; an explicitly named one is not
        if explicit.is_some() {
            return Err(ConfigError::File {
                path: path.to_string(),
                reason: "file not found".to_string(),
            });
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::File {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_all_present() {
        let config = Config::resolve(
            Some("https://org.crm.dynamics.com/".to_string()),
            Some("tenant".to_string()),
            Some("client".to_string()),
            Some("secret".to_string()),
        );
        assert!(config.is_configured());
        let creds = config.credentials().unwrap();
        // trailing slash is stripped
        assert_eq!(creds.host, "https://org.crm.dynamics.com");
    }

    #[test]
    fn resolve_missing_names_variables() {
        let config = Config::resolve(None, Some("tenant".to_string()), None, None);
        assert!(!config.is_configured());
        let err = config.credentials().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(ENV_HOST));
        assert!(msg.contains(ENV_CLIENT_ID));
        assert!(msg.contains(ENV_CLIENT_SECRET));
        assert!(!msg.contains(ENV_TENANT_ID));
    }

    #[test]
    fn file_config_parses_partial() {
        let file: FileConfig = toml::from_str("host = \"https://org.crm.dynamics.com\"").unwrap();
        assert_eq!(file.host.as_deref(), Some("https://org.crm.dynamics.com"));
        assert!(file.tenant_id.is_none());
    }
}
