//! Configuration for the mock server.
//!
//! Defines the listener, credentials, logging switches and apps to register
//! at start-up.

use crate::model::NewApp;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Where to listen
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Optional HTTPS listener next to the plain one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Credentials for the administration API (none = open)
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Apps registered at start-up
    #[serde(default)]
    pub apps: Vec<NewApp>,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
            if tls.port == self.listener.port {
                anyhow::bail!("tls port {} is already used by the http listener", tls.port);
            }
        }

        let mut ids = HashSet::new();
        for (i, app) in self.apps.iter().enumerate() {
            if let Some(id) = &app.id {
                crate::model::validate_app_id(id)
                    .map_err(|e| anyhow::anyhow!("App {}: {}", i, e))?;
                if !ids.insert(id.as_str()) {
                    anyhow::bail!("App {}: duplicate id '{}'", i, id);
                }
            }
            for handler in app.handlers.clone().into_ordered() {
                handler
                    .validate()
                    .map_err(|e| anyhow::anyhow!("App {}: {}", i, e))?;
            }
        }
        Ok(())
    }

    /// The configuration as shown to clients, without secrets.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(auth) = config.auth.as_mut() {
            auth.password = "********".to_string();
        }
        config
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl ListenerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9300
}

/// HTTPS listener, served on the same bind address as the HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default = "default_tls_port")]
    pub port: u16,

    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key
    pub key_path: PathBuf,
}

impl TlsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cert_path.as_os_str().is_empty() {
            anyhow::bail!("tls cert_path cannot be empty");
        }
        if self.key_path.as_os_str().is_empty() {
            anyhow::bail!("tls key_path cannot be empty");
        }
        Ok(())
    }

    pub fn address(&self, listener: &ListenerConfig) -> String {
        format!("{}:{}", listener.bind_address, self.port)
    }
}

/// Port of the HTTPS listener when none is configured.
pub const DEFAULT_TLS_PORT: u16 = 9443;

fn default_tls_port() -> u16 {
    DEFAULT_TLS_PORT
}

/// HTTP Basic credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.username.is_empty() {
            anyhow::bail!("auth username cannot be empty");
        }
        if self.username.contains(':') {
            anyhow::bail!("auth username cannot contain ':'");
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log every matched request
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no handler accepted
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// HTTP access log for every request
    #[serde(default)]
    pub log_requests: bool,

    /// Content type for handler bodies without an explicit header
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            log_requests: false,
            default_content_type: default_content_type(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "application/json; charset=utf-8".to_string()
}
