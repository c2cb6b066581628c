//! EchoMail configuration system.
//!
//! TOML file with serde defaults on every field, loaded from
//! `~/.echomail/config.toml` (overridable via `ECHOMAIL_CONFIG`). Secrets can
//! also come from the environment so the config file stays committable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EchomailError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchomailConfig {
    /// Public base URL used to build tracking pixel links,
    /// e.g. "https://mail.example.com".
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_base_url() -> String {
    "http://localhost:3000".into()
}

impl Default for EchomailConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            server: ServerConfig::default(),
            smtp: SmtpConfig::default(),
            store: StoreConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl EchomailConfig {
    /// Load config from ECHOMAIL_CONFIG or the default path, then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("ECHOMAIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EchomailError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EchomailError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path (~/.echomail/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the EchoMail home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".echomail")
    }

    /// Environment variables win over the file for secrets and the pixel URL.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ECHOMAIL_SMTP_PASSWORD") {
            self.smtp.password = v;
        }
        if let Ok(v) = std::env::var("ECHOMAIL_CRON_SECRET") {
            self.server.cron_secret = Some(v);
        }
        if let Ok(v) = std::env::var("ECHOMAIL_BASE_URL") {
            self.base_url = v;
        }
    }

    /// Reject configurations the mailer cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.smtp.from_email.is_empty() {
            return Err(EchomailError::Config("smtp.from_email is not set".into()));
        }
        if self.dispatch.batch_size == 0 {
            return Err(EchomailError::Config("dispatch.batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional shared secret for the /cron/run trigger. When unset the
    /// trigger is open (development mode).
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cron_secret: None,
        }
    }
}

/// Outbound SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Sender address, also the SMTP login.
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub password: String,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "EchoMail".into()
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            from_email: String::new(),
            from_name: default_from_name(),
            password: String::new(),
        }
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path. "~" is expanded against the home directory.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "~/.echomail/echomail.db".into()
}

impl StoreConfig {
    /// Resolved database path with "~" expanded.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        } else {
            PathBuf::from(&self.path)
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Batch dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Recipients per concurrent batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed pause between batches — a flat anti-spam throttle, not a backoff.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Optional bound on one pass; sequences left over stay pending for the
    /// next externally-triggered pass.
    #[serde(default)]
    pub pass_deadline_secs: Option<u64>,
}

fn default_batch_size() -> usize {
    50
}
fn default_batch_delay_ms() -> u64 {
    200
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            pass_deadline_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EchomailConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.batch_delay_ms, 200);
        assert!(config.server.cron_secret.is_none());
        assert_eq!(config.base_url, "http://localhost:3000");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            base_url = "https://mail.example.com"

            [server]
            port = 8080
            cron_secret = "s3cret"

            [smtp]
            from_email = "hello@example.com"
            from_name = "Example"

            [dispatch]
            batch_size = 10
            batch_delay_ms = 50
        "#;

        let config: EchomailConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.base_url, "https://mail.example.com");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.smtp.from_email, "hello@example.com");
        assert_eq!(config.dispatch.batch_size, 10);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: EchomailConfig = toml::from_str("").unwrap();
        assert_eq!(config.smtp.host, "smtp.gmail.com");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.dispatch.batch_size, 50);
    }

    #[test]
    fn test_validate_requires_sender() {
        let config = EchomailConfig::default();
        assert!(config.validate().is_err());

        let mut ok = EchomailConfig::default();
        ok.smtp.from_email = "hello@example.com".into();
        assert!(ok.validate().is_ok());
    }
}
