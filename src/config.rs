use serde::{Deserialize, Serialize};
use std::env;

use crate::error::AuditError;

const DEFAULT_CONFIG_FILE: &str = "audit-ledger.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Page size used when streaming entries for verification, listing and export.
    pub page_size: u32,
    pub append_max_retries: u32,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub retention_days: i64,
    pub copy_batch_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db?mode=rwc".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            page_size: 500,
            append_max_retries: 5,
            archive: ArchiveConfig {
                retention_days: 365,
                copy_batch_size: 1000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration: built-in defaults, then the optional TOML file
    /// (`AUDIT_LEDGER_CONFIG` or `audit-ledger.toml`), then `AUDIT_LEDGER_*` env vars.
    pub fn load() -> Result<Self, AuditError> {
        let path = env::var("AUDIT_LEDGER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let defaults = Self::default();

        let settings = config::Config::builder()
            .set_default("database_url", defaults.database_url)?
            .set_default("server_host", defaults.server_host)?
            .set_default("server_port", defaults.server_port as i64)?
            .set_default("page_size", defaults.page_size as i64)?
            .set_default("append_max_retries", defaults.append_max_retries as i64)?
            .set_default("archive.retention_days", defaults.archive.retention_days)?
            .set_default("archive.copy_batch_size", defaults.archive.copy_batch_size as i64)?
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("AUDIT_LEDGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.page_size == 0 {
            return Err(AuditError::Config("page_size must be at least 1".to_string()));
        }
        if self.append_max_retries == 0 {
            return Err(AuditError::Config(
                "append_max_retries must be at least 1".to_string(),
            ));
        }
        if self.archive.copy_batch_size == 0 {
            return Err(AuditError::Config(
                "archive.copy_batch_size must be at least 1".to_string(),
            ));
        }
        if self.archive.retention_days < 0 {
            return Err(AuditError::Config(
                "archive.retention_days cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        AuditError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let mut config = AppConfig::default();
        config.page_size = 0;
        assert!(matches!(config.validate(), Err(AuditError::Config(_))));
    }
}
