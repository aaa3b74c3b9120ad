use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kennel_migrate_core::normalize::parse_date_time;
use kennel_migrate_core::MigrateError;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Directories and run parameters for one pipeline invocation.
///
/// Loaded from an optional YAML file; every field has a default so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub registry_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// Program and arguments run to completion before the source is read.
    pub export_command: Option<Vec<String>>,
    /// Fallback `createdAt`/`updatedAt` for legacy rows without timestamps.
    pub migrated_at: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("./export"),
            registry_dir: PathBuf::from("./registry"),
            snapshot_dir: PathBuf::from("./snapshot"),
            reports_dir: PathBuf::from("./reports"),
            export_command: None,
            migrated_at: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or names unknown keys.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("failed to parse pipeline config YAML")
    }

    /// Load the YAML file at `path`, or defaults when no path is given.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// The `migratedAt` timestamp for this run as `YYYY-MM-DDTHH:MM:SS`.
    ///
    /// # Errors
    /// Returns [`MigrateError::Config`] when the configured value is not a
    /// recognised date, or when the current time cannot be formatted.
    pub fn migrated_at(&self) -> Result<String, MigrateError> {
        match &self.migrated_at {
            Some(raw) => parse_date_time(raw).timestamp().ok_or_else(|| {
                MigrateError::Config(format!("migrated_at {raw:?} is not a recognised date"))
            }),
            None => {
                let now = now_rfc3339()?;
                Ok(now.chars().take(19).collect())
            }
        }
    }
}

/// Current UTC time in RFC 3339.
///
/// # Errors
/// Returns [`MigrateError::Config`] when formatting fails.
pub fn now_rfc3339() -> Result<String, MigrateError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| MigrateError::Config(format!("failed to format RFC3339 timestamp: {err}")))
}
