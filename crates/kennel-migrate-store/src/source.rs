//! Legacy export directory reader and export subprocess runner.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use kennel_migrate_core::{LegacyRecord, LegacySource, MigrateError};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::fsutil::{read_json_file, read_ndjson_file};

pub const EXPORT_MANIFEST_FILE: &str = "export-manifest.json";
const TABLE_EXTENSION: &str = "ndjson";

#[derive(Debug, Deserialize)]
struct ExportManifest {
    tables: Vec<String>,
}

/// Reads `<dir>/<table>.ndjson`, one JSON object per line.
#[derive(Debug, Clone)]
pub struct ExportDirSource {
    dir: PathBuf,
}

impl ExportDirSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{TABLE_EXTENSION}"))
    }

    fn listed_tables(&self) -> Result<Vec<String>> {
        let manifest_path = self.dir.join(EXPORT_MANIFEST_FILE);
        if manifest_path.exists() {
            let manifest: ExportManifest = read_json_file(&manifest_path)?;
            return Ok(manifest.tables);
        }

        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read export directory {}", self.dir.display()))?;
        let mut tables = BTreeSet::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read export directory {}", self.dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                tables.insert(stem.to_string());
            }
        }
        Ok(tables.into_iter().collect())
    }

    fn read_table(&self, name: &str) -> Result<Vec<LegacyRecord>> {
        if !self.listed_tables()?.iter().any(|table| table == name) {
            return Ok(Vec::new());
        }
        let path = self.table_path(name);
        if !path.exists() {
            bail!("export table {name} is listed but {} does not exist", path.display());
        }

        let rows: Vec<Value> = read_ndjson_file(&path)?;
        let records = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                legacy_record(row).with_context(|| {
                    format!("row {} of {} is not a JSON object", index + 1, path.display())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(table = name, rows = records.len(), "read export table");
        Ok(records)
    }
}

fn legacy_record(row: Value) -> Result<LegacyRecord> {
    let Value::Object(object) = row else {
        bail!("expected an object");
    };
    Ok(object
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::Null => String::new(),
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

impl LegacySource for ExportDirSource {
    fn list_modules(&self) -> Result<Vec<String>, MigrateError> {
        self.listed_tables().map_err(|err| MigrateError::Source(format!("{err:#}")))
    }

    fn read_module(&self, name: &str) -> Result<Vec<LegacyRecord>, MigrateError> {
        self.read_table(name).map_err(|err| MigrateError::Source(format!("{err:#}")))
    }
}

/// Run the configured export command to completion before anything is read.
///
/// The command receives the export directory as `KM_EXPORT_DIR`.
pub fn run_export_command(command: &[String], export_dir: &Path) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("export command is empty");
    };
    fs::create_dir_all(export_dir)
        .with_context(|| format!("failed to create export directory {}", export_dir.display()))?;

    info!(program = %program, "running legacy export");
    let status = Command::new(program)
        .args(args)
        .env("KM_EXPORT_DIR", export_dir)
        .status()
        .with_context(|| format!("failed to spawn export command {program}"))?;
    if !status.success() {
        bail!("export command {program} failed with {status}");
    }
    Ok(())
}
