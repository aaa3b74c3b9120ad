use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kennel_migrate_core::canonical_bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Create (or truncate) `path`, write `bytes` and fsync the file.
pub fn write_file_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(bytes).with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all().with_context(|| format!("failed to sync {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
    Ok(())
}

/// Pretty JSON with a trailing newline, fsynced.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    text.push('\n');
    write_file_durable(path, text.as_bytes())
}

/// Fsync a directory so renames and new entries inside it survive a crash.
pub fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)
            .and_then(|dir| dir.sync_all())
            .with_context(|| format!("failed to sync directory {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("path {} has no valid unicode file name", path.display()))
}

/// Replace `path` by writing a hidden sibling first and renaming it over.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    let temp = parent.join(format!(".{}.tmp", file_name(path)?));

    write_file_durable(&temp, bytes)?;
    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    sync_dir(&parent)
}

/// Write one canonical JSON object per line and fsync.
pub fn write_ndjson_file(path: &Path, values: &[Value]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create NDJSON file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    for value in values {
        let line = canonical_bytes(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(&line)
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write NDJSON file {}", path.display()))?;
    }

    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("failed to flush NDJSON file {}: {}", path.display(), err.error()))?;
    file.sync_all().with_context(|| format!("failed to sync NDJSON file {}", path.display()))?;
    debug!(path = %path.display(), rows = values.len(), "wrote NDJSON file");
    Ok(())
}

pub fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ndjson_rows_are_canonical_and_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rows.jsonl");
        let rows = vec![json!({"b": 1, "a": 2}), json!({"id": "x"})];

        write_ndjson_file(&path, &rows)?;
        assert_eq!(fs::read_to_string(&path)?, "{\"a\":2,\"b\":1}\n{\"id\":\"x\"}\n");

        let read: Vec<Value> = read_ndjson_file(&path)?;
        assert_eq!(read, rows);
        Ok(())
    }

    #[test]
    fn atomic_write_replaces_content_without_leftovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("registry.json");
        write_file_atomic(&path, b"first\n")?;
        write_file_atomic(&path, b"second\n")?;

        assert_eq!(fs::read_to_string(&path)?, "second\n");
        let names: Vec<String> = fs::read_dir(parent_dir(&path))?
            .filter_map(|entry| entry.ok().and_then(|entry| entry.file_name().into_string().ok()))
            .collect();
        assert_eq!(names, vec!["registry.json".to_string()]);
        Ok(())
    }

    #[test]
    fn parent_of_bare_name_is_current_dir() {
        assert_eq!(parent_dir(Path::new("snapshot")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("out/snapshot")), PathBuf::from("out"));
    }
}
