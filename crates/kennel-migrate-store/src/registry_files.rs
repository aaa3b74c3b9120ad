//! Registry persistence: one JSON array per module under the registry dir.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kennel_migrate_core::{Module, Registry, RegistryEntry};
use tracing::{debug, info};

use crate::fsutil::{read_json_file, write_file_atomic};

#[must_use]
pub fn registry_path(registry_dir: &Path, module: Module) -> PathBuf {
    registry_dir.join(format!("{}.json", module.as_str()))
}

/// Load every module's persisted entries. Absent files mean an empty module.
pub fn load_registry(registry_dir: &Path) -> Result<Registry> {
    let mut registry = Registry::new();
    for module in Module::ALL {
        let path = registry_path(registry_dir, module);
        if !path.exists() {
            continue;
        }
        let entries: Vec<RegistryEntry> = read_json_file(&path)?;
        let count = entries.len();
        registry
            .load_module(module, entries)
            .with_context(|| format!("invalid registry file {}", path.display()))?;
        debug!(module = %module, entries = count, "loaded registry");
    }
    Ok(registry)
}

/// Write all modules that have entries, each file replaced atomically.
pub fn persist_registry(registry_dir: &Path, registry: &Registry) -> Result<()> {
    for module in Module::ALL {
        if registry.is_empty(module) {
            continue;
        }
        let entries = registry.entries(module);
        let mut text = serde_json::to_string_pretty(&entries)
            .with_context(|| format!("failed to serialize {module} registry"))?;
        text.push('\n');
        write_file_atomic(&registry_path(registry_dir, module), text.as_bytes())?;
        info!(module = %module, entries = entries.len(), "persisted registry");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn persisted_registry_reloads_with_identical_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = Registry::new();
        let minted = registry.resolve(Module::Dogs, "10").map(|res| res.entry.target_id);
        let _ = registry.resolve(Module::Dogs, "2");

        persist_registry(dir.path(), &registry)?;
        let reloaded = load_registry(dir.path())?;

        assert_eq!(reloaded.persisted_len(Module::Dogs), 2);
        assert_eq!(reloaded.lookup(Module::Dogs, "10").map(|entry| entry.target_id), minted);
        assert!(!registry_path(dir.path(), Module::Customers).exists());
        Ok(())
    }

    #[test]
    fn registry_file_is_sorted_pretty_json_with_newline() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = Registry::new();
        for legacy_id in ["b", "a"] {
            let _ = registry.resolve(Module::Trainers, legacy_id);
        }
        persist_registry(dir.path(), &registry)?;

        let text = fs::read_to_string(registry_path(dir.path(), Module::Trainers))?;
        assert!(text.ends_with("]\n"));
        assert!(text.find("\"legacyId\": \"a\"") < text.find("\"legacyId\": \"b\""));
        Ok(())
    }

    #[test]
    fn corrupt_registry_is_a_fatal_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let entry = r#"{"legacyId": "1", "targetId": "00000000-0000-5000-8000-000000000001", "version": 1}"#;
        fs::write(registry_path(dir.path(), Module::Customers), format!("[{entry}, {entry}]"))?;

        let err = match load_registry(dir.path()) {
            Ok(_) => panic!("duplicate registry entries must not load"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("assigns target"));
        Ok(())
    }
}
