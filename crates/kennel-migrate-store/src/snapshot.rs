//! Atomic snapshot commit.
//!
//! A snapshot is built completely inside a hidden sibling directory and only
//! then renamed over the committed directory, so readers observe either the
//! previous snapshot or the new one.
//!
//! ```text
//! <snapshot>/
//!   <module>/data.jsonl
//!   <module>/checksums/entities.jsonl
//!   <module>/checksums/merkle.json
//!   checksums/run.json
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kennel_migrate_core::merkle::entity_id;
use kennel_migrate_core::{
    build_manifest, Module, ModuleRoot, Registry, RunMetadata, SCHEMA_VERSION,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::fsutil::{file_name, parent_dir, sync_dir, write_json_pretty, write_ndjson_file};
use crate::registry_files::persist_registry;

pub const DATA_FILE: &str = "data.jsonl";
pub const CHECKSUM_DIR: &str = "checksums";
pub const ENTITIES_FILE: &str = "entities.jsonl";
pub const MERKLE_FILE: &str = "merkle.json";
pub const RUN_FILE: &str = "run.json";

#[must_use]
pub fn module_dir(snapshot_dir: &Path, module: Module) -> PathBuf {
    snapshot_dir.join(module.as_str())
}

#[must_use]
pub fn run_file(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(CHECKSUM_DIR).join(RUN_FILE)
}

fn sibling(snapshot_dir: &Path, suffix: &str) -> Result<PathBuf> {
    Ok(parent_dir(snapshot_dir).join(format!(".{}{suffix}", file_name(snapshot_dir)?)))
}

pub fn lock_path(snapshot_dir: &Path) -> Result<PathBuf> {
    sibling(snapshot_dir, ".lock")
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum LockState {
    Free,
    Held,
    /// Left behind by a process that no longer runs.
    Stale,
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// The lock file holds the owner's process id. An empty or unreadable owner
/// counts as held: the owner may not have written it yet.
fn lock_state(path: &Path) -> Result<LockState> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read snapshot lock {}", path.display()))
        }
    };
    Ok(match text.trim().parse::<u32>() {
        Ok(pid) if !process_alive(pid) => LockState::Stale,
        _ => LockState::Held,
    })
}

/// Advisory lock held for the duration of a migrate. Removed on drop.
#[derive(Debug)]
pub struct SnapshotLock {
    path: PathBuf,
}

impl SnapshotLock {
    /// Take the lock and repair anything an interrupted commit left behind.
    ///
    /// A lock whose owner process is gone is taken over.
    pub fn acquire(snapshot_dir: &Path) -> Result<Self> {
        let path = lock_path(snapshot_dir)?;
        let parent = parent_dir(snapshot_dir);
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;

        let lock = match Self::create(&path) {
            Ok(lock) => lock,
            Err(err) => {
                if lock_state(&path)? != LockState::Stale {
                    return Err(err);
                }
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
                warn!(path = %path.display(), "removed stale snapshot lock");
                Self::create(&path)?
            }
        };
        repair_interrupted_commit(snapshot_dir)?;
        Ok(lock)
    }

    fn create(path: &Path) -> Result<Self> {
        let mut file =
            OpenOptions::new().create_new(true).write(true).open(path).with_context(|| {
                format!(
                    "snapshot lock already held or cannot be created at {}; remove it if no migration is running",
                    path.display()
                )
            })?;
        let lock = Self { path: path.to_path_buf() };
        write!(file, "{}", std::process::id())
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to record lock owner in {}", lock.path.display()))?;
        Ok(lock)
    }

    /// Whether a running process holds the lock.
    pub fn is_held(snapshot_dir: &Path) -> Result<bool> {
        Ok(lock_state(&lock_path(snapshot_dir)?)? == LockState::Held)
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release snapshot lock");
        }
    }
}

/// Repair what an interrupted commit left next to `snapshot_dir`, holding the
/// lock while doing so. Returns whether there was anything to repair.
///
/// Fails when a running process holds the lock.
pub fn reconcile_interrupted_commit(snapshot_dir: &Path) -> Result<bool> {
    let pending = lock_state(&lock_path(snapshot_dir)?)? == LockState::Stale
        || !leftover_dirs(snapshot_dir)?.is_empty();
    if pending {
        drop(SnapshotLock::acquire(snapshot_dir)?);
    }
    Ok(pending)
}

/// Move a previous snapshot stranded in `.{name}.old-*` back when nothing is
/// committed, then delete the remaining temp and aside directories. The
/// caller holds the lock.
fn repair_interrupted_commit(snapshot_dir: &Path) -> Result<()> {
    let leftovers = leftover_dirs(snapshot_dir)?;
    if !snapshot_dir.exists() {
        let old_prefix = format!(".{}.old-", file_name(snapshot_dir)?);
        let stranded = leftovers
            .iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(old_prefix.as_str()))
            })
            .max();
        if let Some(previous) = stranded {
            fs::rename(previous, snapshot_dir).with_context(|| {
                format!("failed to restore previous snapshot from {}", previous.display())
            })?;
            sync_dir(&parent_dir(snapshot_dir))?;
            warn!(
                from = %previous.display(),
                snapshot = %snapshot_dir.display(),
                "restored previous snapshot after an interrupted commit"
            );
        }
    }
    for leftover in &leftovers {
        remove_quietly(leftover);
    }
    Ok(())
}

/// One module's canonical entities as JSON objects.
#[derive(Debug, Clone)]
pub struct ModuleEntities {
    pub module: Module,
    pub entities: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    snapshot_dir: PathBuf,
    #[cfg(test)]
    fail_after_module: Option<usize>,
}

impl SnapshotWriter {
    #[must_use]
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            #[cfg(test)]
            fail_after_module: None,
        }
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Build the complete snapshot and swap it into place.
    ///
    /// On error the temp directory is removed and any previously committed
    /// snapshot is left as it was.
    pub fn commit(
        &self,
        run_id: &str,
        generated_at: &str,
        modules: &[ModuleEntities],
    ) -> Result<RunMetadata> {
        let parent = parent_dir(&self.snapshot_dir);
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;

        let temp_dir = sibling(&self.snapshot_dir, &format!(".tmp-{run_id}"))?;
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir).with_context(|| {
                format!("failed to clear stale temp directory {}", temp_dir.display())
            })?;
        }
        fs::create_dir(&temp_dir)
            .with_context(|| format!("failed to create temp directory {}", temp_dir.display()))?;

        let run = match self.write_tree(&temp_dir, run_id, generated_at, modules) {
            Ok(run) => run,
            Err(err) => {
                remove_quietly(&temp_dir);
                return Err(err);
            }
        };

        if let Err(err) = self.swap_into_place(&temp_dir, run_id) {
            remove_quietly(&temp_dir);
            return Err(err);
        }

        info!(
            snapshot = %self.snapshot_dir.display(),
            run_id,
            modules = run.modules.len(),
            "committed snapshot"
        );
        Ok(run)
    }

    /// Commit the snapshot, then persist `registry` into `registry_dir`.
    ///
    /// The registry files are written only once the new snapshot is in place,
    /// so a failed commit leaves both the snapshot and the registry as they
    /// were.
    pub fn commit_with_registry(
        &self,
        run_id: &str,
        generated_at: &str,
        modules: &[ModuleEntities],
        registry_dir: &Path,
        registry: &Registry,
    ) -> Result<RunMetadata> {
        let run = self.commit(run_id, generated_at, modules)?;
        persist_registry(registry_dir, registry)?;
        Ok(run)
    }

    fn write_tree(
        &self,
        root: &Path,
        run_id: &str,
        generated_at: &str,
        modules: &[ModuleEntities],
    ) -> Result<RunMetadata> {
        let mut roots = Vec::with_capacity(modules.len());
        for (position, batch) in modules.iter().enumerate() {
            roots.push(write_module(root, batch)?);

            #[cfg(test)]
            if self.fail_after_module == Some(position) {
                anyhow::bail!("injected failure after module {}", batch.module);
            }
            #[cfg(not(test))]
            let _ = position;
        }

        let run = RunMetadata {
            run_id: run_id.to_string(),
            generated_at: generated_at.to_string(),
            schema_version: SCHEMA_VERSION,
            modules: roots,
        };
        let checksum_dir = root.join(CHECKSUM_DIR);
        fs::create_dir_all(&checksum_dir)
            .with_context(|| format!("failed to create {}", checksum_dir.display()))?;
        write_json_pretty(&checksum_dir.join(RUN_FILE), &run)?;
        sync_dir(&checksum_dir)?;
        sync_dir(root)?;
        Ok(run)
    }

    fn swap_into_place(&self, temp_dir: &Path, run_id: &str) -> Result<()> {
        let parent = parent_dir(&self.snapshot_dir);
        let old_dir = sibling(&self.snapshot_dir, &format!(".old-{run_id}"))?;
        let had_previous = self.snapshot_dir.exists();

        if had_previous {
            fs::rename(&self.snapshot_dir, &old_dir).with_context(|| {
                format!("failed to move previous snapshot {} aside", self.snapshot_dir.display())
            })?;
        }

        if let Err(err) = fs::rename(temp_dir, &self.snapshot_dir) {
            if had_previous {
                if let Err(restore) = fs::rename(&old_dir, &self.snapshot_dir) {
                    warn!(
                        old = %old_dir.display(),
                        error = %restore,
                        "failed to restore previous snapshot"
                    );
                }
            }
            return Err(err).with_context(|| {
                format!("failed to move new snapshot into {}", self.snapshot_dir.display())
            });
        }
        sync_dir(&parent)?;

        if had_previous {
            remove_quietly(&old_dir);
        }
        Ok(())
    }
}

fn write_module(root: &Path, batch: &ModuleEntities) -> Result<ModuleRoot> {
    let mut entities = batch.entities.clone();
    entities.sort_by(|lhs, rhs| entity_id(lhs).cmp(entity_id(rhs)));

    let dir = module_dir(root, batch.module);
    let checksum_dir = dir.join(CHECKSUM_DIR);
    fs::create_dir_all(&checksum_dir)
        .with_context(|| format!("failed to create {}", checksum_dir.display()))?;

    write_ndjson_file(&dir.join(DATA_FILE), &entities)?;

    let manifest = build_manifest(batch.module, &entities)
        .with_context(|| format!("failed to hash {} entities", batch.module))?;
    let leaves = manifest
        .leaves
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize checksum entries")?;
    write_ndjson_file(&checksum_dir.join(ENTITIES_FILE), &leaves)?;
    write_json_pretty(&checksum_dir.join(MERKLE_FILE), &manifest)?;
    sync_dir(&checksum_dir)?;
    sync_dir(&dir)?;

    Ok(ModuleRoot { name: batch.module, root: manifest.root, records: entities.len() })
}

fn remove_quietly(dir: &Path) {
    if dir.exists() {
        if let Err(err) = fs::remove_dir_all(dir) {
            warn!(path = %dir.display(), error = %err, "failed to remove directory");
        }
    }
}

/// Temp or aside directories left next to `snapshot_dir` by an interrupted
/// commit.
pub fn leftover_dirs(snapshot_dir: &Path) -> Result<Vec<PathBuf>> {
    let parent = parent_dir(snapshot_dir);
    if !parent.exists() {
        return Ok(Vec::new());
    }
    let name = file_name(snapshot_dir)?;
    let prefixes = [format!(".{name}.tmp-"), format!(".{name}.old-")];
    let mut leftovers = Vec::new();
    for entry in fs::read_dir(&parent)
        .with_context(|| format!("failed to read directory {}", parent.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read {}", parent.display()))?;
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if prefixes.iter().any(|prefix| entry_name.starts_with(prefix.as_str())) {
            leftovers.push(entry.path());
        }
    }
    leftovers.sort();
    Ok(leftovers)
}

#[cfg(test)]
mod tests {
    use kennel_migrate_core::{merkle_root, sha256_hex, MerkleManifest};
    use serde_json::json;

    use super::*;
    use crate::fsutil::{read_json_file, read_ndjson_file};
    use crate::registry_files::{load_registry, registry_path};

    fn customers(ids: &[&str]) -> ModuleEntities {
        ModuleEntities {
            module: Module::Customers,
            entities: ids.iter().map(|id| json!({"id": id, "schemaVersion": 1})).collect(),
        }
    }

    fn dogs() -> ModuleEntities {
        ModuleEntities { module: Module::Dogs, entities: Vec::new() }
    }

    #[test]
    fn commit_writes_the_documented_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        let batches = [customers(&["b", "a"]), dogs()];
        let run = SnapshotWriter::new(&snapshot).commit("RUN1", "2024-06-01T00:00:00Z", &batches)?;

        for module in [Module::Customers, Module::Dogs] {
            let module_dir = module_dir(&snapshot, module);
            assert!(module_dir.join(DATA_FILE).exists());
            assert!(module_dir.join(CHECKSUM_DIR).join(ENTITIES_FILE).exists());
            assert!(module_dir.join(CHECKSUM_DIR).join(MERKLE_FILE).exists());
        }
        let stored: RunMetadata = read_json_file(&run_file(&snapshot))?;
        assert_eq!(stored, run);
        assert_eq!(
            stored.root_for(Module::Dogs).map(|root| root.root.clone()),
            Some(sha256_hex(b""))
        );
        assert_eq!(stored.root_for(Module::Customers).map(|root| root.records), Some(2));
        assert!(leftover_dirs(&snapshot)?.is_empty());
        Ok(())
    }

    #[test]
    fn committed_data_reproduces_the_merkle_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        let run = SnapshotWriter::new(&snapshot).commit("RUN1", "t", &[customers(&["c", "a", "b"])])?;

        let module_dir = module_dir(&snapshot, Module::Customers);
        let data: Vec<Value> = read_ndjson_file(&module_dir.join(DATA_FILE))?;
        let ids: Vec<&str> = data.iter().map(entity_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let manifest = build_manifest(Module::Customers, &data)?;
        let stored: MerkleManifest =
            read_json_file(&module_dir.join(CHECKSUM_DIR).join(MERKLE_FILE))?;
        assert_eq!(manifest, stored);
        let leaves: Vec<&str> = stored.leaves.iter().map(|leaf| leaf.hash.as_str()).collect();
        assert_eq!(merkle_root(&leaves), stored.root);
        assert_eq!(run.root_for(Module::Customers).map(|root| &root.root), Some(&stored.root));
        Ok(())
    }

    #[test]
    fn failure_mid_write_leaves_previous_snapshot_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        SnapshotWriter::new(&snapshot).commit("RUN1", "t", &[customers(&["a"]), dogs()])?;
        let before = fs::read(run_file(&snapshot))?;
        let before_data = fs::read(module_dir(&snapshot, Module::Customers).join(DATA_FILE))?;

        for fail_after in 0..2 {
            let mut writer = SnapshotWriter::new(&snapshot);
            writer.fail_after_module = Some(fail_after);
            let result = writer.commit("RUN2", "t", &[customers(&["x", "y"]), dogs()]);
            assert!(result.is_err(), "injected failure after module {fail_after} must surface");

            assert_eq!(fs::read(run_file(&snapshot))?, before);
            assert_eq!(
                fs::read(module_dir(&snapshot, Module::Customers).join(DATA_FILE))?,
                before_data
            );
            assert!(leftover_dirs(&snapshot)?.is_empty());
        }
        Ok(())
    }

    #[test]
    fn failed_first_commit_leaves_no_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        let mut writer = SnapshotWriter::new(&snapshot);
        writer.fail_after_module = Some(0);
        assert!(writer.commit("RUN1", "t", &[customers(&["a"])]).is_err());
        assert!(!snapshot.exists());
        assert!(leftover_dirs(&snapshot)?.is_empty());
        Ok(())
    }

    #[test]
    fn recommit_replaces_previous_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        SnapshotWriter::new(&snapshot).commit("RUN1", "t", &[customers(&["a"])])?;
        let run = SnapshotWriter::new(&snapshot).commit("RUN2", "t", &[customers(&["a", "b"])])?;

        let stored: RunMetadata = read_json_file(&run_file(&snapshot))?;
        assert_eq!(stored.run_id, "RUN2");
        assert_eq!(stored, run);
        assert!(leftover_dirs(&snapshot)?.is_empty());
        Ok(())
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        {
            let _lock = SnapshotLock::acquire(&snapshot)?;
            assert!(SnapshotLock::is_held(&snapshot)?);
            assert!(SnapshotLock::acquire(&snapshot).is_err());
        }
        assert!(!SnapshotLock::is_held(&snapshot)?);
        Ok(())
    }

    #[test]
    fn running_commit_is_not_reconciled() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        let _lock = SnapshotLock::acquire(&snapshot)?;
        let temp_dir = sibling(&snapshot, ".tmp-RUN2")?;
        fs::create_dir(&temp_dir)?;

        assert!(reconcile_interrupted_commit(&snapshot).is_err());
        assert!(temp_dir.exists());
        assert!(lock_path(&snapshot)?.exists());
        Ok(())
    }

    #[test]
    fn leftover_aside_directory_is_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        SnapshotWriter::new(&snapshot).commit("RUN1", "t", &[customers(&["a"])])?;
        let before = fs::read(run_file(&snapshot))?;
        let old_dir = sibling(&snapshot, ".old-RUN0")?;
        fs::create_dir(&old_dir)?;

        assert!(reconcile_interrupted_commit(&snapshot)?);
        assert!(!old_dir.exists());
        assert!(!lock_path(&snapshot)?.exists());
        assert_eq!(fs::read(run_file(&snapshot))?, before);
        assert!(!reconcile_interrupted_commit(&snapshot)?);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn crash_between_renames_is_repaired_on_next_acquire() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        SnapshotWriter::new(&snapshot).commit("RUN1", "t", &[customers(&["a"])])?;
        let before = fs::read(run_file(&snapshot))?;

        // State after the previous snapshot was moved aside and before the
        // new one was moved in, with the owner gone.
        fs::rename(&snapshot, sibling(&snapshot, ".old-RUN2")?)?;
        fs::create_dir(sibling(&snapshot, ".tmp-RUN2")?)?;
        fs::write(lock_path(&snapshot)?, u32::MAX.to_string())?;
        assert!(!SnapshotLock::is_held(&snapshot)?);

        {
            let _lock = SnapshotLock::acquire(&snapshot)?;
            assert_eq!(fs::read(run_file(&snapshot))?, before);
            assert!(leftover_dirs(&snapshot)?.is_empty());
            let owner = fs::read_to_string(lock_path(&snapshot)?)?;
            assert_eq!(owner, std::process::id().to_string());
        }
        assert!(!lock_path(&snapshot)?.exists());
        Ok(())
    }

    #[test]
    fn lock_without_owner_counts_as_held() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        fs::write(lock_path(&snapshot)?, "")?;

        assert!(SnapshotLock::is_held(&snapshot)?);
        assert!(!reconcile_interrupted_commit(&snapshot)?);
        assert!(SnapshotLock::acquire(&snapshot).is_err());
        Ok(())
    }

    #[test]
    fn failed_commit_leaves_registry_files_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("snapshot");
        let registry_dir = dir.path().join("registry");

        let mut registry = Registry::new();
        let _ = registry.resolve(Module::Customers, "1");
        SnapshotWriter::new(&snapshot).commit_with_registry(
            "RUN1",
            "t",
            &[customers(&["a"])],
            &registry_dir,
            &registry,
        )?;
        let registry_file = registry_path(&registry_dir, Module::Customers);
        let registry_before = fs::read(&registry_file)?;
        let run_before = fs::read(run_file(&snapshot))?;

        let mut grown = load_registry(&registry_dir)?;
        let _ = grown.resolve(Module::Customers, "2");
        let _ = grown.resolve(Module::Dogs, "10");
        let mut writer = SnapshotWriter::new(&snapshot);
        writer.fail_after_module = Some(0);
        let result = writer.commit_with_registry(
            "RUN2",
            "t",
            &[customers(&["a", "b"]), dogs()],
            &registry_dir,
            &grown,
        );

        assert!(result.is_err());
        assert_eq!(fs::read(&registry_file)?, registry_before);
        assert!(!registry_path(&registry_dir, Module::Dogs).exists());
        assert_eq!(fs::read(run_file(&snapshot))?, run_before);
        Ok(())
    }
}
