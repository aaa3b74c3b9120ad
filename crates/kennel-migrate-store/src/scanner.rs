//! Independent re-verification of a committed snapshot.
//!
//! The scanner trusts nothing written by the migrate run: hashes and Merkle
//! roots are recomputed from `data.jsonl` and compared with the stored
//! checksum artifacts. Artifacts that do not parse are reported, not fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use kennel_migrate_core::merkle::MANIFEST_ORDERING;
use kennel_migrate_core::validator::{
    audit_pii, check_drift, check_registry_completeness, collect_pii_values, validate_module,
};
use kennel_migrate_core::{
    checksum_entries, merkle_root, ChecksumEntry, CheckType, EntityIndex, Issue, MerkleManifest,
    Module, ModuleReport, RunMetadata,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::registry_files::load_registry;
use crate::snapshot::{
    module_dir, reconcile_interrupted_commit, run_file, SnapshotLock, CHECKSUM_DIR, DATA_FILE,
    ENTITIES_FILE, MERKLE_FILE, RUN_FILE,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScanScope {
    All,
    Modules(Vec<Module>),
    Pii,
    Drift,
    Checksums,
}

impl ScanScope {
    fn modules(&self) -> Vec<Module> {
        match self {
            Self::Modules(selected) => {
                Module::ALL.into_iter().filter(|module| selected.contains(module)).collect()
            }
            Self::All | Self::Pii | Self::Drift | Self::Checksums => Module::ALL.to_vec(),
        }
    }

    fn checks_integrity(&self) -> bool {
        matches!(self, Self::All | Self::Modules(_) | Self::Checksums)
    }

    fn checks_rules(&self) -> bool {
        matches!(self, Self::All | Self::Modules(_))
    }

    fn checks_drift(&self) -> bool {
        matches!(self, Self::All | Self::Modules(_) | Self::Drift)
    }

    fn checks_pii(&self) -> bool {
        matches!(self, Self::All | Self::Modules(_) | Self::Pii)
    }
}

fn artifact_missing(module: Module, artifact: &str) -> Issue {
    Issue::blocker(
        module,
        "",
        CheckType::Checksum,
        "CHECKSUM_ARTIFACT_MISSING",
        format!("{artifact} is missing from the snapshot"),
    )
}

fn artifact_corrupt(module: Module, artifact: &str, location: &str) -> Issue {
    Issue::blocker(
        module,
        "",
        CheckType::Checksum,
        "CHECKSUM_ARTIFACT_CORRUPT",
        format!("{artifact} does not parse at {location}"),
    )
}

/// Rows of an NDJSON artifact that parsed to objects, with their 1-based
/// line numbers, and the lines that did not.
#[derive(Debug, Default)]
struct NdjsonArtifact {
    rows: Vec<Value>,
    lines: Vec<usize>,
    corrupt_lines: Vec<usize>,
}

fn read_ndjson_artifact(path: &Path) -> Result<Option<NdjsonArtifact>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut artifact = NdjsonArtifact::default();
    for (index, line) in String::from_utf8_lossy(&bytes).lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(row @ Value::Object(_)) => {
                artifact.rows.push(row);
                artifact.lines.push(index + 1);
            }
            _ => artifact.corrupt_lines.push(index + 1),
        }
    }
    Ok(Some(artifact))
}

#[derive(Debug)]
enum JsonArtifact {
    Missing,
    Corrupt,
    Parsed(Value),
}

impl JsonArtifact {
    fn document(&self) -> Option<&Value> {
        match self {
            Self::Parsed(document) => Some(document),
            Self::Missing | Self::Corrupt => None,
        }
    }
}

fn read_json_artifact(path: &Path) -> Result<JsonArtifact> {
    if !path.exists() {
        return Ok(JsonArtifact::Missing);
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes).map_or(JsonArtifact::Corrupt, JsonArtifact::Parsed))
}

/// Artifacts of one module as found on disk.
///
/// Checksum artifacts are kept as raw JSON so the PII audit sees every key
/// that was written, not only the ones the typed form knows about.
struct ModuleArtifacts {
    data: Option<NdjsonArtifact>,
    entities: Option<NdjsonArtifact>,
    merkle: JsonArtifact,
}

fn load_artifacts(snapshot_dir: &Path, module: Module) -> Result<ModuleArtifacts> {
    let dir = module_dir(snapshot_dir, module);
    Ok(ModuleArtifacts {
        data: read_ndjson_artifact(&dir.join(DATA_FILE))?,
        entities: read_ndjson_artifact(&dir.join(CHECKSUM_DIR).join(ENTITIES_FILE))?,
        merkle: read_json_artifact(&dir.join(CHECKSUM_DIR).join(MERKLE_FILE))?,
    })
}

fn corrupt_lines(module: Module, artifact: &str, lines: &[usize]) -> Vec<Issue> {
    lines.iter().map(|line| artifact_corrupt(module, artifact, &format!("line {line}"))).collect()
}

fn verify_entities(
    module: Module,
    artifact: &NdjsonArtifact,
    recomputed: &[ChecksumEntry],
) -> Vec<Issue> {
    let mut corrupt = artifact.corrupt_lines.clone();
    let mut stored = Vec::with_capacity(artifact.rows.len());
    for (row, line) in artifact.rows.iter().zip(&artifact.lines) {
        match serde_json::from_value::<ChecksumEntry>(row.clone()) {
            Ok(entry) => stored.push(entry),
            Err(_) => corrupt.push(*line),
        }
    }
    if !corrupt.is_empty() {
        corrupt.sort_unstable();
        return corrupt_lines(module, ENTITIES_FILE, &corrupt);
    }

    let mut issues = Vec::new();
    if stored.len() != recomputed.len() {
        issues.push(Issue::blocker(
            module,
            "",
            CheckType::Checksum,
            "CHECKSUM_COUNT_MISMATCH",
            format!(
                "{ENTITIES_FILE} lists {} entries but {DATA_FILE} has {}",
                stored.len(),
                recomputed.len()
            ),
        ));
    }
    if stored.windows(2).any(|pair| pair[0].id > pair[1].id) {
        issues.push(Issue::blocker(
            module,
            "",
            CheckType::Checksum,
            "CHECKSUM_ORDER_INVALID",
            format!("{ENTITIES_FILE} is not ordered by id"),
        ));
    }

    let stored_by_id: BTreeMap<&str, &str> =
        stored.iter().map(|entry| (entry.id.as_str(), entry.hash.as_str())).collect();
    for entry in recomputed {
        if stored_by_id.get(entry.id.as_str()) != Some(&entry.hash.as_str()) {
            issues.push(Issue::blocker(
                module,
                &entry.id,
                CheckType::Checksum,
                "CHECKSUM_MISMATCH",
                "entity hash differs from the stored checksum",
            ));
        }
    }
    issues
}

/// Compare every manifest field with what `data.jsonl` yields today.
fn verify_manifest(
    module: Module,
    manifest: &MerkleManifest,
    recomputed: &[ChecksumEntry],
    recomputed_root: &str,
) -> Vec<Issue> {
    let mut issues = Vec::new();
    if manifest.module != module || manifest.ordering != MANIFEST_ORDERING {
        issues.push(Issue::blocker(
            module,
            "",
            CheckType::Checksum,
            "MERKLE_MANIFEST_INVALID",
            format!("{MERKLE_FILE} must describe {module} leaves ordered by {MANIFEST_ORDERING}"),
        ));
    }
    if manifest.leaves.len() != recomputed.len() {
        issues.push(Issue::blocker(
            module,
            "",
            CheckType::Checksum,
            "CHECKSUM_COUNT_MISMATCH",
            format!(
                "{MERKLE_FILE} lists {} leaves but {DATA_FILE} has {}",
                manifest.leaves.len(),
                recomputed.len()
            ),
        ));
    }
    for (position, (leaf, expected)) in manifest.leaves.iter().zip(recomputed).enumerate() {
        if leaf != expected {
            issues.push(Issue::blocker(
                module,
                &expected.id,
                CheckType::Checksum,
                "CHECKSUM_MISMATCH",
                format!("{MERKLE_FILE} leaf {position} differs from the recomputed checksum"),
            ));
        }
    }
    if manifest.root != recomputed_root {
        issues.push(Issue::blocker(
            module,
            "",
            CheckType::Checksum,
            "MERKLE_ROOT_MISMATCH",
            format!("{MERKLE_FILE} root differs from the root recomputed from {DATA_FILE}"),
        ));
    }
    issues
}

fn verify_checksums(
    module: Module,
    data: &[Value],
    artifacts: &ModuleArtifacts,
    run: Option<&RunMetadata>,
) -> Result<Vec<Issue>> {
    let mut issues = Vec::new();
    let recomputed = checksum_entries(data)
        .with_context(|| format!("failed to hash {module} entities"))?;
    let recomputed_root =
        merkle_root(&recomputed.iter().map(|entry| entry.hash.as_str()).collect::<Vec<_>>());

    match &artifacts.entities {
        None => issues.push(artifact_missing(module, ENTITIES_FILE)),
        Some(artifact) => issues.extend(verify_entities(module, artifact, &recomputed)),
    }

    match &artifacts.merkle {
        JsonArtifact::Missing => issues.push(artifact_missing(module, MERKLE_FILE)),
        JsonArtifact::Corrupt => issues.push(artifact_corrupt(module, MERKLE_FILE, "document")),
        JsonArtifact::Parsed(document) => {
            match serde_json::from_value::<MerkleManifest>(document.clone()) {
                Ok(manifest) => issues.extend(verify_manifest(
                    module,
                    &manifest,
                    &recomputed,
                    &recomputed_root,
                )),
                Err(_) => issues.push(artifact_corrupt(module, MERKLE_FILE, "document")),
            }
        }
    }

    if let Some(run) = run {
        match run.root_for(module) {
            Some(entry) if entry.root == recomputed_root && entry.records == data.len() => {}
            _ => issues.push(Issue::blocker(
                module,
                "",
                CheckType::Checksum,
                "RUN_ROOT_MISMATCH",
                format!("{RUN_FILE} does not bind the recomputed {module} root"),
            )),
        }
    }
    Ok(issues)
}

fn audit_artifacts(
    module: Module,
    artifacts: &ModuleArtifacts,
    pii_values: &BTreeSet<String>,
) -> Vec<Issue> {
    let mut issues = Vec::new();
    if let Some(entities) = &artifacts.entities {
        let document = Value::Array(entities.rows.clone());
        issues.extend(audit_pii(module, ENTITIES_FILE, &document, pii_values));
    }
    if let Some(manifest) = artifacts.merkle.document() {
        issues.extend(audit_pii(module, MERKLE_FILE, manifest, pii_values));
    }
    issues
}

/// Re-verify the committed snapshot under `snapshot_dir`.
///
/// Leftovers of an interrupted commit are repaired first. Fails when a
/// migrate currently holds the snapshot lock or when no snapshot has been
/// committed yet.
pub fn scan(
    snapshot_dir: &Path,
    registry_dir: &Path,
    scope: &ScanScope,
) -> Result<BTreeMap<Module, ModuleReport>> {
    if SnapshotLock::is_held(snapshot_dir)? {
        bail!("snapshot {} is locked by a running migration", snapshot_dir.display());
    }
    if reconcile_interrupted_commit(snapshot_dir)? {
        warn!(snapshot = %snapshot_dir.display(), "repaired an interrupted commit before scanning");
    }
    if !snapshot_dir.is_dir() {
        bail!("no committed snapshot at {}", snapshot_dir.display());
    }

    let run_doc = read_json_artifact(&run_file(snapshot_dir))?;
    let run: Option<RunMetadata> =
        run_doc.document().and_then(|document| serde_json::from_value(document.clone()).ok());

    // Foreign keys may point into modules outside the scanned selection.
    let mut artifacts = BTreeMap::new();
    let mut index = EntityIndex::default();
    let mut pii_values = BTreeSet::new();
    for module in Module::ALL {
        let loaded = load_artifacts(snapshot_dir, module)?;
        if let Some(data) = &loaded.data {
            index.insert_module(module, &data.rows);
            pii_values.extend(collect_pii_values(module, &data.rows));
        }
        artifacts.insert(module, loaded);
    }
    let registry = if scope.checks_rules() { Some(load_registry(registry_dir)?) } else { None };

    let modules = scope.modules();
    let mut reports = BTreeMap::new();
    for module in modules.iter().copied() {
        let Some(loaded) = artifacts.get(&module) else {
            continue;
        };
        let mut report = ModuleReport::default();
        let Some(data) = &loaded.data else {
            report.issues.push(artifact_missing(module, DATA_FILE));
            reports.insert(module, report);
            continue;
        };
        let rows = data.rows.as_slice();
        report.records = rows.len();
        report.issues.extend(corrupt_lines(module, DATA_FILE, &data.corrupt_lines));

        if scope.checks_integrity() {
            report.issues.extend(verify_checksums(module, rows, loaded, run.as_ref())?);
        }
        if scope.checks_rules() {
            report.issues.extend(validate_module(module, rows, &index));
            if let Some(registry) = &registry {
                report.issues.extend(check_registry_completeness(
                    module,
                    rows.len(),
                    registry.persisted_len(module),
                ));
            }
        }
        if scope.checks_drift() {
            report.issues.extend(rows.iter().filter_map(|entity| check_drift(module, entity)));
        }
        if scope.checks_pii() {
            report.issues.extend(audit_artifacts(module, loaded, &pii_values));
        }
        reports.insert(module, report);
    }

    // run.json belongs to the whole snapshot; its findings go to the first
    // scanned module.
    if let Some(&first) = modules.first() {
        let mut snapshot_issues = Vec::new();
        if scope.checks_integrity() {
            match (&run_doc, &run) {
                (JsonArtifact::Missing, _) => {
                    snapshot_issues.push(artifact_missing(first, RUN_FILE));
                }
                (_, None) => snapshot_issues.push(artifact_corrupt(first, RUN_FILE, "document")),
                (_, Some(_)) => {}
            }
        }
        if scope.checks_pii() {
            if let Some(document) = run_doc.document() {
                snapshot_issues.extend(audit_pii(first, RUN_FILE, document, &pii_values));
            }
        }
        if !snapshot_issues.is_empty() {
            let report = reports.entry(first).or_default();
            snapshot_issues.append(&mut report.issues);
            report.issues = snapshot_issues;
        }
    }

    let blockers = reports
        .values()
        .flat_map(|report| &report.issues)
        .filter(|issue| issue.is_blocker())
        .count();
    if blockers > 0 {
        warn!(blockers, "scan found blocking issues");
    }
    info!(modules = reports.len(), "scan finished");
    Ok(reports)
}
