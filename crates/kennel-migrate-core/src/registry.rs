//! Idempotent legacy-ID to target-ID resolution.
//!
//! The registry is the only place new target identifiers are minted. Fresh
//! identifiers are derived from `"{module}:{legacyId}"`, so two runs that have
//! not yet persisted anything still agree on every id. Loaded entries always
//! win over recomputation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{MigrateError, Module};

pub const REGISTRY_ENTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub legacy_id: String,
    pub target_id: Uuid,
    pub version: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub entry: RegistryEntry,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    modules: BTreeMap<Module, BTreeMap<String, RegistryEntry>>,
    persisted: BTreeMap<Module, usize>,
}

/// Deterministic UUID for a legacy key: SHA-256 truncated to 16 bytes with
/// version 5 and RFC 4122 variant bits forced.
#[must_use]
pub fn derive_target_id(module: Module, legacy_id: &str) -> Uuid {
    let digest = Sha256::digest(format!("{}:{legacy_id}", module.as_str()).as_bytes());
    let mut bytes = [0_u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install previously persisted entries for `module`.
    ///
    /// # Errors
    /// Returns [`MigrateError::Registry`] when the entries repeat a legacy id or
    /// a target id, or carry an empty legacy id.
    pub fn load_module(
        &mut self,
        module: Module,
        entries: Vec<RegistryEntry>,
    ) -> Result<(), MigrateError> {
        let mut by_legacy = BTreeMap::new();
        let mut targets = BTreeSet::new();
        for entry in entries {
            if entry.legacy_id.trim().is_empty() {
                return Err(MigrateError::Registry(format!(
                    "{module} registry contains an entry without legacyId"
                )));
            }
            if !targets.insert(entry.target_id) {
                return Err(MigrateError::Registry(format!(
                    "{module} registry assigns target {} twice",
                    entry.target_id
                )));
            }
            let legacy_id = entry.legacy_id.clone();
            if by_legacy.insert(legacy_id.clone(), entry).is_some() {
                return Err(MigrateError::Registry(format!(
                    "{module} registry contains duplicate legacyId {legacy_id}"
                )));
            }
        }
        self.persisted.insert(module, by_legacy.len());
        self.modules.insert(module, by_legacy);
        Ok(())
    }

    /// Resolve `legacy_id`, minting a deterministic entry when none exists.
    ///
    /// Returns `None` for an empty legacy id.
    pub fn resolve(&mut self, module: Module, legacy_id: &str) -> Option<Resolution> {
        let legacy_id = legacy_id.trim();
        if legacy_id.is_empty() {
            return None;
        }

        let entries = self.modules.entry(module).or_default();
        if let Some(existing) = entries.get(legacy_id) {
            return Some(Resolution { entry: existing.clone(), created: false });
        }

        let entry = RegistryEntry {
            legacy_id: legacy_id.to_string(),
            target_id: derive_target_id(module, legacy_id),
            version: REGISTRY_ENTRY_VERSION,
        };
        entries.insert(legacy_id.to_string(), entry.clone());
        Some(Resolution { entry, created: true })
    }

    #[must_use]
    pub fn lookup(&self, module: Module, legacy_id: &str) -> Option<&RegistryEntry> {
        self.modules.get(&module).and_then(|entries| entries.get(legacy_id.trim()))
    }

    /// Entries for `module`, sorted by legacy id.
    #[must_use]
    pub fn entries(&self, module: Module) -> Vec<RegistryEntry> {
        self.modules
            .get(&module)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, module: Module) -> usize {
        self.modules.get(&module).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self, module: Module) -> bool {
        self.len(module) == 0
    }

    /// Number of entries that came from durable storage.
    #[must_use]
    pub fn persisted_len(&self, module: Module) -> usize {
        self.persisted.get(&module).copied().unwrap_or(0)
    }
}
