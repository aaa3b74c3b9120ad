use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::{entity_hash, sha256_hex};
use crate::{MigrateError, Module};

pub const MANIFEST_ORDERING: &str = "id";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChecksumEntry {
    pub id: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MerkleManifest {
    pub module: Module,
    pub ordering: String,
    pub leaves: Vec<ChecksumEntry>,
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModuleRoot {
    pub name: Module,
    pub root: String,
    pub records: usize,
}

/// Binds every module root of one committed snapshot to a single run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: String,
    pub generated_at: String,
    pub schema_version: u32,
    pub modules: Vec<ModuleRoot>,
}

impl RunMetadata {
    #[must_use]
    pub fn root_for(&self, module: Module) -> Option<&ModuleRoot> {
        self.modules.iter().find(|entry| entry.name == module)
    }
}

#[must_use]
pub fn entity_id(entity: &Value) -> &str {
    entity.get("id").and_then(Value::as_str).unwrap_or_default()
}

/// Hash every entity and return the entries sorted by id.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when an entity cannot be encoded.
pub fn checksum_entries(entities: &[Value]) -> Result<Vec<ChecksumEntry>, MigrateError> {
    let mut entries = entities
        .iter()
        .map(|entity| {
            Ok(ChecksumEntry { id: entity_id(entity).to_string(), hash: entity_hash(entity)? })
        })
        .collect::<Result<Vec<_>, MigrateError>>()?;
    entries.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id).then_with(|| lhs.hash.cmp(&rhs.hash)));
    Ok(entries)
}

/// Merkle root over hex leaf hashes.
///
/// Adjacent leaves are paired and `SHA-256(left || right)` over their hex
/// text forms the next level. An odd trailing leaf is paired with itself.
/// No leaves hash to `SHA-256("")`.
#[must_use]
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> String {
    let mut level: Vec<String> = leaves.iter().map(|leaf| leaf.as_ref().to_string()).collect();
    if level.is_empty() {
        return sha256_hex(b"");
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left.as_bytes());
                hasher.update(right.as_bytes());
                hex::encode(hasher.finalize())
            })
            .collect();
    }

    level.pop().unwrap_or_else(|| sha256_hex(b""))
}

/// Build the manifest for one module's entities.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when an entity cannot be encoded.
pub fn build_manifest(module: Module, entities: &[Value]) -> Result<MerkleManifest, MigrateError> {
    let leaves = checksum_entries(entities)?;
    let root = merkle_root(&leaves.iter().map(|entry| entry.hash.as_str()).collect::<Vec<_>>());
    Ok(MerkleManifest { module, ordering: MANIFEST_ORDERING.to_string(), leaves, root })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pair(left: &str, right: &str) -> String {
        sha256_hex(format!("{left}{right}").as_bytes())
    }

    #[test]
    fn empty_module_root_is_hash_of_empty_string() {
        let leaves: [&str; 0] = [];
        assert_eq!(merkle_root(&leaves), sha256_hex(b""));
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        assert_eq!(merkle_root(&["abc"]), "abc");
    }

    #[test]
    fn odd_level_duplicates_last_leaf() {
        let root = merkle_root(&["a", "b", "c"]);
        assert_eq!(root, pair(&pair("a", "b"), &pair("c", "c")));
    }

    #[test]
    fn four_leaves_build_balanced_tree() {
        let root = merkle_root(&["a", "b", "c", "d"]);
        assert_eq!(root, pair(&pair("a", "b"), &pair("c", "d")));
    }

    #[test]
    fn manifest_leaves_are_sorted_by_id() -> Result<(), MigrateError> {
        let entities = vec![json!({"id": "b", "v": 1}), json!({"id": "a", "v": 2})];
        let manifest = build_manifest(Module::Customers, &entities)?;
        let ids: Vec<&str> = manifest.leaves.iter().map(|leaf| leaf.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(manifest.ordering, "id");

        let reversed = vec![entities[1].clone(), entities[0].clone()];
        assert_eq!(build_manifest(Module::Customers, &reversed)?.root, manifest.root);
        Ok(())
    }
}
