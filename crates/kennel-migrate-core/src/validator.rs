//! Rule engine shared by the pre-commit validator and the post-commit scanner.
//!
//! Everything here works on entity JSON objects, so a committed `data.jsonl`
//! line is checked exactly like a freshly mapped entity.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::merkle::entity_id;
use crate::rules::{all_pii_fields, field_code, rules_for, ForeignKey, Invariant};
use crate::{CheckType, Issue, Module, SCHEMA_VERSION};

/// Minimum length for a PII value to be matched as a substring. Shorter
/// values only match whole strings.
const PII_SUBSTRING_MIN_LEN: usize = 6;

/// Entity ids known per module, used to resolve foreign keys.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    ids: BTreeMap<Module, BTreeSet<String>>,
}

impl EntityIndex {
    pub fn insert_module(&mut self, module: Module, entities: &[Value]) {
        let ids = self.ids.entry(module).or_default();
        for entity in entities {
            let id = entity_id(entity);
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
    }

    #[must_use]
    pub fn contains(&self, module: Module, id: &str) -> bool {
        self.ids.get(&module).is_some_and(|ids| ids.contains(id))
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

fn text<'v>(entity: &'v Value, field: &str) -> &'v str {
    entity.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn check_schema(module: Module, entity: &Value, id: &str, issues: &mut Vec<Issue>) {
    for field in rules_for(module).required {
        if is_blank(entity.get(*field)) {
            issues.push(Issue::blocker(
                module,
                id,
                CheckType::Schema,
                format!("SCHEMA_REQUIRED_{}", field_code(field)),
                format!("required field {field} is empty"),
            ));
        }
    }

    if entity.get("schemaVersion").and_then(Value::as_u64) != Some(u64::from(SCHEMA_VERSION)) {
        issues.push(Issue::blocker(
            module,
            id,
            CheckType::Schema,
            "SCHEMA_VERSION_INVALID",
            format!("schemaVersion must be {SCHEMA_VERSION}"),
        ));
    }
    if entity.get("version").and_then(Value::as_u64).is_none() {
        issues.push(Issue::blocker(
            module,
            id,
            CheckType::Schema,
            "SCHEMA_VERSION_FIELD_MISSING",
            "version must be a non-negative integer",
        ));
    }
}

fn check_foreign_key(
    module: Module,
    entity: &Value,
    id: &str,
    fk: &ForeignKey,
    index: &EntityIndex,
    issues: &mut Vec<Issue>,
) {
    let value = entity.get(fk.field);
    if is_blank(value) {
        if fk.required {
            issues.push(Issue::blocker(
                module,
                id,
                CheckType::ForeignKey,
                format!("FK_REQUIRED_{}", field_code(fk.field)),
                format!("{} must reference a {} entity", fk.field, fk.target),
            ));
        }
        return;
    }

    let targets: Vec<&str> = if fk.relation_set {
        value.and_then(Value::as_array).map_or_else(Vec::new, |items| {
            items.iter().map(|item| item.as_str().unwrap_or_default()).collect()
        })
    } else {
        vec![value.and_then(Value::as_str).unwrap_or_default()]
    };

    for target in targets {
        if !index.contains(fk.target, target) {
            issues.push(Issue::blocker(
                module,
                id,
                CheckType::ForeignKey,
                format!("FK_UNRESOLVED_{}", field_code(fk.field)),
                format!("{} references {target} which is not a {} id", fk.field, fk.target),
            ));
        }
    }
}

fn invariant_holds(entity: &Value, invariant: Invariant) -> bool {
    match invariant {
        Invariant::TimeRange { start, end } => {
            let (start, end) = (text(entity, start), text(entity, end));
            start.is_empty() || end.is_empty() || start < end
        }
        Invariant::Capacity { capacity, booked } => {
            match (
                entity.get(capacity).and_then(Value::as_u64),
                entity.get(booked).and_then(Value::as_u64),
            ) {
                (Some(capacity), Some(booked)) => booked <= capacity,
                _ => true,
            }
        }
        Invariant::NonNegativeAmount { field } | Invariant::NonNegativePrice { field } => {
            !matches!(entity.get(field).and_then(Value::as_i64), Some(amount) if amount < 0)
        }
        Invariant::AtLeastOneRef { first, second } => {
            !is_blank(entity.get(first)) || !is_blank(entity.get(second))
        }
    }
}

/// Schema, foreign key and invariant checks for a single entity.
#[must_use]
pub fn validate_entity(module: Module, entity: &Value, index: &EntityIndex) -> Vec<Issue> {
    let rules = rules_for(module);
    let id = entity_id(entity);
    let mut issues = Vec::new();

    check_schema(module, entity, id, &mut issues);
    for fk in rules.foreign_keys {
        check_foreign_key(module, entity, id, fk, index, &mut issues);
    }
    for invariant in rules.invariants {
        if !invariant_holds(entity, *invariant) {
            issues.push(Issue::blocker(
                module,
                id,
                CheckType::Invariant,
                invariant.code(),
                format!("invariant {} violated", invariant.name()),
            ));
        }
    }
    issues
}

/// Validate every entity of a module and reject repeated ids.
#[must_use]
pub fn validate_module(module: Module, entities: &[Value], index: &EntityIndex) -> Vec<Issue> {
    let mut seen = BTreeSet::new();
    let mut issues = Vec::new();
    for entity in entities {
        issues.extend(validate_entity(module, entity, index));
        let id = entity_id(entity);
        if !id.is_empty() && !seen.insert(id) {
            issues.push(Issue::blocker(
                module,
                id,
                CheckType::Schema,
                "SCHEMA_DUPLICATE_ID",
                "id appears more than once in the module",
            ));
        }
    }
    issues
}

/// A populated module without any persisted registry entries means ids were
/// minted rather than looked up.
#[must_use]
pub fn check_registry_completeness(
    module: Module,
    records: usize,
    persisted_entries: usize,
) -> Option<Issue> {
    (records > 0 && persisted_entries == 0).then(|| {
        Issue::warning(
            module,
            "",
            CheckType::Registry,
            "REGISTRY_EMPTY",
            format!("{records} records but no persisted registry entries"),
        )
    })
}

#[must_use]
pub fn check_drift(module: Module, entity: &Value) -> Option<Issue> {
    let version = entity.get("schemaVersion").and_then(Value::as_u64);
    (version != Some(u64::from(SCHEMA_VERSION))).then(|| {
        Issue::blocker(
            module,
            entity_id(entity),
            CheckType::Drift,
            "SCHEMA_DRIFT",
            format!("entity schemaVersion differs from target version {SCHEMA_VERSION}"),
        )
    })
}

/// Non-empty values of the module's PII fields.
#[must_use]
pub fn collect_pii_values(module: Module, entities: &[Value]) -> BTreeSet<String> {
    let fields = rules_for(module).pii;
    entities
        .iter()
        .flat_map(|entity| fields.iter().map(move |field| text(entity, field).trim()))
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn leaks_value(candidate: &str, pii_values: &BTreeSet<String>) -> bool {
    pii_values.iter().any(|value| {
        candidate == value
            || (value.chars().count() >= PII_SUBSTRING_MIN_LEN && candidate.contains(value.as_str()))
    })
}

fn walk_pii(value: &Value, path: &str, pii_values: &BTreeSet<String>, hits: &mut Vec<String>) {
    match value {
        Value::Object(object) => {
            let pii_fields = all_pii_fields();
            for (key, item) in object {
                let child = format!("{path}.{key}");
                if pii_fields.contains(&key.as_str()) {
                    hits.push(format!("field {child}"));
                }
                walk_pii(item, &child, pii_values, hits);
            }
        }
        Value::Array(items) => {
            for (position, item) in items.iter().enumerate() {
                walk_pii(item, &format!("{path}[{position}]"), pii_values, hits);
            }
        }
        Value::String(candidate) => {
            if leaks_value(candidate, pii_values) {
                hits.push(format!("value at {path}"));
            }
        }
        _ => {}
    }
}

/// Scan an artifact that must not carry personal data. Messages only name
/// the location, never the leaked value.
#[must_use]
pub fn audit_pii(
    module: Module,
    artifact: &str,
    document: &Value,
    pii_values: &BTreeSet<String>,
) -> Vec<Issue> {
    let mut hits = Vec::new();
    walk_pii(document, "$", pii_values, &mut hits);
    hits.into_iter()
        .map(|location| {
            Issue::blocker(
                module,
                "",
                CheckType::Pii,
                "PII_LEAK",
                format!("{artifact} exposes personal data: {location}"),
            )
        })
        .collect()
}
