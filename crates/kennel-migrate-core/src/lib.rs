use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod mapper;
pub mod merkle;
pub mod normalize;
pub mod registry;
pub mod report;
pub mod rules;
pub mod source;
pub mod validator;

pub use canonical::{canonical_bytes, canonicalize, entity_hash, sha256_hex};
pub use mapper::{
    map_calendar_entry, map_course, map_customer, map_dog, map_finance_entry, map_merchandise_sale,
    map_module, CanonicalEntity, MappedRecord, MappingContext, ModuleBatch,
};
pub use merkle::{
    build_manifest, checksum_entries, merkle_root, ChecksumEntry, MerkleManifest, ModuleRoot,
    RunMetadata,
};
pub use registry::{derive_target_id, Registry, RegistryEntry, Resolution};
pub use report::{build_report, has_blockers, to_canonical_pretty, ModuleReport, ReportKind};
pub use source::{InMemorySource, LegacySource};
pub use validator::EntityIndex;

/// Target schema version every canonical entity carries.
pub const SCHEMA_VERSION: u32 = 1;

/// One untyped legacy row: column name to string value.
pub type LegacyRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrateError {
    #[error("source error: {0}")]
    Source(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Customers,
    Dogs,
    Trainers,
    Courses,
    Calendar,
    Finance,
    Merchandise,
}

impl Module {
    /// Processing order. Later modules may only reference earlier ones.
    pub const ALL: [Module; 7] = [
        Self::Customers,
        Self::Dogs,
        Self::Trainers,
        Self::Courses,
        Self::Calendar,
        Self::Finance,
        Self::Merchandise,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Dogs => "dogs",
            Self::Trainers => "trainers",
            Self::Courses => "courses",
            Self::Calendar => "calendar",
            Self::Finance => "finance",
            Self::Merchandise => "merchandise",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customers" => Some(Self::Customers),
            "dogs" => Some(Self::Dogs),
            "trainers" => Some(Self::Trainers),
            "courses" => Some(Self::Courses),
            "calendar" => Some(Self::Calendar),
            "finance" => Some(Self::Finance),
            "merchandise" => Some(Self::Merchandise),
            _ => None,
        }
    }

    /// Prefix of the derived display code (`CUS-42`).
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Customers => "CUS",
            Self::Dogs => "DOG",
            Self::Trainers => "TRN",
            Self::Courses => "CRS",
            Self::Calendar => "CAL",
            Self::Finance => "FIN",
            Self::Merchandise => "MER",
        }
    }

    /// Issue code stem used when a legacy reference into this module fails.
    #[must_use]
    pub fn reference_code(self) -> &'static str {
        match self {
            Self::Customers => "KUNDE",
            Self::Dogs => "HUND",
            Self::Trainers => "TRAINER",
            Self::Courses => "KURS",
            Self::Calendar => "KALENDER",
            Self::Finance => "FINANZ",
            Self::Merchandise => "WARE",
        }
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Blocker,
    Warning,
    Info,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocker => "BLOCKER",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CheckType {
    Mapping,
    Schema,
    ForeignKey,
    Invariant,
    Registry,
    Pii,
    Drift,
    Checksum,
}

/// A classified finding. Reports carry these; canonical data never does.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub module: Module,
    pub entity_id: String,
    pub check_type: CheckType,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Issue {
    #[must_use]
    pub fn new(
        module: Module,
        entity_id: impl Into<String>,
        check_type: CheckType,
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module,
            entity_id: entity_id.into(),
            check_type,
            severity,
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn blocker(
        module: Module,
        entity_id: impl Into<String>,
        check_type: CheckType,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(module, entity_id, check_type, Severity::Blocker, code, message)
    }

    #[must_use]
    pub fn warning(
        module: Module,
        entity_id: impl Into<String>,
        check_type: CheckType,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(module, entity_id, check_type, Severity::Warning, code, message)
    }

    #[must_use]
    pub fn info(
        module: Module,
        entity_id: impl Into<String>,
        check_type: CheckType,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(module, entity_id, check_type, Severity::Info, code, message)
    }

    #[must_use]
    pub fn is_blocker(&self) -> bool {
        self.severity == Severity::Blocker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_round_trip_through_parse() {
        for module in Module::ALL {
            assert_eq!(Module::parse(module.as_str()), Some(module));
        }
        assert_eq!(Module::parse("kunden"), None);
    }

    #[test]
    fn issue_serializes_with_camel_case_and_upper_severity() -> Result<(), MigrateError> {
        let issue = Issue::blocker(
            Module::Dogs,
            "abc",
            CheckType::ForeignKey,
            "FK_UNRESOLVED_OWNER_ID",
            "ownerId does not resolve",
        );
        let value = serde_json::to_value(&issue)?;
        assert_eq!(value["severity"], "BLOCKER");
        assert_eq!(value["checkType"], "foreignKey");
        assert_eq!(value["entityId"], "abc");
        assert_eq!(value["module"], "dogs");
        Ok(())
    }
}
