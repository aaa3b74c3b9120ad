//! Deterministic run reports.
//!
//! Two runs over the same input produce byte-identical report files: keys are
//! sorted, issues keep their production order and the timestamp is a fixed
//! placeholder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::canonicalize;
use crate::{Issue, MigrateError, Module, Severity};

pub const GENERATED_AT_PLACEHOLDER: &str = "<generated-at>";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    DryRun,
    Migrate,
    Scan,
}

impl ReportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Migrate => "migrate",
            Self::Scan => "scan",
        }
    }

    #[must_use]
    pub fn file_name(self) -> String {
        format!("{}-report.json", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModuleReport {
    pub records: usize,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Summary {
    pub blocker: usize,
    pub warning: usize,
    pub info: usize,
}

#[must_use]
pub fn summarize<'a>(issues: impl IntoIterator<Item = &'a Issue>) -> Summary {
    let mut summary = Summary::default();
    for issue in issues {
        match issue.severity {
            Severity::Blocker => summary.blocker += 1,
            Severity::Warning => summary.warning += 1,
            Severity::Info => summary.info += 1,
        }
    }
    summary
}

#[must_use]
pub fn has_blockers(modules: &BTreeMap<Module, ModuleReport>) -> bool {
    modules.values().flat_map(|report| &report.issues).any(Issue::is_blocker)
}

/// Build the report document with sorted keys.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when an issue cannot be encoded.
pub fn build_report(
    kind: ReportKind,
    modules: &BTreeMap<Module, ModuleReport>,
) -> Result<Value, MigrateError> {
    let summary = summarize(modules.values().flat_map(|report| &report.issues));
    let mut module_docs = serde_json::Map::new();
    for (module, report) in modules {
        module_docs.insert(module.as_str().to_string(), serde_json::to_value(report)?);
    }
    let document = json!({
        "kind": kind.as_str(),
        "generatedAt": GENERATED_AT_PLACEHOLDER,
        "summary": summary,
        "modules": Value::Object(module_docs),
    });
    Ok(canonicalize(&document))
}

/// Two-space pretty JSON with sorted keys and a trailing newline.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when the value cannot be encoded.
pub fn to_canonical_pretty(value: &Value) -> Result<String, MigrateError> {
    let mut text = serde_json::to_string_pretty(&canonicalize(value))?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CheckType;

    fn sample() -> BTreeMap<Module, ModuleReport> {
        let mut modules = BTreeMap::new();
        modules.insert(
            Module::Dogs,
            ModuleReport {
                records: 2,
                issues: vec![
                    Issue::blocker(Module::Dogs, "d1", CheckType::ForeignKey, "KUNDE_NOT_FOUND", "x"),
                    Issue::info(Module::Dogs, "d1", CheckType::Registry, "REGISTRY_NEW", "y"),
                ],
            },
        );
        modules.insert(Module::Customers, ModuleReport { records: 1, issues: Vec::new() });
        modules
    }

    #[test]
    fn report_summarizes_by_severity() -> Result<(), MigrateError> {
        let report = build_report(ReportKind::DryRun, &sample())?;
        assert_eq!(report["kind"], "dry-run");
        assert_eq!(report["generatedAt"], GENERATED_AT_PLACEHOLDER);
        assert_eq!(report["summary"]["blocker"], 1);
        assert_eq!(report["summary"]["warning"], 0);
        assert_eq!(report["summary"]["info"], 1);
        assert_eq!(report["modules"]["dogs"]["records"], 2);
        assert!(has_blockers(&sample()));
        Ok(())
    }

    #[test]
    fn pretty_output_is_sorted_and_newline_terminated() -> Result<(), MigrateError> {
        let text = to_canonical_pretty(&build_report(ReportKind::Scan, &sample())?)?;
        assert!(text.ends_with("}\n"));
        let generated = text.find("\"generatedAt\"");
        let kind = text.find("\"kind\"");
        let modules = text.find("\"modules\"");
        assert!(generated < kind && kind < modules);
        assert!(text.contains("\n  \"kind\": \"scan\""));
        Ok(())
    }

    #[test]
    fn identical_inputs_render_identical_bytes() -> Result<(), MigrateError> {
        let first = to_canonical_pretty(&build_report(ReportKind::Migrate, &sample())?)?;
        let second = to_canonical_pretty(&build_report(ReportKind::Migrate, &sample())?)?;
        assert_eq!(first, second);
        assert_eq!(ReportKind::Migrate.file_name(), "migrate-report.json");
        Ok(())
    }
}
