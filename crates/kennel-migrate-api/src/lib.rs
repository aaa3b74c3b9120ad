//! Orchestration of dry-run, migrate and scan runs over a [`PipelineConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use kennel_migrate_core::mapper::{Lookups, MappingContext};
use kennel_migrate_core::report::{summarize, Summary};
use kennel_migrate_core::source::COURSE_CATEGORIES_TABLE;
use kennel_migrate_core::validator::{
    audit_pii, check_registry_completeness, collect_pii_values, validate_module,
};
use kennel_migrate_core::{
    build_report, has_blockers, map_module, to_canonical_pretty, EntityIndex, LegacySource, Module,
    ModuleReport, Registry, ReportKind, RunMetadata,
};
use kennel_migrate_store::fsutil::write_file_atomic;
use kennel_migrate_store::{
    load_registry, run_export_command, scan, ExportDirSource, ModuleEntities, ScanScope,
    SnapshotLock, SnapshotWriter,
};
use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

pub mod config;

pub use config::PipelineConfig;

/// Result of one run, as reported to the caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub kind: ReportKind,
    pub summary: Summary,
    /// At least one BLOCKER was raised.
    pub blocked: bool,
    /// A snapshot was committed by this run.
    pub committed: bool,
    pub report_path: PathBuf,
    pub run: Option<RunMetadata>,
}

struct Pipeline {
    batches: Vec<ModuleEntities>,
    reports: BTreeMap<Module, ModuleReport>,
}

#[derive(Debug, Clone)]
pub struct KennelMigrateApi {
    config: PipelineConfig,
}

impl KennelMigrateApi {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn export_source(&self) -> Result<ExportDirSource> {
        if let Some(command) = &self.config.export_command {
            run_export_command(command, &self.config.source_dir)?;
        }
        Ok(ExportDirSource::new(&self.config.source_dir))
    }

    /// Map and validate everything without writing a snapshot or registry.
    ///
    /// # Errors
    /// Returns an error when the export, the source or the registry cannot be
    /// read, or the report cannot be written.
    pub fn dry_run(&self) -> Result<RunOutcome> {
        let source = self.export_source()?;
        self.dry_run_with_source(&source)
    }

    /// [`Self::dry_run`] over an explicit source.
    ///
    /// # Errors
    /// See [`Self::dry_run`].
    pub fn dry_run_with_source(&self, source: &dyn LegacySource) -> Result<RunOutcome> {
        let mut registry = load_registry(&self.config.registry_dir)?;
        let pipeline = self.map_and_validate(source, &mut registry)?;
        let blocked = has_blockers(&pipeline.reports);
        let (summary, report_path) = self.write_report(ReportKind::DryRun, &pipeline.reports)?;
        info!(blocked, blockers = summary.blocker, "dry-run finished");
        Ok(RunOutcome {
            kind: ReportKind::DryRun,
            summary,
            blocked,
            committed: false,
            report_path,
            run: None,
        })
    }

    /// Map, validate and, when no BLOCKER was raised, commit the snapshot and
    /// persist the registry.
    ///
    /// # Errors
    /// Returns an error when another migrate holds the snapshot lock, or when
    /// any read, commit or registry write fails. The previously committed
    /// snapshot and registry are left untouched in that case.
    pub fn migrate(&self) -> Result<RunOutcome> {
        let source = self.export_source()?;
        self.migrate_with_source(&source)
    }

    /// [`Self::migrate`] over an explicit source.
    ///
    /// # Errors
    /// See [`Self::migrate`].
    pub fn migrate_with_source(&self, source: &dyn LegacySource) -> Result<RunOutcome> {
        let _lock = SnapshotLock::acquire(&self.config.snapshot_dir)?;
        let mut registry = load_registry(&self.config.registry_dir)?;
        let pipeline = self.map_and_validate(source, &mut registry)?;

        let blocked = has_blockers(&pipeline.reports);
        let run = if blocked {
            warn!("blocking issues found; snapshot and registry left unchanged");
            None
        } else {
            let run_id = Ulid::new().to_string();
            let generated_at = config::now_rfc3339()?;
            let run = SnapshotWriter::new(&self.config.snapshot_dir).commit_with_registry(
                &run_id,
                &generated_at,
                &pipeline.batches,
                &self.config.registry_dir,
                &registry,
            )?;
            Some(run)
        };

        let (summary, report_path) = self.write_report(ReportKind::Migrate, &pipeline.reports)?;
        info!(blocked, committed = run.is_some(), "migrate finished");
        Ok(RunOutcome {
            kind: ReportKind::Migrate,
            summary,
            blocked,
            committed: run.is_some(),
            report_path,
            run,
        })
    }

    /// Re-verify the committed snapshot.
    ///
    /// # Errors
    /// Returns an error when a migrate is running or no snapshot exists.
    /// Unparsable artifacts are reported as BLOCKERs.
    pub fn scan(&self, scope: &ScanScope) -> Result<RunOutcome> {
        let reports = scan(&self.config.snapshot_dir, &self.config.registry_dir, scope)?;
        let blocked = has_blockers(&reports);
        let (summary, report_path) = self.write_report(ReportKind::Scan, &reports)?;
        info!(blocked, blockers = summary.blocker, "scan finished");
        Ok(RunOutcome {
            kind: ReportKind::Scan,
            summary,
            blocked,
            committed: false,
            report_path,
            run: None,
        })
    }

    fn map_and_validate(
        &self,
        source: &dyn LegacySource,
        registry: &mut Registry,
    ) -> Result<Pipeline> {
        let listed = source.list_modules()?;
        for table in &listed {
            if Module::parse(table).is_none() && table != COURSE_CATEGORIES_TABLE {
                warn!(table = %table, "ignoring unknown export table");
            }
        }

        let persisted: BTreeMap<Module, usize> =
            Module::ALL.into_iter().map(|module| (module, registry.persisted_len(module))).collect();
        let lookups = load_lookups(source)?;
        let mut ctx = MappingContext::new(registry, self.config.migrated_at()?);
        ctx.lookups = lookups;

        let mut mapped = Vec::with_capacity(Module::ALL.len());
        for module in Module::ALL {
            let rows = source
                .read_module(module.as_str())
                .with_context(|| format!("failed to read legacy {module}"))?;
            let batch = map_module(module, rows, &mut ctx);
            let values = batch.values().with_context(|| format!("failed to encode {module}"))?;
            let warnings = batch.issues.iter().filter(|issue| !issue.is_blocker()).count();
            info!(module = %module, records = values.len(), "mapped legacy rows");
            if warnings > 0 {
                warn!(module = %module, warnings, "legacy data repaired or annotated during mapping");
            }
            mapped.push((module, values, batch.issues));
        }

        let mut index = EntityIndex::default();
        let mut pii_values = BTreeSet::new();
        for (module, values, _) in &mapped {
            index.insert_module(*module, values);
            pii_values.extend(collect_pii_values(*module, values));
        }

        let mut batches = Vec::with_capacity(mapped.len());
        let mut reports = BTreeMap::new();
        for (module, values, mut issues) in mapped {
            issues.extend(validate_module(module, &values, &index));
            issues.extend(check_registry_completeness(
                module,
                values.len(),
                persisted.get(&module).copied().unwrap_or(0),
            ));
            let document = serde_json::to_value(&issues).context("failed to encode issues")?;
            issues.extend(audit_pii(module, "report", &document, &pii_values));

            reports.insert(module, ModuleReport { records: values.len(), issues });
            batches.push(ModuleEntities { module, entities: values });
        }

        Ok(Pipeline { batches, reports })
    }

    fn write_report(
        &self,
        kind: ReportKind,
        reports: &BTreeMap<Module, ModuleReport>,
    ) -> Result<(Summary, PathBuf)> {
        let document = build_report(kind, reports).context("failed to build report")?;
        let text = to_canonical_pretty(&document).context("failed to render report")?;
        let path = self.config.reports_dir.join(kind.file_name());
        write_file_atomic(&path, text.as_bytes())?;
        Ok((summarize(reports.values().flat_map(|report| &report.issues)), path))
    }
}

fn load_lookups(source: &dyn LegacySource) -> Result<Lookups> {
    let rows = source
        .read_module(COURSE_CATEGORIES_TABLE)
        .context("failed to read course category lookup")?;
    let course_categories = rows
        .into_iter()
        .filter_map(|row| {
            let code = row.get("code")?.trim().to_string();
            let label = row.get("label")?.trim().to_string();
            (!code.is_empty()).then_some((code, label))
        })
        .collect();
    Ok(Lookups { course_categories })
}
