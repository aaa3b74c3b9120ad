use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use kennel_migrate_api::{KennelMigrateApi, PipelineConfig, RunOutcome};
use kennel_migrate_core::Module;
use kennel_migrate_store::ScanScope;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "km.v1";
const DEFAULT_LOG_FILTER: &str = "km=info,kennel_migrate_api=info";

#[derive(Debug, Parser)]
#[command(name = "km")]
#[command(about = "Kennel legacy data migration")]
struct Cli {
    /// YAML pipeline configuration; flags below override its values.
    #[arg(long, env = "KM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "KM_SOURCE_DIR", global = true)]
    source_dir: Option<PathBuf>,

    #[arg(long, env = "KM_REGISTRY_DIR", global = true)]
    registry_dir: Option<PathBuf>,

    #[arg(long, env = "KM_SNAPSHOT_DIR", global = true)]
    snapshot_dir: Option<PathBuf>,

    #[arg(long, env = "KM_REPORTS_DIR", global = true)]
    reports_dir: Option<PathBuf>,

    /// Fallback creation timestamp for rows without one.
    #[arg(long, global = true)]
    migrated_at: Option<String>,

    /// Program and arguments run before the export directory is read.
    #[arg(long, value_delimiter = ' ', global = true)]
    export_command: Option<Vec<String>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Map and validate without writing a snapshot or registry.
    DryRun,
    /// Map, validate and commit the snapshot when nothing blocks.
    Migrate,
    ScanAll,
    ScanModule {
        #[arg(required = true)]
        modules: Vec<String>,
    },
    ScanPii,
    ScanDrift,
    VerifyChecksums,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.source_dir {
            config.source_dir.clone_from(dir);
        }
        if let Some(dir) = &self.registry_dir {
            config.registry_dir.clone_from(dir);
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir.clone_from(dir);
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir.clone_from(dir);
        }
        if self.migrated_at.is_some() {
            config.migrated_at.clone_from(&self.migrated_at);
        }
        if self.export_command.is_some() {
            config.export_command.clone_from(&self.export_command);
        }
        Ok(config)
    }
}

fn parse_modules(names: &[String]) -> Result<Vec<Module>> {
    names
        .iter()
        .map(|name| {
            Module::parse(name).ok_or_else(|| {
                let known: Vec<&str> = Module::ALL.iter().map(|module| module.as_str()).collect();
                anyhow!("unknown module {name:?}; expected one of {}", known.join(", "))
            })
        })
        .collect()
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: &Cli) -> Result<RunOutcome> {
    let config = cli.pipeline_config()?;
    debug!(?config, "resolved pipeline config");
    let api = KennelMigrateApi::new(config);
    match &cli.command {
        Command::DryRun => api.dry_run(),
        Command::Migrate => api.migrate(),
        Command::ScanAll => api.scan(&ScanScope::All),
        Command::ScanModule { modules } => api.scan(&ScanScope::Modules(parse_modules(modules)?)),
        Command::ScanPii => api.scan(&ScanScope::Pii),
        Command::ScanDrift => api.scan(&ScanScope::Drift),
        Command::VerifyChecksums => api.scan(&ScanScope::Checksums),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let outcome = run(&cli).and_then(|outcome| {
        emit_json(serde_json::to_value(&outcome)?)?;
        Ok(outcome)
    });
    match outcome {
        Ok(outcome) if outcome.blocked => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_yaml_defaults() -> Result<()> {
        let cli = Cli::try_parse_from([
            "km",
            "--snapshot-dir",
            "/tmp/snap",
            "--migrated-at",
            "2024-06-01",
            "scan-module",
            "dogs",
            "customers",
        ])?;
        let config = cli.pipeline_config()?;
        assert_eq!(config.snapshot_dir, PathBuf::from("/tmp/snap"));
        assert_eq!(config.registry_dir, PathBuf::from("./registry"));
        assert_eq!(config.migrated_at.as_deref(), Some("2024-06-01"));
        let Command::ScanModule { modules } = &cli.command else {
            panic!("scan-module must parse into ScanModule");
        };
        assert_eq!(parse_modules(modules)?, vec![Module::Dogs, Module::Customers]);
        Ok(())
    }

    #[test]
    fn unknown_module_names_are_rejected() {
        assert!(parse_modules(&["kunden".to_string()]).is_err());
    }

    #[test]
    fn envelope_carries_contract_version() {
        let value = with_contract_version(serde_json::json!({"blocked": false}));
        assert_eq!(value["contract_version"], CLI_CONTRACT_VERSION);
        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));
    }
}
