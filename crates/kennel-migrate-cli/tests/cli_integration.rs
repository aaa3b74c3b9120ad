use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir()
            .unwrap_or_else(|err| panic!("failed to create temp workspace: {err}"));
        fs::create_dir_all(root.path().join("export"))
            .unwrap_or_else(|err| panic!("failed to create export dir: {err}"));
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn write_table(&self, table: &str, rows: &[Value]) {
        let mut text = String::new();
        for row in rows {
            text.push_str(&row.to_string());
            text.push('\n');
        }
        let path = self.path("export").join(format!("{table}.ndjson"));
        fs::write(&path, text)
            .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    }

    fn run_km<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_km"))
            .arg("--source-dir")
            .arg(self.path("export"))
            .arg("--registry-dir")
            .arg(self.path("registry"))
            .arg("--snapshot-dir")
            .arg(self.path("snapshot"))
            .arg("--reports-dir")
            .arg(self.path("reports"))
            .arg("--migrated-at")
            .arg("2024-06-01")
            .args(args)
            .env_remove("KM_CONFIG")
            .output()
            .unwrap_or_else(|err| panic!("failed to execute km binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I, expected_code: i32) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run_km(args);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.code() != Some(expected_code) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "km exited with {} (expected {expected_code}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
                output.status
            );
        }
        serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
    }
}

fn read_report(envelope: &Value) -> String {
    let path = envelope
        .get("report_path")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing report_path in envelope: {envelope}"));
    fs::read_to_string(Path::new(path))
        .unwrap_or_else(|err| panic!("failed to read report {path}: {err}"))
}

fn summary_count(envelope: &Value, severity: &str) -> u64 {
    envelope
        .get("summary")
        .and_then(|summary| summary.get(severity))
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing summary.{severity} in envelope: {envelope}"))
}

fn write_consistent_export(workspace: &Workspace) {
    workspace.write_table(
        "customers",
        &[serde_json::json!({
            "legacyId": 1,
            "firstName": "Anna",
            "lastName": "Berg",
            "email": "anna.berg@example.org",
            "status": "aktiv"
        })],
    );
    workspace.write_table(
        "dogs",
        &[serde_json::json!({"legacyId": "10", "name": "Rex", "ownerLegacyId": "1"})],
    );
    workspace.write_table("trainers", &[serde_json::json!({"legacyId": "T1", "lastName": "Kranz"})]);
    workspace.write_table(
        "courses",
        &[serde_json::json!({
            "legacyId": "C1",
            "title": "Welpen",
            "startTime": "18:00",
            "endTime": "19:30",
            "trainerLegacyIds": "T1"
        })],
    );
    workspace.write_table(
        "calendar",
        &[serde_json::json!({"legacyId": "K1", "date": "05.03.2024", "courseLegacyId": "C1"})],
    );
    workspace.write_table(
        "finance",
        &[serde_json::json!({
            "legacyId": "F1",
            "customerLegacyId": "1",
            "date": "2024-03-05",
            "amount": "120,00"
        })],
    );
    workspace.write_table("merchandise", &[serde_json::json!({"legacyId": "M1", "article": "Leine"})]);
}

#[test]
fn dry_run_with_unknown_owner_exits_one() {
    let workspace = Workspace::new();
    workspace.write_table("customers", &[serde_json::json!({"legacyId": "1", "lastName": "Berg"})]);
    workspace.write_table(
        "dogs",
        &[serde_json::json!({"legacyId": "5", "name": "Rex", "ownerLegacyId": "999"})],
    );

    let envelope = workspace.run_json(["dry-run"], 1);
    assert_eq!(envelope["contract_version"], "km.v1");
    assert_eq!(envelope["blocked"], true);
    assert!(summary_count(&envelope, "blocker") >= 1);
    assert!(read_report(&envelope).contains("\"code\": \"KUNDE_NOT_FOUND\""));
    assert!(!workspace.path("snapshot").exists());
}

#[test]
fn migrate_then_scans_are_clean() {
    let workspace = Workspace::new();
    write_consistent_export(&workspace);

    let migrated = workspace.run_json(["migrate"], 0);
    assert_eq!(migrated["committed"], true);
    assert_eq!(summary_count(&migrated, "blocker"), 0);
    assert!(workspace.path("snapshot").join("checksums").join("run.json").exists());

    for command in ["verify-checksums", "scan-all", "scan-pii", "scan-drift"] {
        let scanned = workspace.run_json([command], 0);
        assert_eq!(summary_count(&scanned, "blocker"), 0, "{command} reported blockers");
    }
    let selected = workspace.run_json(["scan-module", "dogs", "customers"], 0);
    assert_eq!(selected["blocked"], false);
}

#[test]
fn tampered_snapshot_fails_verification() {
    let workspace = Workspace::new();
    write_consistent_export(&workspace);
    workspace.run_json(["migrate"], 0);

    let data_path = workspace.path("snapshot").join("dogs").join("data.jsonl");
    let data = fs::read_to_string(&data_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", data_path.display()));
    fs::write(&data_path, data.replace("Rex", "Max"))
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", data_path.display()));

    let envelope = workspace.run_json(["verify-checksums"], 1);
    assert!(read_report(&envelope).contains("\"code\": \"CHECKSUM_MISMATCH\""));
}

#[test]
fn unknown_scan_module_is_a_fatal_error() {
    let workspace = Workspace::new();
    write_consistent_export(&workspace);
    workspace.run_json(["migrate"], 0);

    let output = workspace.run_km(["scan-module", "kunden"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown module"));
}

#[test]
fn scan_without_snapshot_is_a_fatal_error() {
    let workspace = Workspace::new();
    let output = workspace.run_km(["scan-all"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}
