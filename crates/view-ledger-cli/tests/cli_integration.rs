use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_vl<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_vl"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("VIEW_LEDGER_CATEGORIES_URL")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute vl binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_vl(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "vl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn payload_len(value: &Value) -> usize {
    value
        .get("payload")
        .and_then(Value::as_array)
        .map_or_else(|| panic!("missing array payload: {value}"), Vec::len)
}

fn category_actions(value: &Value) -> Vec<String> {
    value
        .get("categories")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing categories in payload: {value}"))
        .iter()
        .map(|entry| as_str(entry, "action").to_string())
        .collect()
}

// Test IDs: TCLI-001
#[test]
fn cli_migrate_reports_contract_version() {
    let dir = unique_temp_dir("view-ledger-cli-migrate");
    let db = dir.join("views.sqlite3");

    let dry_run = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert_eq!(dry_run.get("dry_run").and_then(Value::as_bool), Some(true));

    run_json(&db, ["db", "migrate"]);
    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn cli_view_lifecycle_and_history() {
    let dir = unique_temp_dir("view-ledger-cli-views");
    let db = dir.join("views.sqlite3");
    let c1 = ulid::Ulid::new().to_string();
    let c2 = ulid::Ulid::new().to_string();

    let created = run_json(
        &db,
        ["view", "create", "--name", "Reading", "--category", c1.as_str(), "--category", c2.as_str()],
    );
    assert_eq!(as_str(&created, "action"), "created");
    assert_eq!(category_actions(&created), vec!["created", "created"]);
    let key = as_str(&created, "key").to_string();
    let created_at = as_str(&created, "created_at").to_string();

    let updated = run_json(
        &db,
        ["view", "update", key.as_str(), "--name", "Reading", "--category", c1.as_str()],
    );
    let mut actions = category_actions(&updated);
    actions.sort();
    assert_eq!(actions, vec!["deleted", "unmodified"]);

    let fetched = run_json(&db, ["view", "get", key.as_str()]);
    assert_eq!(category_actions(&fetched).len(), 1);

    let history = run_json(&db, ["view", "history", key.as_str()]);
    assert!(payload_len(&history) >= 1);

    let past = run_json(&db, ["view", "at", key.as_str(), "--created-at", created_at.as_str()]);
    assert_eq!(as_str(&past, "name"), "Reading");

    let listed = run_json(&db, ["view", "list", "--name", "read"]);
    assert_eq!(payload_len(&listed), 1);

    let deleted = run_json(&db, ["view", "delete", key.as_str()]);
    assert_eq!(as_str(&deleted, "action"), "deleted");

    let missing = run_vl(&db, ["view", "get", key.as_str()]);
    assert!(!missing.status.success());
    let stderr = String::from_utf8_lossy(&missing.stderr);
    assert!(stderr.contains("not found"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn cli_rejects_malformed_keys() {
    let dir = unique_temp_dir("view-ledger-cli-invalid");
    let db = dir.join("views.sqlite3");

    let output = run_vl(&db, ["view", "get", "not-a-key"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("validation failed"), "unexpected stderr: {stderr}");

    let output = run_vl(&db, ["view", "create", "--name", "No categories"]);
    assert!(!output.status.success());

    let _ = fs::remove_dir_all(&dir);
}
