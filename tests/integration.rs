use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cjenik_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cjenik");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    // Nothing listens on the upstream address: every command below must
    // either stay local or fail fast.
    let config_content = format!(
        r#"[db]
path = "{}/data/cjenik.sqlite"

[upstream]
base_url = "http://127.0.0.1:1"
timeout_secs = 2
"#,
        root.display()
    );

    let config_path = config_dir.join("cjenik.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cjenik(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cjenik_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cjenik binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cjenik(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("cjenik.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cjenik(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cjenik(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let (tmp, _config_path) = setup_test_env();

    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_cjenik(&missing, &["init"]);
    assert!(!success, "init with missing config should fail");
    assert!(stderr.contains("config"), "got: {}", stderr);
}

#[test]
fn test_search_empty_query_stays_local() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    // An empty query never reaches the catalog or the upstream.
    let (stdout, _, success) = run_cjenik(&config_path, &["search", ""]);
    assert!(success, "empty search should not fail");
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_cjenik(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_empty_catalog_unreachable_upstream_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    // No ingested dates: the query layer goes remote and the upstream is dead.
    let (_, stderr, success) = run_cjenik(&config_path, &["search", "mlijeko"]);
    assert!(!success, "remote search against a dead upstream should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_history_requires_barcode_or_name() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    let (_, stderr, success) = run_cjenik(&config_path, &["history", "--days", "7"]);
    assert!(!success, "history without a lookup should be refused");
    assert!(
        stderr.contains("--barcode or --name"),
        "got: {}",
        stderr
    );
}

#[test]
fn test_history_zero_days_is_empty() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    let (stdout, stderr, success) = run_cjenik(
        &config_path,
        &["history", "--barcode", "5901234123457", "--days", "0"],
    );
    assert!(success, "zero-day history should succeed: {}", stderr);
    assert!(stdout.contains("No history."));
}

#[test]
fn test_status_on_empty_catalog() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    let (stdout, _, success) = run_cjenik(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("No ingested dates."));
}

#[test]
fn test_cities_fall_back_to_major_list() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    // Empty catalog plus a dead upstream: the fixed floor list answers.
    let (stdout, _, success) = run_cjenik(&config_path, &["cities"]);
    assert!(success);
    assert!(stdout.contains("Zagreb"));
    assert!(stdout.contains("Split"));
}

#[test]
fn test_ingest_rejects_malformed_date() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    let (_, stderr, success) = run_cjenik(&config_path, &["ingest", "--date", "01.06.2025"]);
    assert!(!success, "malformed date should be refused");
    assert!(stderr.contains("YYYY-MM-DD"), "got: {}", stderr);
}

#[test]
fn test_ingest_unreachable_upstream_records_error() {
    let (_tmp, config_path) = setup_test_env();

    run_cjenik(&config_path, &["init"]);
    let (_, _, success) = run_cjenik(&config_path, &["ingest", "--date", "2025-06-01"]);
    assert!(!success, "ingest against a dead upstream should fail");

    // The attempt is persisted: status now shows an error row for the date.
    let (stdout, _, success) = run_cjenik(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("2025-06-01"));
    assert!(stdout.contains("error"));
}
