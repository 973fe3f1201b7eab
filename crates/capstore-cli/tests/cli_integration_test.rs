//! CLI integration tests
//!
//! Drive the `capstore` binary against a throwaway data directory.

use std::path::Path;
use std::process::{Command, Output};

fn capstore(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_capstore"))
        .args(args)
        .env_remove("CAPSTORE_CONFIG")
        .env_remove("CAPSTORE_OUTPUT")
        .env("CAPSTORE_DATA_DIR", dir.join("shards"))
        .env("CAPSTORE_REGISTRY_PATH", dir.join("registry.db"))
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute capstore")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let output = capstore(dir.path(), &["--help"]);

    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["init", "run", "status", "refresh", "provision", "replay", "put", "get", "query"] {
        assert!(text.contains(command), "missing {command} in help");
    }
}

#[test]
fn test_status_before_init_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = capstore(dir.path(), &["status"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("capstore init"));
}

#[test]
fn test_init_then_status_json() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());
    // Second init reloads instead of failing.
    assert!(capstore(dir.path(), &["init"]).status.success());

    let output = capstore(dir.path(), &["status", "-o", "json"]);
    assert!(output.status.success());

    let registry: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(registry["version"], 1);
    assert_eq!(registry["shards"][0]["id"], "shard-0001");
    assert_eq!(registry["shards"][0]["role"], "WRITE_TARGET");
    assert!(dir.path().join("shards").join("shard-0001.db").exists());
}

#[test]
fn test_put_get_query_and_replay() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());

    let put = capstore(
        dir.path(),
        &["put", "--name", "Ada Lovelace", "--email", "ada@example.com"],
    );
    assert!(put.status.success(), "{}", String::from_utf8_lossy(&put.stderr));
    assert!(stdout(&put).contains("CAND-0001"));

    let get = capstore(dir.path(), &["get", "CAND-0001", "--output", "json"]);
    assert!(get.status.success());
    let result: serde_json::Value = serde_json::from_str(&stdout(&get)).unwrap();
    assert_eq!(result["partial"], false);
    assert_eq!(result["rows"][0]["shardId"], "shard-0001");
    assert_eq!(result["rows"][0]["record"]["name"], "Ada Lovelace");

    let query = capstore(dir.path(), &["-o", "json", "query", "--email", "ADA@example.com"]);
    assert!(query.status.success());
    let result: serde_json::Value = serde_json::from_str(&stdout(&query)).unwrap();
    assert_eq!(result["rows"].as_array().unwrap().len(), 1);

    let update = capstore(dir.path(), &["update", "CAND-0001", "--phone", "+1-555-0100"]);
    assert!(update.status.success());

    let missing = capstore(dir.path(), &["get", "CAND-0999"]);
    assert!(!missing.status.success());

    assert!(capstore(dir.path(), &["replay"]).status.success());
}

#[test]
fn test_provision_rolls_over_write_target() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());

    let output = capstore(dir.path(), &["provision"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("shard-0002"));

    let status = capstore(dir.path(), &["status", "-o", "json"]);
    let registry: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(registry["version"], 2);
    assert_eq!(registry["shards"][0]["role"], "READ_ONLY");
    assert_eq!(registry["shards"][1]["role"], "WRITE_TARGET");

    assert!(capstore(dir.path(), &["replay"]).status.success());
}

#[test]
fn test_status_table_and_text_output() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());

    let table = capstore(dir.path(), &["status"]);
    assert!(table.status.success());
    let text = stdout(&table);
    assert!(text.contains("Registry version 1"));
    assert!(text.contains("LAST CHECKED"));
    assert!(text.contains("│ shard-0001"));
    assert!(text.contains("WRITE_TARGET"));
    // Not a terminal, so no ANSI color codes.
    assert!(!text.contains('\u{1b}'));

    let plain = capstore(dir.path(), &["status", "--output", "text"]);
    assert!(plain.status.success());
    let text = stdout(&plain);
    assert!(text.lines().any(|line| line.starts_with("shard-0001  WRITE_TARGET")));
    assert!(!text.contains('│'));
}

#[test]
fn test_output_format_from_env_and_rejects_unknown() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_capstore"))
        .arg("status")
        .env_remove("CAPSTORE_CONFIG")
        .env("CAPSTORE_DATA_DIR", dir.path().join("shards"))
        .env("CAPSTORE_REGISTRY_PATH", dir.path().join("registry.db"))
        .env("CAPSTORE_OUTPUT", "json")
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute capstore");
    assert!(output.status.success());
    let registry: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(registry["version"], 1);

    let bad = capstore(dir.path(), &["status", "-o", "yaml"]);
    assert!(!bad.status.success());
}

#[test]
fn test_put_json_receipt_and_query_table() {
    let dir = tempfile::tempdir().unwrap();
    assert!(capstore(dir.path(), &["init"]).status.success());

    let put = capstore(
        dir.path(),
        &["-o", "json", "put", "--name", "Grace Hopper", "--email", "grace@example.com"],
    );
    assert!(put.status.success());
    let receipt: serde_json::Value = serde_json::from_str(&stdout(&put)).unwrap();
    assert_eq!(receipt["candidateId"], "CAND-0001");
    assert_eq!(receipt["shardId"], "shard-0001");

    let query = capstore(dir.path(), &["query", "--name", "grace"]);
    assert!(query.status.success());
    let text = stdout(&query);
    assert!(text.contains("CANDIDATE"));
    assert!(text.contains("Grace Hopper"));
    assert!(text.contains("1 record(s)"));
}
