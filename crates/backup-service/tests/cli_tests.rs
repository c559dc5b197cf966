use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// A configuration that needs no database server: discovery off, no core
/// databases, one small directory to back up.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let site = dir.join("site");
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("index.html"), b"<h1>parish</h1>").unwrap();
    let config = serde_json::json!({
        "backup_root": dir.join("backups"),
        "log_file": dir.join("logs/backup.log"),
        "key_file": dir.join("backup.key"),
        "filesystem_targets": [site],
        "database": { "core_databases": [], "discovery_enabled": false },
        "retention": { "max_full_backups": 1 }
    });
    let path = dir.join("backup.json");
    fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

fn cmd(bin: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin).unwrap();
    for var in ["BACKUP_ENGINE_CONFIG", "BACKUP_ROOT", "BACKUP_KEY_FILE", "BACKUP_LOG_FILE"] {
        cmd.env_remove(var);
    }
    cmd
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn engine_requires_a_backup_type() {
    cmd("backup-engine")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn engine_rejects_unknown_backup_type() {
    cmd("backup-engine")
        .arg("weekly")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("weekly"));
}

#[test]
fn help_exits_zero() {
    cmd("backup-engine")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("full"));
}

#[test]
fn broken_config_exits_one() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, "{ nope").unwrap();
    cmd("backup-cleanup")
        .arg("--config")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration"));
}

#[test]
fn cleanup_of_empty_root_succeeds_and_logs() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("backups");
    fs::create_dir_all(&root).unwrap();
    let log = dir.path().join("cleanup.log");

    let output = cmd("backup-cleanup")
        .env("BACKUP_ROOT", &root)
        .env("BACKUP_LOG_FILE", &log)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["success"], true);
    assert_eq!(report["freedBytes"], 0);

    let logged = fs::read_to_string(&log).unwrap();
    assert!(logged.contains("] [INFO] retention cleanup started"));
}

#[test]
fn full_backup_then_list_verify_decrypt_delete() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let output = cmd("backup-engine")
        .arg("full")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report = json_stdout(&output);
    assert_eq!(report["success"], true);
    assert_eq!(report["type"], "full");
    let id = report["id"].as_str().unwrap().to_string();
    let file = report["file"].as_str().unwrap().to_string();

    let listed = json_stdout(
        &cmd("backup-admin")
            .args(["list", "--config"])
            .arg(&config)
            .output()
            .unwrap(),
    );
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["status"], "complete");

    cmd("backup-admin")
        .args(["verify", id.as_str(), "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verified\""));

    let restored = dir.path().join("restored.tar.gz");
    cmd("backup-admin")
        .arg("decrypt")
        .arg(&file)
        .arg(&restored)
        .arg("--config")
        .arg(&config)
        .assert()
        .success();
    let bytes = fs::read(&restored).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b], "gzip magic");

    cmd("backup-admin")
        .args(["delete", id.as_str(), "--config"])
        .arg(&config)
        .assert()
        .success();
    assert!(!Path::new(&file).exists());
}

#[test]
fn differential_request_without_full_reports_full() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let output = cmd("backup-engine")
        .args(["diff", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["type"], "full");
    assert_eq!(report["requestedType"], "diff");
}

#[test]
fn engine_failure_exits_one_with_error() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    fs::create_dir_all(dir.path().join("backup.key")).unwrap();

    let output = cmd("backup-engine")
        .args(["full", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report = json_stdout(&output);
    assert_eq!(report["success"], false);
    assert_eq!(report["errorKind"], "key_access");
}

#[test]
fn admin_rejects_ids_outside_the_root() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    cmd("backup-admin")
        .args(["delete", "../../etc/passwd", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("invalid backup id"));
}

#[test]
fn env_overrides_apply_over_config_file() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let other_root = dir.path().join("elsewhere");

    let output = cmd("backup-engine")
        .args(["full", "--config"])
        .arg(&config)
        .env("BACKUP_ROOT", &other_root)
        .output()
        .unwrap();
    assert!(output.status.success());
    let file = json_stdout(&output)["file"].as_str().unwrap().to_string();
    assert!(Path::new(&file).starts_with(&other_root));
}
