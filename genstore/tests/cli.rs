use assert_cmd::Command;
use genstore_core::Hash;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn genstore(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("genstore").unwrap();
    cmd.arg("--root").arg(root).env_remove("GENSTORE_ROOT");
    cmd
}

fn json(root: &Path, args: &[&str]) -> serde_json::Value {
    let output = genstore(root).arg("--json").args(args).output().unwrap();
    assert!(
        output.status.success(),
        "{:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn init(temp_dir: &TempDir) -> std::path::PathBuf {
    let root = temp_dir.path().join("store");
    genstore(&root)
        .args(["init", "--keep-last", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized genstore"));
    root
}

fn write_manifest(dir: &Path, name: &str, motd: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let manifest = serde_json::json!({
        "packages": [],
        "files": [{"target": "/etc/motd", "content": {"inline": motd}}]
    });
    fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
    path
}

#[test]
fn test_init_twice_fails() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    genstore(&root).arg("init").assert().failure();
}

#[test]
fn test_ingest_cat_query() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let file = temp_dir.path().join("hello.txt");
    fs::write(&file, "hello world\n").unwrap();

    let out = json(&root, &["ingest", file.to_str().unwrap()]);
    assert_eq!(out["success"], true);
    let hash = out["objects"][0]["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 64);

    genstore(&root)
        .args(["cat", &hash])
        .assert()
        .success()
        .stdout("hello world\n");

    let query = json(&root, &["query", &hash]);
    assert_eq!(query["kind"], "file");
    assert_eq!(query["size"], 12);
    assert_eq!(query["refcount"], 1);
}

#[test]
fn test_ingest_from_stdin() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);

    genstore(&root)
        .args(["ingest", "-"])
        .write_stdin("piped")
        .assert()
        .success()
        .stdout(predicate::str::contains(Hash::hash_bytes(b"piped").to_hex()));
}

#[test]
fn test_stats_reports_dedup_savings() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let file = temp_dir.path().join("dup.txt");
    fs::write(&file, "0123456789").unwrap();
    json(&root, &["ingest", file.to_str().unwrap()]);
    json(&root, &["ingest", file.to_str().unwrap()]);

    let stats = json(&root, &["stats"]);
    assert_eq!(stats["success"], true);
    assert_eq!(stats["objects"], 1);
    assert_eq!(stats["total_bytes"], 10);
    assert_eq!(stats["dedup_savings_bytes"], 10);

    genstore(&root)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved by deduplication: 10 bytes"));
}

#[test]
fn test_unknown_object() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let missing = "0".repeat(64);

    genstore(&root)
        .args(["query", &missing])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Object not found"));

    genstore(&root)
        .args(["cat", "not-a-hash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid hash"));
}

#[test]
fn test_build_switch_rollback_gc() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);

    let first = write_manifest(temp_dir.path(), "one.json", "first\n");
    let second = write_manifest(temp_dir.path(), "two.json", "second\n");

    let built = json(&root, &["build", first.to_str().unwrap(), "--switch"]);
    let g1 = built["generation"].as_u64().unwrap();
    assert_eq!(built["activated"], true);

    let built = json(&root, &["build", second.to_str().unwrap(), "--switch"]);
    let g2 = built["generation"].as_u64().unwrap();
    assert!(g2 > g1);

    let listed = json(&root, &["generations"]);
    let generations = listed["generations"].as_array().unwrap();
    assert_eq!(generations.len(), 2);
    assert_eq!(generations[0]["id"].as_u64().unwrap(), g2);
    assert_eq!(generations[0]["active"], true);

    let rolled = json(&root, &["rollback"]);
    assert_eq!(rolled["active"].as_u64().unwrap(), g1);
    assert_eq!(rolled["previous"].as_u64().unwrap(), g2);

    // The active generation is outside the window but still kept.
    let report = json(&root, &["gc"]);
    assert!(report["generations_collected"].as_array().unwrap().is_empty());

    genstore(&root)
        .args(["delete-generation", &g1.to_string()])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Retention violation"));

    json(&root, &["switch", &g2.to_string()]);
    let report = json(&root, &["gc"]);
    assert_eq!(report["generations_collected"][0].as_u64().unwrap(), g1);
    assert!(report["objects_collected"].as_u64().unwrap() >= 1);

    genstore(&root)
        .args(["rollback"])
        .assert()
        .code(6);
}

#[test]
fn test_pin_and_verify() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let manifest = write_manifest(temp_dir.path(), "m.json", "pinned\n");

    let built = json(&root, &["build", manifest.to_str().unwrap()]);
    let id = built["generation"].as_u64().unwrap().to_string();

    genstore(&root)
        .args(["pin", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pinned generation"));
    genstore(&root)
        .args(["verify", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("intact"));
    genstore(&root).args(["pin", "999"]).assert().code(2);
}

#[test]
fn test_invalid_manifest() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let path = temp_dir.path().join("bad.json");
    fs::write(&path, r#"{"files": [{"target": "relative", "content": {"inline": ""}}]}"#).unwrap();

    genstore(&root)
        .args(["--json", "build", path.to_str().unwrap()])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("\"success\": false"));
}

#[test]
fn test_gc_dry_run_keeps_objects() {
    let temp_dir = TempDir::new().unwrap();
    let root = init(&temp_dir);
    let file = temp_dir.path().join("loose");
    fs::write(&file, "loose").unwrap();
    let out = json(&root, &["ingest", file.to_str().unwrap()]);
    let hash = out["objects"][0]["hash"].as_str().unwrap().to_string();

    genstore(&root)
        .args(["gc", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would delete 1 objects"));
    genstore(&root).args(["cat", &hash]).assert().success();

    genstore(&root).arg("gc").assert().success();
    genstore(&root).args(["cat", &hash]).assert().code(2);
}
