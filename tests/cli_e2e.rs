//! End-to-end CLI tests for the bulkdl binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bulkdl() -> Command {
    Command::cargo_bin("bulkdl").unwrap()
}

/// Mounts a one-file item on the mock archive.
async fn mount_item(server: &MockServer, identifier: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/metadata/{identifier}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [{"name": "content.bin", "size": body.len()}],
            "item_size": body.len(),
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/download/{identifier}/content.bin")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

#[test]
fn test_binary_help_displays_usage() {
    bulkdl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bulk download engine"));
}

#[test]
fn test_binary_version_displays_version() {
    bulkdl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bulkdl"));
}

#[test]
fn test_binary_without_identifiers_errors() {
    bulkdl()
        .assert()
        .failure()
        .stderr(predicate::str::contains("no identifiers"));
}

#[test]
fn test_status_without_joblog_flag_errors() {
    bulkdl()
        .arg("--status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--status requires --joblog"));
}

#[test]
fn test_status_with_missing_joblog_exits_one() {
    let dir = TempDir::new().unwrap();
    let assert = bulkdl()
        .arg("--status")
        .arg("--joblog")
        .arg(dir.path().join("nope.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("job log not found"));
    assert_eq!(assert.get_output().status.code(), Some(1));
}

#[test]
fn test_status_summarizes_a_seeded_joblog() {
    let dir = TempDir::new().unwrap();
    let joblog = dir.path().join("job.jsonl");
    std::fs::write(
        &joblog,
        concat!(
            "{\"ts\":\"2024-05-01T10:00:00Z\",\"id\":\"done\",\"op\":\"download\",\"event\":\"completed\",\"destdir\":\"/d\",\"bytes_transferred\":2048,\"files_ok\":2,\"files_skipped\":0,\"files_failed\":0,\"elapsed\":1.0}\n",
            "{\"ts\":\"2024-05-01T10:00:01Z\",\"id\":\"broken\",\"op\":\"download\",\"event\":\"failed\",\"error\":\"HTTP 500\",\"retries_left\":0}\n",
        ),
    )
    .unwrap();

    bulkdl()
        .arg("--status")
        .arg("--joblog")
        .arg(&joblog)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"))
        .stdout(predicate::str::contains("failed:    1"))
        .stdout(predicate::str::contains("bytes:     2048"))
        .stdout(predicate::str::contains("broken: HTTP 500"));
}

#[tokio::test]
async fn test_full_download_run_then_status() {
    let server = MockServer::start().await;
    mount_item(&server, "item-one", b"hello-archive").await;

    let destdir = TempDir::new().unwrap();
    let joblog = destdir.path().join("job.jsonl");

    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("item-one")
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(&joblog)
        .arg("--no-disk-check")
        .assert()
        .success()
        .stderr(predicate::str::contains("item-one"));

    let payload = destdir.path().join("item-one/content.bin");
    assert_eq!(std::fs::read(payload).unwrap(), b"hello-archive");

    bulkdl()
        .arg("--status")
        .arg("--joblog")
        .arg(&joblog)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"))
        .stdout(predicate::str::contains("bytes:     13"));
}

#[tokio::test]
async fn test_rerun_resumes_and_skips() {
    let server = MockServer::start().await;
    mount_item(&server, "item-one", b"data").await;

    let destdir = TempDir::new().unwrap();
    let joblog = destdir.path().join("job.jsonl");

    for _ in 0..2 {
        bulkdl()
            .env("BULKDL_BASE_URL", server.uri())
            .arg("item-one")
            .arg("--destdir")
            .arg(destdir.path())
            .arg("--joblog")
            .arg(&joblog)
            .arg("--no-disk-check")
            .assert()
            .success();
    }

    // One completed record total; the second run only skipped.
    let contents = std::fs::read_to_string(&joblog).unwrap();
    let completed = contents
        .lines()
        .filter(|l| l.contains("\"event\":\"completed\""))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_failed_item_yields_exit_code_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let destdir = TempDir::new().unwrap();
    let assert = bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("broken")
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(destdir.path().join("job.jsonl"))
        .arg("--no-disk-check")
        .arg("-q")
        .assert()
        .failure();
    assert_eq!(assert.get_output().status.code(), Some(1));
}

#[tokio::test]
async fn test_itemlist_file_feeds_the_run() {
    let server = MockServer::start().await;
    mount_item(&server, "from-file", b"x").await;

    let destdir = TempDir::new().unwrap();
    let itemlist = destdir.path().join("ids.txt");
    std::fs::write(&itemlist, "from-file\n").unwrap();

    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("--itemlist")
        .arg(&itemlist)
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(destdir.path().join("job.jsonl"))
        .arg("--no-disk-check")
        .assert()
        .success();

    assert!(destdir.path().join("from-file/content.bin").exists());
}

#[tokio::test]
async fn test_stdin_identifiers_with_dash() {
    let server = MockServer::start().await;
    mount_item(&server, "piped-item", b"x").await;

    let destdir = TempDir::new().unwrap();
    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("-")
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(destdir.path().join("job.jsonl"))
        .arg("--no-disk-check")
        .write_stdin("piped-item\n")
        .assert()
        .success();

    assert!(destdir.path().join("piped-item/content.bin").exists());
}

#[tokio::test]
async fn test_dry_run_writes_no_files() {
    let server = MockServer::start().await;
    mount_item(&server, "item-one", b"data").await;

    let destdir = TempDir::new().unwrap();
    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("item-one")
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(destdir.path().join("job.jsonl"))
        .arg("--no-disk-check")
        .arg("--dry-run")
        .assert()
        .success();

    assert!(!destdir.path().join("item-one").exists());
}

#[tokio::test]
async fn test_verify_flags_missing_files() {
    let server = MockServer::start().await;
    mount_item(&server, "item-one", b"data").await;

    let destdir = TempDir::new().unwrap();
    let joblog = destdir.path().join("job.jsonl");

    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("item-one")
        .arg("--destdir")
        .arg(destdir.path())
        .arg("--joblog")
        .arg(&joblog)
        .arg("--no-disk-check")
        .assert()
        .success();

    // Intact: verify passes.
    bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("--verify")
        .arg("--joblog")
        .arg(&joblog)
        .arg("--destdir")
        .arg(destdir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 OK, 0 incomplete"));

    // Damaged: verify exits 1 and names the missing file.
    std::fs::remove_file(destdir.path().join("item-one/content.bin")).unwrap();
    let assert = bulkdl()
        .env("BULKDL_BASE_URL", server.uri())
        .arg("--verify")
        .arg("--joblog")
        .arg(&joblog)
        .arg("--destdir")
        .arg(destdir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "item-one: INCOMPLETE (0/1) missing: content.bin",
        ));
    assert_eq!(assert.get_output().status.code(), Some(1));
}
