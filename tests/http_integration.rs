//! Purpose: End-to-end tests for the HTTP export routes.
//! Exports: None (integration test module).
//! Role: Validate dump/page/count responses and persisted chunk files over TCP.
//! Invariants: Uses a loopback-only server with a temp database and temp output dirs.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use rusqlite::Connection;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

struct TestServer {
    child: Child,
    base_url: String,
    chunks_dir: PathBuf,
    paginated_dir: PathBuf,
}

impl TestServer {
    fn start(root: &Path, extra_args: &[&str]) -> TestResult<Self> {
        Self::start_with_table(root, "large_table", extra_args)
    }

    fn start_with_table(root: &Path, table: &str, extra_args: &[&str]) -> TestResult<Self> {
        let port = pick_port()?;
        let bind = format!("127.0.0.1:{port}");
        let chunks_dir = root.join("chunks");
        let paginated_dir = root.join("chunks_paginated");

        let child = Command::new(env!("CARGO_BIN_EXE_tablestream"))
            .arg("--database")
            .arg(root.join("bulk.db"))
            .arg("--table")
            .arg(table)
            .arg("serve")
            .arg("--bind")
            .arg(&bind)
            .arg("--chunks-dir")
            .arg(&chunks_dir)
            .arg("--paginated-dir")
            .arg(&paginated_dir)
            .args(extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let server = Self {
            child,
            base_url: format!("http://{bind}"),
            chunks_dir,
            paginated_dir,
        };
        server.wait_ready()?;
        Ok(server)
    }

    fn wait_ready(&self) -> TestResult<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if ureq::get(&format!("{}/healthz", self.base_url))
                .call()
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(50));
        }
        Err("server did not become ready".into())
    }

    fn get(&self, path: &str) -> TestResult<(u16, String, String)> {
        let url = format!("{}{}", self.base_url, path);
        let response = match ureq::get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(err.into()),
        };
        let status = response.status();
        let content_type = response.header("content-type").unwrap_or_default().to_string();
        let body = response.into_string()?;
        Ok((status, content_type, body))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn seed_database(root: &Path, rows: i64) -> TestResult<()> {
    let mut conn = Connection::open(root.join("bulk.db"))?;
    conn.execute_batch(
        "CREATE TABLE large_table (id INTEGER PRIMARY KEY, name TEXT, score REAL, payload BLOB)",
    )?;
    let tx = conn.transaction()?;
    for id in 1..=rows {
        tx.execute(
            "INSERT INTO large_table (id, name, score, payload) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![id, format!("name-{id}"), id as f64 / 2.0],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn parse_lines(body: &str) -> Vec<Value> {
    assert!(body.is_empty() || body.ends_with('\n'), "body must end with newline");
    body.lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn ids(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .expect("array")
        .iter()
        .map(|record| record["id"].as_i64().expect("id"))
        .collect()
}

fn file_names(dir: &Path) -> BTreeSet<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

fn read_json(path: &Path) -> Value {
    let text = std::fs::read_to_string(path).expect("read chunk file");
    serde_json::from_str(&text).expect("chunk file json")
}

#[test]
fn bulk_data_streams_chunks_and_persists_files() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 5)?;
    let server = TestServer::start(temp.path(), &["--dump-chunk-size", "2"])?;

    let (status, content_type, body) = server.get("/bulk-data")?;
    assert_eq!(status, 200);
    assert!(content_type.starts_with("application/json"));
    let lines = parse_lines(&body);
    let sizes: Vec<_> = lines.iter().map(|line| ids(line).len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    let all: Vec<_> = lines.iter().flat_map(ids).collect();
    assert_eq!(all, vec![1, 2, 3, 4, 5]);
    assert_eq!(lines[0][0], json!({"id": 1, "name": "name-1", "score": 0.5, "payload": null}));

    assert_eq!(
        file_names(&server.chunks_dir),
        BTreeSet::from([
            "part_1.json".to_string(),
            "part_2.json".to_string(),
            "part_3.json".to_string(),
        ])
    );
    for (idx, line) in lines.iter().enumerate() {
        let on_disk = read_json(&server.chunks_dir.join(format!("part_{}.json", idx + 1)));
        assert_eq!(&on_disk, line);
    }
    Ok(())
}

#[test]
fn bulk_data_uses_default_chunk_size() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 2500)?;
    let server = TestServer::start(temp.path(), &[])?;

    let (status, _, body) = server.get("/bulk-data")?;
    assert_eq!(status, 200);
    let lines = parse_lines(&body);
    let sizes: Vec<_> = lines.iter().map(|line| ids(line).len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    let last = read_json(&server.chunks_dir.join("part_3.json"));
    assert_eq!(ids(&last).first(), Some(&2001));
    assert_eq!(ids(&last).last(), Some(&2500));
    Ok(())
}

#[test]
fn bulk_data_honors_dump_limit() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 9)?;
    let server = TestServer::start(
        temp.path(),
        &["--dump-chunk-size", "4", "--dump-limit", "6"],
    )?;

    let (status, _, body) = server.get("/bulk-data")?;
    assert_eq!(status, 200);
    let all: Vec<_> = parse_lines(&body).iter().flat_map(ids).collect();
    assert_eq!(all, vec![1, 2, 3, 4, 5, 6]);

    let (_, _, body) = server.get("/count-records")?;
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"total_records": 9}));
    Ok(())
}

#[test]
fn bulk_data_on_empty_table_is_empty_body() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 0)?;
    let server = TestServer::start(temp.path(), &[])?;

    let (status, _, body) = server.get("/bulk-data")?;
    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert!(file_names(&server.chunks_dir).is_empty());
    Ok(())
}

#[test]
fn paginated_pages_match_offsets() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 5)?;
    let server = TestServer::start(temp.path(), &[])?;

    let (status, content_type, body) = server.get("/bulk-data-paginated?page=2&chunk_size=2")?;
    assert_eq!(status, 200);
    assert!(content_type.starts_with("application/json"));
    let lines = parse_lines(&body);
    assert_eq!(lines.len(), 1);
    assert_eq!(ids(&lines[0]), vec![3, 4]);

    let (_, _, body) = server.get("/bulk-data-paginated?page=3&chunk_size=2")?;
    let lines = parse_lines(&body);
    assert_eq!(ids(&lines[0]), vec![5]);
    assert_eq!(read_json(&server.paginated_dir.join("part_1.json")), lines[0]);
    assert_eq!(
        file_names(&server.paginated_dir),
        BTreeSet::from(["part_1.json".to_string()])
    );

    let (status, _, body) = server.get("/bulk-data-paginated?page=4&chunk_size=2")?;
    assert_eq!(status, 200);
    assert_eq!(
        parse_lines(&body),
        vec![json!({"message": "No more data available"})]
    );

    let (_, _, body) = server.get("/bulk-data-paginated")?;
    assert_eq!(ids(&parse_lines(&body)[0]), vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn paginated_rejects_non_positive_params() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 3)?;
    let server = TestServer::start(temp.path(), &[])?;

    for query in ["page=0", "chunk_size=0", "page=-2&chunk_size=5"] {
        let (status, _, body) = server.get(&format!("/bulk-data-paginated?{query}"))?;
        assert_eq!(status, 400, "query {query}");
        let value: Value = serde_json::from_str(&body)?;
        assert_eq!(
            value["error"]["message"],
            "Page and chunk_size must be greater than 0"
        );
    }

    let (status, _, _) = server.get("/bulk-data-paginated?page=abc")?;
    assert_eq!(status, 400);
    assert!(file_names(&server.paginated_dir).is_empty());
    Ok(())
}

#[test]
fn missing_table_is_server_error() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 2)?;
    let server = TestServer::start_with_table(temp.path(), "absent_table", &[])?;

    for path in ["/count-records", "/bulk-data", "/bulk-data-paginated?page=1"] {
        let (status, _, body) = server.get(path)?;
        assert_eq!(status, 500, "path {path}");
        let value: Value = serde_json::from_str(&body)?;
        assert_eq!(value["error"]["kind"], "Store");
    }
    Ok(())
}

#[test]
fn count_records_reports_total() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    seed_database(temp.path(), 42)?;
    let server = TestServer::start(temp.path(), &[])?;

    let (status, content_type, body) = server.get("/count-records")?;
    assert_eq!(status, 200);
    assert!(content_type.starts_with("application/json"));
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"total_records": 42}));
    Ok(())
}
