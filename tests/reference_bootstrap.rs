use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_tutorhubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tutorhubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn bootstrap_payload_tracks_reference_writes() {
    let workspace = temp_dir("tutorhub-bootstrap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let branch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "branches.create",
        json!({ "name": "Downtown" }),
    );
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();

    let boot = request_ok(&mut stdin, &mut reader, "3", "reference.bootstrap", json!({}));
    assert_eq!(boot["branches"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(
        boot.pointer("/branches/0/rooms")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // A reference write invalidates the cached payload, so the next
    // bootstrap sees the new room immediately.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "rooms.create",
        json!({ "branchId": branch_id, "name": "Room A", "capacity": 6 }),
    );
    let boot = request_ok(&mut stdin, &mut reader, "5", "reference.bootstrap", json!({}));
    assert_eq!(
        boot.pointer("/branches/0/rooms")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
    assert_eq!(
        boot.pointer("/branches/0/rooms/0/name").and_then(|v| v.as_str()),
        Some("Room A")
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.create",
        json!({ "name": "Kim" }),
    );
    let _ = teacher;
    let boot = request_ok(&mut stdin, &mut reader, "7", "reference.bootstrap", json!({}));
    assert_eq!(boot["teachers"].as_array().map(|a| a.len()), Some(1));
}
