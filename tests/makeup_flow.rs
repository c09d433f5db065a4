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

fn request(
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
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
}

struct World {
    branch_id: String,
    room1_id: String,
    room2_id: String,
    teacher2_id: String,
    student_id: String,
    class_id: String,
    first_session_id: String,
}

/// A class in room1 with teacher1 (Mondays 09:00-10:30, 06-03 and 06-10),
/// one enrolled student marked absent from the first session.
fn setup_world(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> World {
    let _ = request_ok(
        stdin,
        reader,
        "w-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let branch = request_ok(stdin, reader, "w-2", "branches.create", json!({ "name": "Downtown" }));
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let room1 = request_ok(
        stdin,
        reader,
        "w-3",
        "rooms.create",
        json!({ "branchId": branch_id, "name": "Room A" }),
    );
    let room2 = request_ok(
        stdin,
        reader,
        "w-4",
        "rooms.create",
        json!({ "branchId": branch_id, "name": "Room B" }),
    );
    let teacher1 = request_ok(stdin, reader, "w-5", "teachers.create", json!({ "name": "Kim" }));
    let teacher2 = request_ok(stdin, reader, "w-6", "teachers.create", json!({ "name": "Lee" }));
    let student = request_ok(
        stdin,
        reader,
        "w-7",
        "students.create",
        json!({ "branchId": branch_id, "name": "Park Minjun" }),
    );

    let room1_id = room1["roomId"].as_str().expect("roomId").to_string();
    let room2_id = room2["roomId"].as_str().expect("roomId").to_string();
    let teacher1_id = teacher1["teacherId"].as_str().expect("teacherId").to_string();
    let teacher2_id = teacher2["teacherId"].as_str().expect("teacherId").to_string();
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let class = request_ok(
        stdin,
        reader,
        "w-8",
        "classes.create",
        json!({
            "name": "Algebra I",
            "branchId": branch_id,
            "roomId": room1_id,
            "teacherId": teacher1_id,
            "weekdays": [1],
            "startTime": "09:00",
            "endTime": "10:30",
            "startDate": "2024-06-03",
            "sessionCount": 2
        }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let detail = request_ok(stdin, reader, "w-9", "classes.get", json!({ "classId": class_id }));
    let first_session_id = detail["sessions"][0]["id"]
        .as_str()
        .expect("session id")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "w-10",
        "attendance.record",
        json!({
            "sessionId": first_session_id,
            "status": "held",
            "absentStudentIds": [student_id]
        }),
    );

    World {
        branch_id,
        room1_id,
        room2_id,
        teacher2_id,
        student_id,
        class_id,
        first_session_id,
    }
}

#[test]
fn makeup_placement_checks_conflicts_and_walks_the_lifecycle() {
    let workspace = temp_dir("tutorhub-makeup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let w = setup_world(&mut stdin, &mut reader, &workspace);

    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sessions.list",
        json!({ "classId": w.class_id }),
    );
    assert_eq!(
        sessions["sessions"][0]["absentStudentIds"],
        json!([w.student_id])
    );

    let makeup = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "makeups.create",
        json!({
            "studentId": w.student_id,
            "classId": w.class_id,
            "sessionId": w.first_session_id
        }),
    );
    let makeup_id = makeup["makeupId"].as_str().expect("makeupId").to_string();
    assert_eq!(makeup["status"].as_str(), Some("pending"));

    // Room1 hosts the regular session on 06-10; an overlapping placement is
    // refused at commit time.
    let value = request(
        &mut stdin,
        &mut reader,
        "3",
        "makeups.schedule",
        json!({
            "makeupId": makeup_id,
            "roomId": w.room1_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-10",
            "startTime": "09:30",
            "endTime": "10:30"
        }),
    );
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&value), "conflict_detected");

    // Same day in the free room works.
    let placed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "makeups.schedule",
        json!({
            "makeupId": makeup_id,
            "roomId": w.room2_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-10",
            "startTime": "09:00",
            "endTime": "10:00"
        }),
    );
    assert_eq!(placed["status"].as_str(), Some("scheduled"));
    assert_eq!(placed["branchId"].as_str(), Some(w.branch_id.as_str()));

    // The scheduled makeup now occupies room2.
    let probe = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "availability.check",
        json!({
            "branchId": w.branch_id,
            "roomId": w.room2_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-10",
            "startTime": "09:30",
            "endTime": "10:30"
        }),
    );
    assert_eq!(probe["available"].as_bool(), Some(false));

    // ...but its own edit-in-place probe self-excludes.
    let probe = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "availability.check",
        json!({
            "branchId": w.branch_id,
            "roomId": w.room2_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-10",
            "startTime": "09:00",
            "endTime": "10:00",
            "excludeId": makeup_id
        }),
    );
    assert_eq!(probe["available"].as_bool(), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "holidays.create",
        json!({
            "date": "2024-06-20",
            "name": "Founders day",
            "scope": "national",
            "closed": true
        }),
    );

    // Re-placing onto a closed day needs the explicit opt-in.
    let value = request(
        &mut stdin,
        &mut reader,
        "8",
        "makeups.schedule",
        json!({
            "makeupId": makeup_id,
            "roomId": w.room2_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-20",
            "startTime": "09:00",
            "endTime": "10:00"
        }),
    );
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&value), "conflict_detected");

    let placed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "makeups.schedule",
        json!({
            "makeupId": makeup_id,
            "roomId": w.room2_id,
            "teacherId": w.teacher2_id,
            "date": "2024-06-20",
            "startTime": "09:00",
            "endTime": "10:00",
            "allowClosedDate": true
        }),
    );
    assert_eq!(placed["date"].as_str(), Some("2024-06-20"));

    let done = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "makeups.complete",
        json!({ "makeupId": makeup_id }),
    );
    assert_eq!(done["status"].as_str(), Some("completed"));

    // Completed makeups are terminal.
    let value = request(
        &mut stdin,
        &mut reader,
        "11",
        "makeups.cancel",
        json!({ "makeupId": makeup_id }),
    );
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&value), "bad_params");

    // A fresh pending makeup can be cancelled directly.
    let makeup = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "makeups.create",
        json!({ "studentId": w.student_id, "classId": w.class_id }),
    );
    let second_id = makeup["makeupId"].as_str().expect("makeupId").to_string();
    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "makeups.cancel",
        json!({ "makeupId": second_id }),
    );
    assert_eq!(cancelled["status"].as_str(), Some("cancelled"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "makeups.list",
        json!({ "studentId": w.student_id }),
    );
    assert_eq!(listed["makeups"].as_array().map(|a| a.len()), Some(2));
}

#[test]
fn completing_an_unscheduled_makeup_is_rejected() {
    let workspace = temp_dir("tutorhub-makeup-states");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let w = setup_world(&mut stdin, &mut reader, &workspace);

    let makeup = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "makeups.create",
        json!({ "studentId": w.student_id, "classId": w.class_id }),
    );
    let makeup_id = makeup["makeupId"].as_str().expect("makeupId");

    let value = request(
        &mut stdin,
        &mut reader,
        "2",
        "makeups.complete",
        json!({ "makeupId": makeup_id }),
    );
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&value), "bad_params");
}
