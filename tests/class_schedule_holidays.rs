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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

struct Refs {
    branch_id: String,
    room_id: String,
    teacher_id: String,
}

fn setup_refs(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Refs {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let branch = request_ok(
        stdin,
        reader,
        "setup-2",
        "branches.create",
        json!({ "name": "Downtown" }),
    );
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let room = request_ok(
        stdin,
        reader,
        "setup-3",
        "rooms.create",
        json!({ "branchId": branch_id, "name": "Room A", "capacity": 8 }),
    );
    let room_id = room["roomId"].as_str().expect("roomId").to_string();
    let teacher = request_ok(
        stdin,
        reader,
        "setup-4",
        "teachers.create",
        json!({ "name": "Kim" }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    Refs {
        branch_id,
        room_id,
        teacher_id,
    }
}

#[test]
fn closed_holiday_shifts_session_dates_forward() {
    let workspace = temp_dir("tutorhub-schedule");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let refs = setup_refs(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "holidays.create",
        json!({
            "date": "2024-06-05",
            "name": "Mid-week break",
            "scope": "national",
            "closed": true
        }),
    );

    // The form's end-date autofill agrees with what create commits.
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "1b",
        "classes.previewEndDate",
        json!({
            "branchId": refs.branch_id,
            "weekdays": [1, 3],
            "startDate": "2024-06-03",
            "sessionCount": 4
        }),
    );
    assert_eq!(preview["endDate"].as_str(), Some("2024-06-17"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({
            "name": "Algebra I",
            "branchId": refs.branch_id,
            "roomId": refs.room_id,
            "teacherId": refs.teacher_id,
            "weekdays": [1, 3],
            "startTime": "09:00",
            "endTime": "10:30",
            "startDate": "2024-06-03",
            "sessionCount": 4
        }),
    );
    assert_eq!(
        created["sessionDates"],
        json!(["2024-06-03", "2024-06-10", "2024-06-12", "2024-06-17"])
    );
    assert_eq!(created["endDate"].as_str(), Some("2024-06-17"));

    let class_id = created["classId"].as_str().expect("classId").to_string();
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.get",
        json!({ "classId": class_id }),
    );
    let sessions = detail["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 4);
    for (i, session) in sessions.iter().enumerate() {
        assert_eq!(session["seq"].as_i64(), Some((i + 1) as i64));
        assert_eq!(session["status"].as_str(), Some("scheduled"));
    }
    assert_eq!(sessions[1]["date"].as_str(), Some("2024-06-10"));
}

#[test]
fn start_date_weekday_must_be_in_the_set() {
    let workspace = temp_dir("tutorhub-schedule-badstart");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let refs = setup_refs(&mut stdin, &mut reader, &workspace);

    // 2024-06-04 is a Tuesday; the set is Mon/Wed.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({
            "name": "Geometry",
            "branchId": refs.branch_id,
            "roomId": refs.room_id,
            "teacherId": refs.teacher_id,
            "weekdays": [1, 3],
            "startTime": "09:00",
            "endTime": "10:30",
            "startDate": "2024-06-04",
            "sessionCount": 4
        }),
    );
    assert_eq!(code, "invalid_schedule_input");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({
            "name": "Geometry",
            "branchId": refs.branch_id,
            "roomId": refs.room_id,
            "teacherId": refs.teacher_id,
            "weekdays": [],
            "startTime": "09:00",
            "endTime": "10:30",
            "startDate": "2024-06-03",
            "sessionCount": 4
        }),
    );
    assert_eq!(code, "invalid_schedule_input");
}

#[test]
fn non_closing_and_other_branch_holidays_do_not_block() {
    let workspace = temp_dir("tutorhub-schedule-scopes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let refs = setup_refs(&mut stdin, &mut reader, &workspace);

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "branches.create",
        json!({ "name": "Uptown" }),
    );
    let other_branch = other["branchId"].as_str().expect("branchId").to_string();

    // Informational holiday at our branch, hard closure at the other one.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "holidays.create",
        json!({
            "date": "2024-06-10",
            "name": "Open house",
            "scope": "branch",
            "branchIds": [refs.branch_id],
            "closed": false
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "holidays.create",
        json!({
            "date": "2024-06-17",
            "name": "Uptown maintenance",
            "scope": "branch",
            "branchIds": [other_branch],
            "closed": true
        }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({
            "name": "Writing",
            "branchId": refs.branch_id,
            "roomId": refs.room_id,
            "teacherId": refs.teacher_id,
            "weekdays": [1],
            "startTime": "14:00",
            "endTime": "15:00",
            "startDate": "2024-06-03",
            "sessionCount": 3
        }),
    );
    // Neither holiday closes this branch, so Mondays run uninterrupted.
    assert_eq!(
        created["sessionDates"],
        json!(["2024-06-03", "2024-06-10", "2024-06-17"])
    );
}

#[test]
fn unknown_references_are_reported_distinctly() {
    let workspace = temp_dir("tutorhub-schedule-refs");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let refs = setup_refs(&mut stdin, &mut reader, &workspace);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({
            "name": "Phantom",
            "branchId": refs.branch_id,
            "roomId": "no-such-room",
            "teacherId": refs.teacher_id,
            "weekdays": [1],
            "startTime": "09:00",
            "endTime": "10:00",
            "startDate": "2024-06-03",
            "sessionCount": 2
        }),
    );
    assert_eq!(code, "reference_not_found");
}
