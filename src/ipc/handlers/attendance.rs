use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, reference_exists, require_reference, required_str};
use crate::ipc::types::{AppState, Request};

const STATUS_HELD: &str = "held";
const STATUS_CANCELLED: &str = "cancelled";

fn validate_session_status(status: &str) -> bool {
    // attendance.record moves a session out of the scheduled state.
    matches!(status, STATUS_HELD | STATUS_CANCELLED)
}

fn sessions_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let conn = db_conn(state)?;
    if !reference_exists(conn, "classes", &class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let mut absences: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT a.session_id, a.student_id
             FROM session_absences a
             JOIN class_sessions s ON s.id = a.session_id
             WHERE s.class_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let pairs = stmt
        .query_map([&class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (session_id, student_id) in pairs {
        absences.entry(session_id).or_default().push(student_id);
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, seq, date, status, actual_teacher_id
             FROM class_sessions WHERE class_id = ? ORDER BY seq",
        )
        .map_err(HandlerErr::db)?;
    let raw = stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let sessions: Vec<serde_json::Value> = raw
        .into_iter()
        .map(|(id, seq, date, status, actual_teacher)| {
            let absent = absences.remove(&id).unwrap_or_default();
            json!({
                "id": id,
                "seq": seq,
                "date": date,
                "status": status,
                "actualTeacherId": actual_teacher,
                "absentStudentIds": absent,
            })
        })
        .collect();
    Ok(json!({ "sessions": sessions }))
}

/// Records what actually happened in a session. Once recorded, the session
/// is frozen: bulk rescheduling never regenerates it.
fn attendance_record(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    let status = required_str(params, "status")?;
    if !validate_session_status(&status) {
        return Err(HandlerErr::new(
            "bad_params",
            format!("status must be {} or {}", STATUS_HELD, STATUS_CANCELLED),
        ));
    }
    let actual_teacher_id = optional_str(params, "actualTeacherId");
    let absent_ids: Vec<String> = params
        .get("absentStudentIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let conn = db_conn(state)?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "session not found"));
    }
    if let Some(t) = &actual_teacher_id {
        require_reference(conn, "teachers", "teacher", t)?;
    }
    for student_id in &absent_ids {
        require_reference(conn, "students", "student", student_id)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE class_sessions
         SET status = ?, actual_teacher_id = COALESCE(?, actual_teacher_id)
         WHERE id = ?",
        (&status, &actual_teacher_id, &session_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM session_absences WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    for student_id in &absent_ids {
        tx.execute(
            "INSERT INTO session_absences(session_id, student_id) VALUES(?, ?)",
            (&session_id, student_id),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "sessionId": session_id, "status": status }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sessions.list" => sessions_list(state, &req.params),
        "attendance.record" => attendance_record(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
