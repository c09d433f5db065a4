use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::availability::{check_availability, AvailabilityQuery, ConflictReason};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, load_bookings, load_closed_dates, optional_bool, optional_str, require_reference,
    required_date, required_str, required_time_range,
};
use crate::ipc::types::{AppState, Request};

const STATUS_PENDING: &str = "pending";
const STATUS_SCHEDULED: &str = "scheduled";
const STATUS_COMPLETED: &str = "completed";
const STATUS_CANCELLED: &str = "cancelled";

fn makeups_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_id = required_str(params, "classId")?;
    let session_id = optional_str(params, "sessionId");

    let conn = db_conn(state)?;
    require_reference(conn, "students", "student", &student_id)?;
    require_reference(conn, "classes", "class", &class_id)?;
    if let Some(sid) = &session_id {
        let owner: Option<String> = conn
            .query_row(
                "SELECT class_id FROM class_sessions WHERE id = ?",
                [sid],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?;
        match owner {
            None => return Err(HandlerErr::new("not_found", "session not found")),
            Some(owner) if owner != class_id => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "session belongs to a different class",
                ))
            }
            Some(_) => {}
        }
    }

    let makeup_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO makeup_sessions(id, student_id, class_id, session_id, status)
         VALUES(?, ?, ?, ?, 'pending')",
        (&makeup_id, &student_id, &class_id, &session_id),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "makeupId": makeup_id, "status": STATUS_PENDING }))
}

/// Place a makeup into a concrete slot. The conflict scan runs inside the
/// write transaction, so a clean check and the status flip are atomic
/// against other local writers. Closed days are refused unless the caller
/// opts in with allowClosedDate.
fn makeups_schedule(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let makeup_id = required_str(params, "makeupId")?;
    let room_id = required_str(params, "roomId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let date = required_date(params, "date")?;
    let time = required_time_range(params)?;
    let allow_closed = optional_bool(params, "allowClosedDate");

    let conn = db_conn(state)?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM makeup_sessions WHERE id = ?",
            [&makeup_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(status) = status else {
        return Err(HandlerErr::new("not_found", "makeup not found"));
    };
    if status != STATUS_PENDING && status != STATUS_SCHEDULED {
        return Err(HandlerErr::new(
            "bad_params",
            format!("cannot place a {} makeup", status),
        ));
    }

    require_reference(conn, "teachers", "teacher", &teacher_id)?;
    let branch_id: Option<String> = conn
        .query_row("SELECT branch_id FROM rooms WHERE id = ?", [&room_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(branch_id) = branch_id else {
        return Err(HandlerErr::new(
            "reference_not_found",
            format!("unknown room: {}", room_id),
        ));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let query = AvailabilityQuery::single_date(
        branch_id.clone(),
        room_id.clone(),
        teacher_id.clone(),
        date,
        time,
        Some(makeup_id.clone()),
    );
    let closed = load_closed_dates(&tx, &branch_id, date, date + chrono::Duration::days(1))?;
    let bookings = load_bookings(&tx, &room_id, &teacher_id, date, date)?;
    let result = check_availability(&query, &closed, &bookings);

    let has_holiday = result
        .conflicts
        .iter()
        .any(|c| matches!(c, ConflictReason::Holiday { .. }));
    if !result.available || (has_holiday && !allow_closed) {
        let _ = tx.rollback();
        let message = if !result.available {
            "room or teacher is already booked in this time window"
        } else {
            "date falls on a closed day; pass allowClosedDate to override"
        };
        return Err(HandlerErr::with_details(
            "conflict_detected",
            message,
            json!({ "conflicts": result.conflicts }),
        ));
    }

    tx.execute(
        "UPDATE makeup_sessions
         SET branch_id = ?, room_id = ?, teacher_id = ?, date = ?, start_time = ?, end_time = ?,
             status = 'scheduled'
         WHERE id = ?",
        (
            &branch_id,
            &room_id,
            &teacher_id,
            date.to_string(),
            time.start.format("%H:%M").to_string(),
            time.end.format("%H:%M").to_string(),
            &makeup_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "makeupId": makeup_id,
        "status": STATUS_SCHEDULED,
        "branchId": branch_id,
        "date": date.to_string(),
    }))
}

fn transition_status(
    state: &AppState,
    params: &serde_json::Value,
    allowed_from: &[&str],
    to: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let makeup_id = required_str(params, "makeupId")?;
    let conn = db_conn(state)?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM makeup_sessions WHERE id = ?",
            [&makeup_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(status) = status else {
        return Err(HandlerErr::new("not_found", "makeup not found"));
    };
    if !allowed_from.contains(&status.as_str()) {
        return Err(HandlerErr::new(
            "bad_params",
            format!("cannot move a {} makeup to {}", status, to),
        ));
    }
    conn.execute(
        "UPDATE makeup_sessions SET status = ? WHERE id = ?",
        (to, &makeup_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "makeupId": makeup_id, "status": to }))
}

fn makeups_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = optional_str(params, "classId");
    let student_id = optional_str(params, "studentId");

    let mut sql = String::from(
        "SELECT id, student_id, class_id, session_id, branch_id, room_id, teacher_id,
                date, start_time, end_time, status
         FROM makeup_sessions",
    );
    let mut clauses = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(c) = class_id {
        clauses.push("class_id = ?");
        args.push(c);
    }
    if let Some(s) = student_id {
        clauses.push("student_id = ?");
        args.push(s);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY date IS NULL, date");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let makeups = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "sessionId": r.get::<_, Option<String>>(3)?,
                "branchId": r.get::<_, Option<String>>(4)?,
                "roomId": r.get::<_, Option<String>>(5)?,
                "teacherId": r.get::<_, Option<String>>(6)?,
                "date": r.get::<_, Option<String>>(7)?,
                "startTime": r.get::<_, Option<String>>(8)?,
                "endTime": r.get::<_, Option<String>>(9)?,
                "status": r.get::<_, String>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "makeups": makeups }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "makeups.create" => makeups_create(state, &req.params),
        "makeups.schedule" => makeups_schedule(state, &req.params),
        "makeups.complete" => {
            transition_status(state, &req.params, &[STATUS_SCHEDULED], STATUS_COMPLETED)
        }
        "makeups.cancel" => transition_status(
            state,
            &req.params,
            &[STATUS_PENDING, STATUS_SCHEDULED],
            STATUS_CANCELLED,
        ),
        "makeups.list" => makeups_list(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
