use chrono::Duration;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::availability::{check_availability, AvailabilityQuery};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, load_bookings, load_closed_dates, require_reference, required_date, required_str,
    required_time_range, required_u32, required_weekday_set, schedule_with_widening, weekday_csv,
    weekday_set_from_csv,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{compute_end_date, compute_schedule};

fn classes_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let branch_id = required_str(params, "branchId")?;
    let room_id = required_str(params, "roomId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let weekdays = required_weekday_set(params, "weekdays")?;
    let time = required_time_range(params)?;
    let start_date = required_date(params, "startDate")?;
    let session_count = required_u32(params, "sessionCount")?;

    let conn = db_conn(state)?;
    require_reference(conn, "branches", "branch", &branch_id)?;
    require_reference(conn, "teachers", "teacher", &teacher_id)?;
    let room_branch: Option<String> = conn
        .query_row("SELECT branch_id FROM rooms WHERE id = ?", [&room_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(room_branch) = room_branch else {
        return Err(HandlerErr::new(
            "reference_not_found",
            format!("unknown room: {}", room_id),
        ));
    };
    if room_branch != branch_id {
        return Err(HandlerErr::new(
            "bad_params",
            "room belongs to a different branch",
        ));
    }

    let dates = schedule_with_widening(conn, &branch_id, start_date, |closed| {
        compute_schedule(start_date, &weekdays, session_count, closed)
    })?;
    let end_date = dates
        .last()
        .copied()
        .ok_or_else(|| HandlerErr::new("db_query_failed", "empty schedule"))?;

    // Advisory check over the full recurrence before committing anything.
    let query = AvailabilityQuery {
        branch_id: branch_id.clone(),
        room_id: room_id.clone(),
        teacher_id: teacher_id.clone(),
        weekdays: weekdays.clone(),
        date_from: start_date,
        date_to: end_date,
        time,
        exclude_id: None,
    };
    let closed = load_closed_dates(conn, &branch_id, start_date, end_date + Duration::days(1))?;
    let bookings = load_bookings(conn, &room_id, &teacher_id, start_date, end_date)?;
    let result = check_availability(&query, &closed, &bookings);
    if !result.available {
        return Err(HandlerErr::with_details(
            "conflict_detected",
            "room or teacher is already booked in this time window",
            json!({ "conflicts": result.conflicts }),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let class_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO classes(id, branch_id, room_id, teacher_id, name, weekdays,
                             start_time, end_time, start_date, session_count, end_date, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &class_id,
            &branch_id,
            &room_id,
            &teacher_id,
            &name,
            weekday_csv(&weekdays),
            time.start.format("%H:%M").to_string(),
            time.end.format("%H:%M").to_string(),
            start_date.to_string(),
            i64::from(session_count),
            end_date.to_string(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    for (i, date) in dates.iter().enumerate() {
        tx.execute(
            "INSERT INTO class_sessions(id, class_id, seq, date, status)
             VALUES(?, ?, ?, ?, 'scheduled')",
            (
                Uuid::new_v4().to_string(),
                &class_id,
                (i + 1) as i64,
                date.to_string(),
            ),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "classId": class_id,
        "name": name,
        "endDate": end_date.to_string(),
        "sessionDates": dates.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
    }))
}

/// End-date autofill for the class form: same validation and holiday
/// handling as classes.create, without touching the store.
fn classes_preview_end_date(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch_id = required_str(params, "branchId")?;
    let weekdays = required_weekday_set(params, "weekdays")?;
    let start_date = required_date(params, "startDate")?;
    let session_count = required_u32(params, "sessionCount")?;

    let conn = db_conn(state)?;
    require_reference(conn, "branches", "branch", &branch_id)?;

    let dates = schedule_with_widening(conn, &branch_id, start_date, |closed| {
        compute_end_date(start_date, &weekdays, session_count, closed).map(|d| vec![d])
    })?;
    let end_date = dates
        .last()
        .copied()
        .ok_or_else(|| HandlerErr::new("db_query_failed", "empty schedule"))?;
    Ok(json!({ "endDate": end_date.to_string() }))
}

fn classes_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id, c.name, c.branch_id, c.room_id, c.teacher_id, c.weekdays,
               c.start_time, c.end_time, c.start_date, c.session_count, c.end_date, c.active,
               (SELECT name FROM branches b WHERE b.id = c.branch_id) AS branch_name,
               (SELECT name FROM rooms r WHERE r.id = c.room_id) AS room_name,
               (SELECT name FROM teachers t WHERE t.id = c.teacher_id) AS teacher_name
             FROM classes c
             ORDER BY c.name",
        )
        .map_err(HandlerErr::db)?;
    let raw = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, String>(10)?,
                r.get::<_, i64>(11)? != 0,
                r.get::<_, Option<String>>(12)?,
                r.get::<_, Option<String>>(13)?,
                r.get::<_, Option<String>>(14)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut classes = Vec::with_capacity(raw.len());
    for row in raw {
        let weekdays = weekday_set_from_csv(&row.5)?;
        classes.push(json!({
            "id": row.0,
            "name": row.1,
            "branchId": row.2,
            "roomId": row.3,
            "teacherId": row.4,
            "weekdays": weekdays.iter().copied().collect::<Vec<_>>(),
            "startTime": row.6,
            "endTime": row.7,
            "startDate": row.8,
            "sessionCount": row.9,
            "endDate": row.10,
            "active": row.11,
            "branchName": row.12,
            "roomName": row.13,
            "teacherName": row.14,
        }));
    }
    Ok(json!({ "classes": classes }))
}

fn classes_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let conn = db_conn(state)?;

    let row = conn
        .query_row(
            "SELECT name, branch_id, room_id, teacher_id, weekdays, start_time, end_time,
                    start_date, session_count, end_date, active
             FROM classes WHERE id = ?",
            [&class_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, String>(9)?,
                    r.get::<_, i64>(10)? != 0,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(row) = row else {
        return Err(HandlerErr::new("not_found", "class not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, seq, date, status, actual_teacher_id
             FROM class_sessions WHERE class_id = ? ORDER BY seq",
        )
        .map_err(HandlerErr::db)?;
    let sessions = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "seq": r.get::<_, i64>(1)?,
                "date": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "actualTeacherId": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let weekdays = weekday_set_from_csv(&row.4)?;
    Ok(json!({
        "class": {
            "id": class_id,
            "name": row.0,
            "branchId": row.1,
            "roomId": row.2,
            "teacherId": row.3,
            "weekdays": weekdays.iter().copied().collect::<Vec<_>>(),
            "startTime": row.5,
            "endTime": row.6,
            "startDate": row.7,
            "sessionCount": row.8,
            "endDate": row.9,
            "active": row.10,
        },
        "sessions": sessions,
    }))
}

fn classes_set_active(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing active"))?;
    let conn = db_conn(state)?;
    let updated = conn
        .execute(
            "UPDATE classes SET active = ? WHERE id = ?",
            (active as i64, &class_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if updated == 0 {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    Ok(json!({ "ok": true }))
}

fn classes_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let conn = db_conn(state)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Dependency order; no ON DELETE CASCADE.
    let steps: &[(&str, &str)] = &[
        (
            "DELETE FROM session_absences
             WHERE session_id IN (SELECT id FROM class_sessions WHERE class_id = ?)",
            "session_absences",
        ),
        ("DELETE FROM class_sessions WHERE class_id = ?", "class_sessions"),
        ("DELETE FROM makeup_sessions WHERE class_id = ?", "makeup_sessions"),
        ("DELETE FROM classes WHERE id = ?", "classes"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": table }),
            ));
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => classes_create(state, &req.params),
        "classes.previewEndDate" => classes_preview_end_date(state, &req.params),
        "classes.list" => classes_list(state),
        "classes.get" => classes_get(state, &req.params),
        "classes.setActive" => classes_set_active(state, &req.params),
        "classes.delete" => classes_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
