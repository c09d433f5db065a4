use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, optional_str, require_reference, required_date, required_str, schedule_with_widening,
    weekday_set_from_csv,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{regenerate_tail, SCOPE_BRANCH, SCOPE_NATIONAL};

fn holidays_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = required_date(params, "date")?;
    let name = required_str(params, "name")?;
    let scope = required_str(params, "scope")?;
    let closed = params.get("closed").and_then(|v| v.as_bool()).unwrap_or(true);

    let conn = db_conn(state)?;
    let branch_ids: Vec<String> = match scope.as_str() {
        SCOPE_NATIONAL => Vec::new(),
        SCOPE_BRANCH => {
            let arr = params
                .get("branchIds")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    HandlerErr::new("bad_params", "branch-scoped holiday needs branchIds")
                })?;
            let ids: Vec<String> = arr
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect();
            if ids.is_empty() {
                return Err(HandlerErr::new(
                    "bad_params",
                    "branchIds must not be empty",
                ));
            }
            for id in &ids {
                require_reference(conn, "branches", "branch", id)?;
            }
            ids
        }
        other => {
            return Err(HandlerErr::new(
                "bad_params",
                format!("scope must be national or branch, got {}", other),
            ))
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let holiday_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO holidays(id, date, name, scope, closed) VALUES(?, ?, ?, ?, ?)",
        (
            &holiday_id,
            date.to_string(),
            &name,
            &scope,
            closed as i64,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    for branch_id in &branch_ids {
        tx.execute(
            "INSERT INTO holiday_branches(holiday_id, branch_id) VALUES(?, ?)",
            (&holiday_id, branch_id),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "holidayId": holiday_id, "date": date.to_string() }))
}

fn holidays_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let from = optional_str(params, "from");
    let to = optional_str(params, "to");

    let mut sql = String::from("SELECT id, date, name, scope, closed FROM holidays");
    let mut clauses = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(f) = from {
        clauses.push("date >= ?");
        args.push(f);
    }
    if let Some(t) = to {
        clauses.push("date <= ?");
        args.push(t);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY date");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut branch_stmt = conn
        .prepare("SELECT branch_id FROM holiday_branches WHERE holiday_id = ? ORDER BY branch_id")
        .map_err(HandlerErr::db)?;
    let mut holidays = Vec::with_capacity(rows.len());
    for (id, date, name, scope, closed) in rows {
        let branch_ids: Vec<String> = if scope == SCOPE_BRANCH {
            branch_stmt
                .query_map([&id], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db)?
        } else {
            Vec::new()
        };
        holidays.push(json!({
            "id": id,
            "date": date,
            "name": name,
            "scope": scope,
            "closed": closed,
            "branchIds": branch_ids,
        }));
    }
    Ok(json!({ "holidays": holidays }))
}

fn holidays_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let holiday_id = required_str(params, "holidayId")?;
    let conn = db_conn(state)?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM holidays WHERE id = ?", [&holiday_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "holiday not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for sql in [
        "DELETE FROM holiday_branches WHERE holiday_id = ?",
        "DELETE FROM holidays WHERE id = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&holiday_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string()));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

struct ClassRow {
    id: String,
    name: String,
    branch_id: String,
    room_id: String,
    teacher_id: String,
    weekdays: String,
    start_date: String,
    session_count: i64,
}

/// Recompute one class's sessions against the current holiday set. Sessions
/// with recorded attendance are frozen; only the unattended tail moves.
fn reschedule_class(conn: &Connection, class: &ClassRow) -> Result<usize, HandlerErr> {
    require_reference(conn, "branches", "branch", &class.branch_id)?;
    require_reference(conn, "rooms", "room", &class.room_id)?;
    require_reference(conn, "teachers", "teacher", &class.teacher_id)?;

    let weekdays = weekday_set_from_csv(&class.weekdays)?;
    let start_date = NaiveDate::parse_from_str(&class.start_date, "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("db_query_failed", "corrupt class start date"))?;
    let session_count = u32::try_from(class.session_count)
        .map_err(|_| HandlerErr::new("db_query_failed", "corrupt session count"))?;

    let mut stmt = conn
        .prepare("SELECT id, date, status FROM class_sessions WHERE class_id = ? ORDER BY date")
        .map_err(HandlerErr::db)?;
    let sessions = stmt
        .query_map([&class.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut frozen: Vec<(String, NaiveDate)> = Vec::new();
    for (id, date, status) in &sessions {
        if status != "scheduled" {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|_| HandlerErr::new("db_query_failed", "corrupt session date"))?;
            frozen.push((id.clone(), date));
        }
    }
    let frozen_count = frozen.len() as u32;
    let last_frozen = frozen.last().map(|(_, d)| *d);
    let walk_from = match last_frozen {
        Some(d) => d + Duration::days(1),
        None => start_date,
    };

    let tail = schedule_with_widening(conn, &class.branch_id, walk_from, |closed| {
        regenerate_tail(
            start_date,
            &weekdays,
            session_count,
            frozen_count,
            last_frozen,
            closed,
        )
    })?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tx.execute(
        "DELETE FROM session_absences
         WHERE session_id IN (SELECT id FROM class_sessions WHERE class_id = ? AND status = 'scheduled')",
        [&class.id],
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM class_sessions WHERE class_id = ? AND status = 'scheduled'",
        [&class.id],
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

    // Renumber frozen sessions 1..K in date order. Negative temp values keep
    // the (class_id, seq) uniqueness constraint satisfied mid-update.
    for (i, (session_id, _)) in frozen.iter().enumerate() {
        tx.execute(
            "UPDATE class_sessions SET seq = ? WHERE id = ?",
            (-((i + 1) as i64), session_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.execute(
        "UPDATE class_sessions SET seq = -seq WHERE class_id = ? AND seq < 0",
        [&class.id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    for (i, date) in tail.iter().enumerate() {
        tx.execute(
            "INSERT INTO class_sessions(id, class_id, seq, date, status)
             VALUES(?, ?, ?, ?, 'scheduled')",
            (
                Uuid::new_v4().to_string(),
                &class.id,
                (frozen_count as i64) + (i as i64) + 1,
                date.to_string(),
            ),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }

    let new_end = tail.last().copied().or(last_frozen);
    if let Some(end) = new_end {
        tx.execute(
            "UPDATE classes SET end_date = ? WHERE id = ?",
            (end.to_string(), &class.id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(tail.len())
}

/// Re-walk every active class against the current holiday set. Per-class
/// failures land in the error list instead of aborting the batch; classes
/// already rewritten stay committed.
fn holidays_reschedule_all(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let branch_filter = optional_str(params, "branchId");

    let mut sql = String::from(
        "SELECT id, name, branch_id, room_id, teacher_id, weekdays, start_date, session_count
         FROM classes WHERE active = 1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(b) = branch_filter {
        sql.push_str(" AND branch_id = ?");
        args.push(b);
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let classes = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                branch_id: r.get(2)?,
                room_id: r.get(3)?,
                teacher_id: r.get(4)?,
                weekdays: r.get(5)?,
                start_date: r.get(6)?,
                session_count: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let total = classes.len();
    let mut processed = 0usize;
    let mut errors = Vec::new();
    for (i, class) in classes.iter().enumerate() {
        match reschedule_class(conn, class) {
            Ok(regenerated) => {
                processed += 1;
                log::info!(
                    "rescheduled class {} ({}/{}): {} sessions regenerated",
                    class.name,
                    i + 1,
                    total,
                    regenerated
                );
            }
            Err(e) => {
                log::warn!("reschedule failed for class {}: {}", class.name, e.message);
                errors.push(json!({
                    "classId": class.id,
                    "code": e.code,
                    "message": e.message,
                }));
            }
        }
    }

    Ok(json!({ "processedCount": processed, "errors": errors }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "holidays.create" => holidays_create(state, &req.params),
        "holidays.list" => holidays_list(state, &req.params),
        "holidays.delete" => holidays_delete(state, &req.params),
        "holidays.rescheduleAll" => holidays_reschedule_all(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
