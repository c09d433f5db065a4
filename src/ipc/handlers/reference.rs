use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, require_reference, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const BOOTSTRAP_KEY: &str = "reference.bootstrap";

fn branches_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let conn = db_conn(state)?;
    let branch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO branches(id, name) VALUES(?, ?)",
        (&branch_id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    state.bootstrap_cache.invalidate(BOOTSTRAP_KEY);
    Ok(json!({ "branchId": branch_id, "name": name }))
}

fn branches_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT
               b.id,
               b.name,
               (SELECT COUNT(*) FROM rooms r WHERE r.branch_id = b.id) AS room_count,
               (SELECT COUNT(*) FROM classes c WHERE c.branch_id = b.id AND c.active = 1) AS class_count
             FROM branches b
             ORDER BY b.name",
        )
        .map_err(HandlerErr::db)?;
    let branches = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "roomCount": row.get::<_, i64>(2)?,
                "activeClassCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "branches": branches }))
}

fn rooms_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let branch_id = required_str(params, "branchId")?;
    let name = required_str(params, "name")?;
    let capacity = params.get("capacity").and_then(|v| v.as_i64());
    let conn = db_conn(state)?;
    require_reference(conn, "branches", "branch", &branch_id)?;
    let room_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO rooms(id, branch_id, name, capacity) VALUES(?, ?, ?, ?)",
        (&room_id, &branch_id, &name, capacity),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    state.bootstrap_cache.invalidate(BOOTSTRAP_KEY);
    Ok(json!({ "roomId": room_id, "name": name }))
}

fn rooms_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let branch_id = optional_str(params, "branchId");
    let mut rows = Vec::new();
    let mut push_row = |id: String, branch: String, name: String, capacity: Option<i64>| {
        rows.push(json!({ "id": id, "branchId": branch, "name": name, "capacity": capacity }));
    };
    match branch_id {
        Some(b) => {
            let mut stmt = conn
                .prepare("SELECT id, branch_id, name, capacity FROM rooms WHERE branch_id = ? ORDER BY name")
                .map_err(HandlerErr::db)?;
            let items = stmt
                .query_map([&b], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })
                .and_then(|it| it.collect::<Result<Vec<(String, String, String, Option<i64>)>, _>>())
                .map_err(HandlerErr::db)?;
            for (id, branch, name, capacity) in items {
                push_row(id, branch, name, capacity);
            }
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id, branch_id, name, capacity FROM rooms ORDER BY branch_id, name")
                .map_err(HandlerErr::db)?;
            let items = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })
                .and_then(|it| it.collect::<Result<Vec<(String, String, String, Option<i64>)>, _>>())
                .map_err(HandlerErr::db)?;
            for (id, branch, name, capacity) in items {
                push_row(id, branch, name, capacity);
            }
        }
    }
    Ok(json!({ "rooms": rows }))
}

fn rooms_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = required_str(params, "roomId")?;
    let conn = db_conn(state)?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM rooms WHERE id = ?", [&room_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "room not found"));
    }
    // Classes pointing at the room are left as-is; they surface
    // reference_not_found on the next scheduling operation.
    conn.execute("DELETE FROM rooms WHERE id = ?", [&room_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    state.bootstrap_cache.invalidate(BOOTSTRAP_KEY);
    Ok(json!({ "ok": true }))
}

fn teachers_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let conn = db_conn(state)?;
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, name) VALUES(?, ?)",
        (&teacher_id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    state.bootstrap_cache.invalidate(BOOTSTRAP_KEY);
    Ok(json!({ "teacherId": teacher_id, "name": name }))
}

fn teachers_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM teachers ORDER BY name")
        .map_err(HandlerErr::db)?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "teachers": teachers }))
}

fn students_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let branch_id = optional_str(params, "branchId");
    let conn = db_conn(state)?;
    if let Some(b) = &branch_id {
        require_reference(conn, "branches", "branch", b)?;
    }
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, branch_id, name) VALUES(?, ?, ?)",
        (&student_id, &branch_id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    state.bootstrap_cache.invalidate(BOOTSTRAP_KEY);
    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, branch_id, name FROM students ORDER BY name")
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "branchId": r.get::<_, Option<String>>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "students": students }))
}

/// Everything the class/makeup forms need to render, in one payload.
/// Served through the TTL cache; reference writes invalidate it.
fn reference_bootstrap(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    if let Some(cached) = state.bootstrap_cache.get(BOOTSTRAP_KEY) {
        return Ok(cached);
    }

    // Prepared statements borrow the connection; keep them in a block so
    // the borrow ends before the cache write.
    let payload = {
        let conn = db_conn(state)?;
        let mut stmt = conn
            .prepare("SELECT id, name FROM branches ORDER BY name")
            .map_err(HandlerErr::db)?;
        let branch_rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;

        let mut branches = Vec::with_capacity(branch_rows.len());
        let mut room_stmt = conn
            .prepare("SELECT id, name, capacity FROM rooms WHERE branch_id = ? ORDER BY name")
            .map_err(HandlerErr::db)?;
        for (branch_id, branch_name) in branch_rows {
            let rooms = room_stmt
                .query_map([&branch_id], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "capacity": r.get::<_, Option<i64>>(2)?,
                    }))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db)?;
            branches.push(json!({ "id": branch_id, "name": branch_name, "rooms": rooms }));
        }

        let teachers = teachers_list(state)?;
        let students = students_list(state)?;
        json!({
            "branches": branches,
            "teachers": teachers["teachers"],
            "students": students["students"],
        })
    };
    state.bootstrap_cache.put(BOOTSTRAP_KEY, payload.clone());
    Ok(payload)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "branches.create" => branches_create(state, &req.params),
        "branches.list" => branches_list(state),
        "rooms.create" => rooms_create(state, &req.params),
        "rooms.list" => rooms_list(state, &req.params),
        "rooms.delete" => rooms_delete(state, &req.params),
        "teachers.create" => teachers_create(state, &req.params),
        "teachers.list" => teachers_list(state),
        "students.create" => students_create(state, &req.params),
        "students.list" => students_list(state),
        "reference.bootstrap" => reference_bootstrap(state),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
