use chrono::Duration;
use rusqlite::OptionalExtension;

use crate::availability::{check_availability, AvailabilityQuery};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, load_bookings, load_closed_dates, optional_str, require_reference, required_date,
    required_str, required_time_range, required_weekday_set,
};
use crate::ipc::types::{AppState, Request};

/// Advisory pre-commit check: reports holiday closures and room/teacher
/// double-bookings for a candidate slot. It reserves nothing; the write
/// handlers re-run the scan inside their transaction.
fn availability_check(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch_id = required_str(params, "branchId")?;
    let room_id = required_str(params, "roomId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let time = required_time_range(params)?;
    let exclude_id = optional_str(params, "excludeId");

    let conn = db_conn(state)?;
    require_reference(conn, "branches", "branch", &branch_id)?;
    require_reference(conn, "teachers", "teacher", &teacher_id)?;
    let room_branch: Option<String> = conn
        .query_row("SELECT branch_id FROM rooms WHERE id = ?", [&room_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if room_branch.is_none() {
        return Err(HandlerErr::new(
            "reference_not_found",
            format!("unknown room: {}", room_id),
        ));
    }

    // Either a single makeup date or a recurring weekday set over a range.
    let query = if params.get("date").is_some() {
        let date = required_date(params, "date")?;
        AvailabilityQuery::single_date(branch_id, room_id, teacher_id, date, time, exclude_id)
    } else {
        let weekdays = required_weekday_set(params, "weekdays")?;
        let date_from = required_date(params, "dateFrom")?;
        let date_to = required_date(params, "dateTo")?;
        if date_to < date_from {
            return Err(HandlerErr::new("bad_params", "dateTo is before dateFrom"));
        }
        AvailabilityQuery {
            branch_id,
            room_id,
            teacher_id,
            weekdays,
            date_from,
            date_to,
            time,
            exclude_id,
        }
    };

    let closed = load_closed_dates(
        conn,
        &query.branch_id,
        query.date_from,
        query.date_to + Duration::days(1),
    )?;
    let bookings = load_bookings(
        conn,
        &query.room_id,
        &query.teacher_id,
        query.date_from,
        query.date_to,
    )?;
    let result = check_availability(&query, &closed, &bookings);
    serde_json::to_value(result)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "availability.check" => availability_check(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
