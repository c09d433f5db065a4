use chrono::{Duration, Months, NaiveDate, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::availability::{Booking, BookingKind, TimeRange};
use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use crate::schedule::{
    closed_dates_for_branch, Holiday, HolidayScope, ScheduleError, HOLIDAY_LOOKUP_MONTHS,
    MAX_SCAN_DAYS, SCOPE_BRANCH, SCOPE_NATIONAL,
};

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn optional_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn required_u32(params: &Value, key: &str) -> Result<u32, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{} must be a non-negative integer", key))
        })
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be YYYY-MM-DD", key)))
}

pub fn required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn parse_time(raw: &str, key: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be HH:MM", key)))
}

pub fn required_time_range(params: &Value) -> Result<TimeRange, HandlerErr> {
    let start = parse_time(&required_str(params, "startTime")?, "startTime")?;
    let end = parse_time(&required_str(params, "endTime")?, "endTime")?;
    TimeRange::new(start, end).map_err(HandlerErr::from)
}

/// Weekday numbers from a JSON array; range validation stays with the
/// scheduler core so bad sets fail as invalid_schedule_input.
pub fn required_weekday_set(params: &Value, key: &str) -> Result<BTreeSet<u32>, HandlerErr> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    let mut out = BTreeSet::new();
    for item in arr {
        let n = item.as_u64().ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{} must contain integers 0-6", key))
        })?;
        out.insert(n.min(255) as u32);
    }
    Ok(out)
}

pub fn weekday_csv(weekdays: &BTreeSet<u32>) -> String {
    weekdays
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn weekday_set_from_csv(raw: &str) -> Result<BTreeSet<u32>, HandlerErr> {
    let mut out = BTreeSet::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let n: u32 = part
            .parse()
            .map_err(|_| HandlerErr::new("db_query_failed", "corrupt weekday set"))?;
        out.insert(n);
    }
    Ok(out)
}

pub fn reference_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? LIMIT 1", table);
    conn.query_row(&sql, [id], |_r| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db)
}

pub fn require_reference(
    conn: &Connection,
    table: &str,
    what: &str,
    id: &str,
) -> Result<(), HandlerErr> {
    if reference_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::new(
            "reference_not_found",
            format!("unknown {}: {}", what, id),
        ))
    }
}

/// Holidays whose date falls in `[from, to)`, with branch lists attached.
pub fn load_holidays(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Holiday>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, date, scope, closed FROM holidays WHERE date >= ? AND date < ?")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([from.to_string(), to.to_string()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut branch_lists: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT hb.holiday_id, hb.branch_id
             FROM holiday_branches hb
             JOIN holidays h ON h.id = hb.holiday_id
             WHERE h.date >= ? AND h.date < ?",
        )
        .map_err(HandlerErr::db)?;
    let pairs = stmt
        .query_map([from.to_string(), to.to_string()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (holiday_id, branch_id) in pairs {
        branch_lists.entry(holiday_id).or_default().push(branch_id);
    }

    let mut out = Vec::with_capacity(rows.len());
    for (id, date, scope, closed) in rows {
        let date = parse_date(&date, "holiday date")
            .map_err(|_| HandlerErr::new("db_query_failed", "corrupt holiday date"))?;
        let scope = match scope.as_str() {
            SCOPE_NATIONAL => HolidayScope::National,
            SCOPE_BRANCH => HolidayScope::Branches(branch_lists.remove(&id).unwrap_or_default()),
            other => {
                return Err(HandlerErr::new(
                    "db_query_failed",
                    format!("corrupt holiday scope: {}", other),
                ))
            }
        };
        out.push(Holiday { date, scope, closed });
    }
    Ok(out)
}

pub fn load_closed_dates(
    conn: &Connection,
    branch_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<HashSet<NaiveDate>, HandlerErr> {
    let holidays = load_holidays(conn, from, to)?;
    Ok(closed_dates_for_branch(&holidays, branch_id))
}

/// Run a schedule computation against the standard holiday lookup window,
/// widening once to the full scan bound when the result runs past the
/// fetched window.
pub fn schedule_with_widening<F>(
    conn: &Connection,
    branch_id: &str,
    anchor: NaiveDate,
    compute: F,
) -> Result<Vec<NaiveDate>, HandlerErr>
where
    F: Fn(&HashSet<NaiveDate>) -> Result<Vec<NaiveDate>, ScheduleError>,
{
    let window_end = anchor
        .checked_add_months(Months::new(HOLIDAY_LOOKUP_MONTHS))
        .ok_or_else(|| HandlerErr::new("bad_params", "start date out of range"))?;
    let closed = load_closed_dates(conn, branch_id, anchor, window_end)?;
    let dates = compute(&closed)?;
    if dates.last().is_some_and(|last| *last >= window_end) {
        // The schedule outran the holiday coverage; recompute with the
        // window stretched to the scan bound.
        let wide_end = anchor + Duration::days(MAX_SCAN_DAYS + 1);
        let closed = load_closed_dates(conn, branch_id, anchor, wide_end)?;
        return compute(&closed).map_err(HandlerErr::from);
    }
    Ok(dates)
}

/// Occupied slots touching the given room or teacher in `[from, to]`,
/// for conflict scanning. Regular sessions carry their class id as the
/// exclusion owner; makeups carry their own id.
pub fn load_bookings(
    conn: &Connection,
    room_id: &str,
    teacher_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Booking>, HandlerErr> {
    let mut out = Vec::new();

    let mut stmt = conn
        .prepare(
            "SELECT s.class_id, c.name, c.branch_id, c.room_id, c.teacher_id,
                    s.date, c.start_time, c.end_time
             FROM class_sessions s
             JOIN classes c ON c.id = s.class_id
             WHERE s.status = 'scheduled'
               AND s.date >= ?1 AND s.date <= ?2
               AND (c.room_id = ?3 OR c.teacher_id = ?4)",
        )
        .map_err(HandlerErr::db)?;
    let session_rows = stmt
        .query_map(
            (from.to_string(), to.to_string(), room_id, teacher_id),
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
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (owner, name, branch, room, teacher, date, start, end) in session_rows {
        out.push(Booking {
            owner_id: owner,
            kind: BookingKind::ClassSession,
            label: name,
            branch_id: branch,
            room_id: room,
            teacher_id: teacher,
            date: parse_date(&date, "session date")
                .map_err(|_| HandlerErr::new("db_query_failed", "corrupt session date"))?,
            time: booking_time(&start, &end)?,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT m.id, COALESCE(c.name, 'makeup'), m.branch_id, m.room_id, m.teacher_id,
                    m.date, m.start_time, m.end_time
             FROM makeup_sessions m
             LEFT JOIN classes c ON c.id = m.class_id
             WHERE m.status = 'scheduled'
               AND m.date >= ?1 AND m.date <= ?2
               AND (m.room_id = ?3 OR m.teacher_id = ?4)",
        )
        .map_err(HandlerErr::db)?;
    let makeup_rows = stmt
        .query_map(
            (from.to_string(), to.to_string(), room_id, teacher_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (owner, name, branch, room, teacher, date, start, end) in makeup_rows {
        // A scheduled makeup always has a full placement; rows without one
        // cannot occupy a slot.
        let (Some(branch), Some(room), Some(teacher), Some(date), Some(start), Some(end)) =
            (branch, room, teacher, date, start, end)
        else {
            continue;
        };
        out.push(Booking {
            owner_id: owner,
            kind: BookingKind::Makeup,
            label: name,
            branch_id: branch,
            room_id: room,
            teacher_id: teacher,
            date: parse_date(&date, "makeup date")
                .map_err(|_| HandlerErr::new("db_query_failed", "corrupt makeup date"))?,
            time: booking_time(&start, &end)?,
        });
    }

    Ok(out)
}

fn booking_time(start: &str, end: &str) -> Result<TimeRange, HandlerErr> {
    let start = parse_time(start, "start time")
        .map_err(|_| HandlerErr::new("db_query_failed", "corrupt booking time"))?;
    let end = parse_time(end, "end time")
        .map_err(|_| HandlerErr::new("db_query_failed", "corrupt booking time"))?;
    TimeRange::new(start, end)
        .map_err(|_| HandlerErr::new("db_query_failed", "corrupt booking time range"))
}
