use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Hard bound on the forward date walk. A schedule that cannot collect its
/// target session count within two years of the walk start is unsatisfiable.
pub const MAX_SCAN_DAYS: i64 = 731;

/// Months of holiday coverage fetched up front by callers. When a computed
/// schedule runs past this window the caller widens to the full scan bound
/// and recomputes once.
pub const HOLIDAY_LOOKUP_MONTHS: u32 = 6;

pub const SCOPE_NATIONAL: &str = "national";
pub const SCOPE_BRANCH: &str = "branch";

#[derive(Debug, Clone, PartialEq)]
pub enum HolidayScope {
    National,
    Branches(Vec<String>),
}

/// A calendar exclusion. `closed` is orthogonal to scope: a branch holiday
/// without the closure flag is informational only and never blocks scheduling.
#[derive(Debug, Clone)]
pub struct Holiday {
    pub date: NaiveDate,
    pub scope: HolidayScope,
    pub closed: bool,
}

impl Holiday {
    pub fn blocks_branch(&self, branch_id: &str) -> bool {
        if !self.closed {
            return false;
        }
        match &self.scope {
            HolidayScope::National => true,
            HolidayScope::Branches(ids) => ids.iter().any(|id| id == branch_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScheduleError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Calendar dates on which the given branch is closed.
pub fn closed_dates_for_branch(holidays: &[Holiday], branch_id: &str) -> HashSet<NaiveDate> {
    holidays
        .iter()
        .filter(|h| h.blocks_branch(branch_id))
        .map(|h| h.date)
        .collect()
}

pub fn weekday_number(date: NaiveDate) -> u32 {
    // 0 = Sunday .. 6 = Saturday, matching the wire format.
    date.weekday().num_days_from_sunday()
}

fn validate_weekday_set(weekdays: &BTreeSet<u32>) -> Result<(), ScheduleError> {
    if weekdays.is_empty() {
        return Err(ScheduleError::new(
            "invalid_schedule_input",
            "weekday set must not be empty",
        ));
    }
    if let Some(bad) = weekdays.iter().find(|d| **d > 6) {
        return Err(ScheduleError::new(
            "invalid_schedule_input",
            format!("weekday {} out of range 0-6", bad),
        ));
    }
    Ok(())
}

/// Walk forward from `from`, collecting `count` dates whose weekday is in the
/// set and which are not closed. Closed matching dates are skipped outright,
/// never shifted onto an adjacent day.
fn collect_session_dates(
    from: NaiveDate,
    weekdays: &BTreeSet<u32>,
    count: u32,
    closed: &HashSet<NaiveDate>,
) -> Result<Vec<NaiveDate>, ScheduleError> {
    let mut out = Vec::with_capacity(count as usize);
    let mut day = from;
    let mut scanned: i64 = 0;
    while (out.len() as u32) < count {
        if scanned > MAX_SCAN_DAYS {
            return Err(ScheduleError::new(
                "schedule_unsatisfiable",
                format!(
                    "could not collect {} sessions within {} days of {}",
                    count, MAX_SCAN_DAYS, from
                ),
            ));
        }
        if weekdays.contains(&weekday_number(day)) && !closed.contains(&day) {
            out.push(day);
        }
        day += Duration::days(1);
        scanned += 1;
    }
    Ok(out)
}

/// Session dates for a new class: `target_count` dates starting at
/// `start_date`, skipping closed days. The start date's weekday must belong
/// to the weekday set; sessions are 1-indexed in the returned order.
pub fn compute_schedule(
    start_date: NaiveDate,
    weekdays: &BTreeSet<u32>,
    target_count: u32,
    closed: &HashSet<NaiveDate>,
) -> Result<Vec<NaiveDate>, ScheduleError> {
    validate_weekday_set(weekdays)?;
    if target_count == 0 {
        return Err(ScheduleError::new(
            "invalid_schedule_input",
            "session count must be at least 1",
        ));
    }
    if !weekdays.contains(&weekday_number(start_date)) {
        return Err(ScheduleError::new(
            "invalid_schedule_input",
            format!(
                "start date {} falls on weekday {} which is not in the weekday set",
                start_date,
                weekday_number(start_date)
            ),
        ));
    }
    collect_session_dates(start_date, weekdays, target_count, closed)
}

pub fn compute_end_date(
    start_date: NaiveDate,
    weekdays: &BTreeSet<u32>,
    target_count: u32,
    closed: &HashSet<NaiveDate>,
) -> Result<NaiveDate, ScheduleError> {
    let dates = compute_schedule(start_date, weekdays, target_count, closed)?;
    dates.last().copied().ok_or_else(|| {
        ScheduleError::new("invalid_schedule_input", "session count must be at least 1")
    })
}

/// Regenerate the unattended tail of an existing schedule. Sessions with
/// recorded attendance are frozen; the walk resumes the day after the last
/// frozen date (or at the class start date when nothing is frozen) and
/// collects the remaining `target_count - frozen_count` dates.
pub fn regenerate_tail(
    start_date: NaiveDate,
    weekdays: &BTreeSet<u32>,
    target_count: u32,
    frozen_count: u32,
    last_frozen_date: Option<NaiveDate>,
    closed: &HashSet<NaiveDate>,
) -> Result<Vec<NaiveDate>, ScheduleError> {
    validate_weekday_set(weekdays)?;
    if frozen_count >= target_count {
        return Ok(Vec::new());
    }
    let from = match last_frozen_date {
        Some(d) => d + Duration::days(1),
        None => start_date,
    };
    collect_session_dates(from, weekdays, target_count - frozen_count, closed)
}

/// All dates in `[from, to]` whose weekday is in the set, closed days
/// included. The availability checker reports closures separately instead of
/// silently dropping candidate dates.
pub fn matching_dates_in_range(
    from: NaiveDate,
    to: NaiveDate,
    weekdays: &BTreeSet<u32>,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = from;
    while day <= to {
        if weekdays.contains(&weekday_number(day)) {
            out.push(day);
        }
        day += Duration::days(1);
    }
    out
}
