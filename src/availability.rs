use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::schedule::{matching_dates_in_range, weekday_number, ScheduleError};

/// Half-open time window within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ScheduleError> {
        if start >= end {
            return Err(ScheduleError::new(
                "invalid_schedule_input",
                "start time must be before end time",
            ));
        }
        Ok(Self { start, end })
    }

    /// `[09:00,10:30)` and `[10:30,12:00)` touch but do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BookingKind {
    ClassSession,
    Makeup,
}

/// One occupied slot, prefetched by the caller from the schedule store.
/// `owner_id` is the class id for regular sessions and the makeup id for
/// makeups; it is what `exclude_id` matches against.
#[derive(Debug, Clone)]
pub struct Booking {
    pub owner_id: String,
    pub kind: BookingKind,
    pub label: String,
    pub branch_id: String,
    pub room_id: String,
    pub teacher_id: String,
    pub date: NaiveDate,
    pub time: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ConflictReason {
    Holiday {
        date: String,
    },
    RoomConflict {
        date: String,
        conflicting_name: String,
        conflicting_time: String,
    },
    TeacherConflict {
        date: String,
        conflicting_name: String,
        conflicting_time: String,
    },
}

impl ConflictReason {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ConflictReason::Holiday { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    pub branch_id: String,
    pub room_id: String,
    pub teacher_id: String,
    pub weekdays: BTreeSet<u32>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub time: TimeRange,
    pub exclude_id: Option<String>,
}

impl AvailabilityQuery {
    /// Degenerate query for a one-off placement such as a makeup session.
    pub fn single_date(
        branch_id: String,
        room_id: String,
        teacher_id: String,
        date: NaiveDate,
        time: TimeRange,
        exclude_id: Option<String>,
    ) -> Self {
        Self {
            branch_id,
            room_id,
            teacher_id,
            weekdays: [weekday_number(date)].into_iter().collect(),
            date_from: date,
            date_to: date,
            time,
            exclude_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    pub conflicts: Vec<ConflictReason>,
}

/// Scan the candidate dates of `query` against the branch's closed days and
/// the prefetched bookings. Holiday closures are reported but advisory:
/// `available` turns false only on room or teacher conflicts. Callers own
/// the closed-date policy per call-site.
pub fn check_availability(
    query: &AvailabilityQuery,
    closed: &HashSet<NaiveDate>,
    bookings: &[Booking],
) -> Availability {
    let candidates = matching_dates_in_range(query.date_from, query.date_to, &query.weekdays);
    let mut conflicts = Vec::new();

    for date in &candidates {
        if closed.contains(date) {
            conflicts.push(ConflictReason::Holiday {
                date: date.to_string(),
            });
        }
        for booking in bookings {
            if booking.date != *date {
                continue;
            }
            if query
                .exclude_id
                .as_deref()
                .is_some_and(|ex| ex == booking.owner_id)
            {
                continue;
            }
            if !query.time.overlaps(&booking.time) {
                continue;
            }
            let display_name = match booking.kind {
                BookingKind::ClassSession => booking.label.clone(),
                BookingKind::Makeup => format!("Makeup: {}", booking.label),
            };
            if booking.branch_id == query.branch_id && booking.room_id == query.room_id {
                conflicts.push(ConflictReason::RoomConflict {
                    date: date.to_string(),
                    conflicting_name: display_name.clone(),
                    conflicting_time: booking.time.label(),
                });
            }
            // Teachers cannot be double-booked even across branches.
            if booking.teacher_id == query.teacher_id {
                conflicts.push(ConflictReason::TeacherConflict {
                    date: date.to_string(),
                    conflicting_name: display_name,
                    conflicting_time: booking.time.label(),
                });
            }
        }
    }

    let available = !conflicts.iter().any(|c| c.is_blocking());
    Availability {
        available,
        conflicts,
    }
}
