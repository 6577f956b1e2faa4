//! Attendance records and the presence views derived from them.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tally_core::RecognitionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Entry,
    Exit,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Event about to be appended; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewAttendanceEvent {
    /// `None` for a face that matched nobody.
    pub employee_id: Option<i64>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub trace_id: String,
    pub status: RecognitionStatus,
}

/// Append-only attendance log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub employee_id: Option<i64>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub trace_id: String,
    pub status: RecognitionStatus,
}

impl NewAttendanceEvent {
    pub fn with_id(self, id: i64) -> AttendanceEvent {
        AttendanceEvent {
            id,
            employee_id: self.employee_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            confidence: self.confidence,
            trace_id: self.trace_id,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    InOffice,
    Left,
    Unknown,
}

impl PresenceState {
    /// Presence implied by an employee's most recent event.
    pub fn from_latest(latest: Option<&AttendanceEvent>) -> Self {
        match latest.map(|e| e.event_type) {
            Some(EventType::Entry) => Self::InOffice,
            Some(EventType::Exit) => Self::Left,
            None => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeStatus {
    pub employee_id: i64,
    pub employee_name: String,
    pub state: PresenceState,
    pub last_event: Option<EventType>,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl EmployeeStatus {
    pub fn new(employee_id: i64, employee_name: String, latest: Option<&AttendanceEvent>) -> Self {
        Self {
            employee_id,
            employee_name,
            state: PresenceState::from_latest(latest),
            last_event: latest.map(|e| e.event_type),
            last_event_time: latest.map(|e| e.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfficeStatus {
    pub present_count: usize,
    pub total_employees: usize,
    pub present_employees: Vec<EmployeeStatus>,
}

/// Aggregate attendance of one employee over a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub employee_id: i64,
    pub employee_name: String,
    /// Distinct UTC days with at least one event.
    pub total_days: usize,
    /// Per day, first entry to last exit; days without both count zero.
    pub total_hours: f64,
    /// Mean time of day of entries, `HH:MM` UTC.
    pub avg_arrival_time: Option<String>,
    pub avg_departure_time: Option<String>,
}

#[derive(Default)]
struct DaySpan {
    first_entry: Option<DateTime<Utc>>,
    last_exit: Option<DateTime<Utc>>,
}

impl AttendanceStats {
    pub fn from_events(employee_id: i64, employee_name: String, events: &[AttendanceEvent]) -> Self {
        let mut days: BTreeMap<NaiveDate, DaySpan> = BTreeMap::new();
        let mut arrivals = Vec::new();
        let mut departures = Vec::new();

        for event in events {
            let at = event.timestamp;
            let day = days.entry(at.date_naive()).or_default();
            match event.event_type {
                EventType::Entry => {
                    day.first_entry = Some(day.first_entry.map_or(at, |t| t.min(at)));
                    arrivals.push(at.time());
                }
                EventType::Exit => {
                    day.last_exit = Some(day.last_exit.map_or(at, |t| t.max(at)));
                    departures.push(at.time());
                }
            }
        }

        let worked_ms: i64 = days
            .values()
            .filter_map(|d| match (d.first_entry, d.last_exit) {
                (Some(first), Some(last)) if last > first => Some((last - first).num_milliseconds()),
                _ => None,
            })
            .sum();
        let total_hours = (worked_ms as f64 / 3_600_000.0 * 100.0).round() / 100.0;

        Self {
            employee_id,
            employee_name,
            total_days: days.len(),
            total_hours,
            avg_arrival_time: mean_time_of_day(&arrivals),
            avg_departure_time: mean_time_of_day(&departures),
        }
    }
}

fn mean_time_of_day(times: &[NaiveTime]) -> Option<String> {
    if times.is_empty() {
        return None;
    }
    let total: u64 = times.iter().map(|t| u64::from(t.num_seconds_from_midnight())).sum();
    let mean = total / times.len() as u64;
    Some(format!("{:02}:{:02}", mean / 3600, (mean % 3600) / 60))
}

pub fn fallback_name(employee_id: i64) -> String {
    format!("Employee #{employee_id}")
}
