//! Daily attendance records, keyed by roll number and calendar date.

use crate::store::{Store, StoreError};
use crate::types::RollNumber;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Presence facts for one identity. Dates serialize as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub roll: RollNumber,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<u64>,
    pub days: BTreeMap<NaiveDate, bool>,
}

impl AttendanceRecord {
    pub fn new(roll: RollNumber, identity_id: Option<u64>) -> Self {
        Self {
            roll,
            identity_id,
            days: BTreeMap::new(),
        }
    }

    /// Set `day` to present. Other dates are left untouched.
    pub fn mark(&mut self, day: NaiveDate) {
        self.days.insert(day, true);
    }

    pub fn is_present(&self, day: NaiveDate) -> bool {
        self.days.get(&day).copied().unwrap_or(false)
    }
}

/// Attendance date in system-local time.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn parse_day(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
}

pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Writes presence facts through a [`Store`].
pub struct AttendanceRecorder<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> AttendanceRecorder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Idempotent upsert keyed by (roll, day).
    pub fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), StoreError> {
        self.store.mark_present(roll, day)?;
        tracing::info!(roll = %roll, day = %format_day(day), "attendance marked");
        Ok(())
    }

    pub fn get_attendance(
        &self,
        roll: &RollNumber,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.store.attendance(roll)
    }
}
