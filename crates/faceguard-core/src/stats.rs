//! Dashboard figures derived from the registry and the ledger.

use crate::ledger::{AttendanceLedger, DayBoundary};
use crate::types::{AttendanceRecord, Identity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

pub const RECENT_ACTIVITY_LEN: usize = 7;
/// First hour of the business-hours histogram.
pub const BUSINESS_HOURS_START: u32 = 8;
/// One past the last hour of the histogram.
pub const BUSINESS_HOURS_END: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyCount {
    pub hour: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total_identities: usize,
    pub present_today: usize,
    /// Percentage of identities present today, rounded.
    pub attendance_rate: u32,
    pub last_scan: Option<DateTime<Utc>>,
    pub recent_activity: Vec<AttendanceRecord>,
    pub hourly: Vec<HourlyCount>,
}

impl DashboardStats {
    /// Figures for the ledger's current day, in the ledger's own zone.
    pub fn from_ledger(
        identities: &[Identity],
        ledger: &AttendanceLedger,
        now: DateTime<Utc>,
    ) -> Self {
        let boundary = ledger.boundary();
        let todays = ledger.records_on(boundary.day_of(now));
        Self::summarize(identities, &todays, ledger.recent(RECENT_ACTIVITY_LEN), boundary)
    }

    /// `records` must be newest-first, as the ledger keeps them.
    pub fn compute(
        identities: &[Identity],
        records: &[AttendanceRecord],
        now: DateTime<Utc>,
        boundary: DayBoundary,
    ) -> Self {
        let today = boundary.day_of(now);
        let todays: Vec<&AttendanceRecord> = records
            .iter()
            .filter(|r| boundary.day_of(r.timestamp) == today)
            .collect();
        let recent = &records[..RECENT_ACTIVITY_LEN.min(records.len())];
        Self::summarize(identities, &todays, recent, boundary)
    }

    fn summarize(
        identities: &[Identity],
        todays: &[&AttendanceRecord],
        recent: &[AttendanceRecord],
        boundary: DayBoundary,
    ) -> Self {
        let present_today = todays
            .iter()
            .map(|r| r.identity_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        let attendance_rate = if identities.is_empty() {
            0
        } else {
            (present_today as f64 / identities.len() as f64 * 100.0).round() as u32
        };

        let mut hourly: Vec<HourlyCount> = (BUSINESS_HOURS_START..BUSINESS_HOURS_END)
            .map(|hour| HourlyCount { hour, count: 0 })
            .collect();
        for r in todays {
            let hour = boundary.hour_of(r.timestamp);
            if (BUSINESS_HOURS_START..BUSINESS_HOURS_END).contains(&hour) {
                hourly[(hour - BUSINESS_HOURS_START) as usize].count += 1;
            }
        }

        Self {
            total_identities: identities.len(),
            present_today,
            attendance_rate,
            last_scan: todays.first().map(|r| r.timestamp),
            recent_activity: recent.to_vec(),
            hourly,
        }
    }
}
