//! Attendance ledger with the once-per-identity-per-day invariant.

use crate::persistence::{self, PersistenceError, SnapshotStore};
use crate::registry::IdentityLookup;
use crate::types::{AttendanceRecord, AttendanceStatus, MatchResult};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Time zone used to decide which calendar day a timestamp falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayBoundary {
    /// The host's local time zone, re-evaluated per timestamp.
    #[default]
    Local,
    /// A fixed organizational offset, immune to host TZ and DST changes.
    Fixed(FixedOffset),
}

impl DayBoundary {
    pub fn day_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBoundary::Local => ts.with_timezone(&Local).date_naive(),
            DayBoundary::Fixed(offset) => ts.with_timezone(offset).date_naive(),
        }
    }

    /// Hour of day (0–23) in this boundary's zone.
    pub fn hour_of(&self, ts: DateTime<Utc>) -> u32 {
        use chrono::Timelike;
        match self {
            DayBoundary::Local => ts.with_timezone(&Local).hour(),
            DayBoundary::Fixed(offset) => ts.with_timezone(offset).hour(),
        }
    }

    /// Wall-clock time in this boundary's zone.
    pub fn time_of(&self, ts: DateTime<Utc>) -> NaiveTime {
        match self {
            DayBoundary::Local => ts.with_timezone(&Local).time(),
            DayBoundary::Fixed(offset) => ts.with_timezone(offset).time(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Recorded { record: AttendanceRecord },
    RejectedUnknown,
    RejectedDuplicate { identity_id: String },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("could not persist attendance: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Recorded(AttendanceRecord),
    Cleared { removed: usize },
}

pub struct AttendanceLedger {
    /// Newest first.
    records: Vec<AttendanceRecord>,
    boundary: DayBoundary,
    store: Arc<dyn SnapshotStore>,
    events: broadcast::Sender<LedgerEvent>,
}

impl AttendanceLedger {
    pub fn load(store: Arc<dyn SnapshotStore>, boundary: DayBoundary) -> Self {
        let records: Vec<AttendanceRecord> =
            persistence::load_collection(store.as_ref(), persistence::ATTENDANCE_RECORDS);
        tracing::info!(count = records.len(), ?boundary, "ledger loaded");
        let (events, _) = broadcast::channel(64);
        Self {
            records,
            boundary,
            store,
            events,
        }
    }

    /// Turn a match into at most one PRESENT record per identity per day.
    ///
    /// Check and append happen under `&mut self`, so callers sharing the
    /// ledger through a lock get an atomic check-and-append.
    pub fn submit(
        &mut self,
        result: &MatchResult,
        identities: &dyn IdentityLookup,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, LedgerError> {
        let Some(identity) = result
            .matched_identity_id
            .as_deref()
            .and_then(|id| identities.lookup(id))
        else {
            return Ok(SubmitOutcome::RejectedUnknown);
        };

        let today = self.boundary.day_of(now);
        if self.has_record_on(&identity.id, today) {
            tracing::debug!(identity = %identity.id, %today, "duplicate check-in ignored");
            return Ok(SubmitOutcome::RejectedDuplicate {
                identity_id: identity.id.clone(),
            });
        }

        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity.id.clone(),
            identity_name: identity.name.clone(),
            department: identity.department.clone(),
            timestamp: now,
            status: AttendanceStatus::Present,
            confidence: result.confidence,
        };

        self.records.insert(0, record.clone());
        if let Err(e) = self.persist() {
            self.records.remove(0);
            tracing::error!(error = %e, "ledger save failed; record dropped");
            return Err(e.into());
        }

        tracing::info!(
            identity = %record.identity_id,
            confidence = record.confidence.value(),
            "attendance recorded"
        );
        let _ = self.events.send(LedgerEvent::Recorded(record.clone()));
        Ok(SubmitOutcome::Recorded { record })
    }

    /// Administrative reset. Returns how many records were removed.
    pub fn clear(&mut self) -> Result<usize, LedgerError> {
        let previous = std::mem::take(&mut self.records);
        if let Err(e) = self.persist() {
            self.records = previous;
            tracing::error!(error = %e, "ledger save failed; clear aborted");
            return Err(e.into());
        }
        let removed = previous.len();
        tracing::warn!(removed, "attendance ledger cleared");
        let _ = self.events.send(LedgerEvent::Cleared { removed });
        Ok(removed)
    }

    fn has_record_on(&self, identity_id: &str, day: NaiveDate) -> bool {
        self.records
            .iter()
            .any(|r| r.identity_id == identity_id && self.boundary.day_of(r.timestamp) == day)
    }

    fn persist(&self) -> Result<(), PersistenceError> {
        persistence::save_collection(
            self.store.as_ref(),
            persistence::ATTENDANCE_RECORDS,
            &self.records,
        )
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn recent(&self, n: usize) -> &[AttendanceRecord] {
        &self.records[..n.min(self.records.len())]
    }

    pub fn records_on(&self, day: NaiveDate) -> Vec<&AttendanceRecord> {
        self.records
            .iter()
            .filter(|r| self.boundary.day_of(r.timestamp) == day)
            .collect()
    }

    pub fn boundary(&self) -> DayBoundary {
        self.boundary
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
