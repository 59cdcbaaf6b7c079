//! Kiosk scan cycle: Idle → Capturing → Awaiting → Resolved → Idle.
//!
//! Only one cycle runs at a time. A scan requested while capturing or
//! awaiting the oracle is rejected, never queued. A resolved outcome is
//! displayed for a fixed interval and then decays back to Idle; a new scan
//! request ends the display early.

use crate::ledger::{AttendanceLedger, DayBoundary, SubmitOutcome};
use crate::orchestrator::MatchOrchestrator;
use crate::registry::UserRegistry;
use crate::types::{AttendanceRecord, Confidence, EncodedImage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_DISPLAY_INTERVAL: Duration = Duration::from_secs(5);

pub type SharedRegistry = Arc<tokio::sync::Mutex<UserRegistry>>;
pub type SharedLedger = Arc<tokio::sync::Mutex<AttendanceLedger>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera available: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// The camera collaborator: one encoded still per call.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_frame(&self) -> Result<EncodedImage, CaptureError>;
}

/// How a resolution should be presented to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Success,
    Informational,
    RecognitionNegative,
    SystemError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    MatchedNew {
        record: AttendanceRecord,
    },
    MatchedDuplicate {
        identity_id: String,
        identity_name: String,
    },
    Unknown {
        confidence: Confidence,
        reasoning: Option<String>,
    },
    CaptureFailed {
        reason: String,
    },
    OracleFailure {
        reason: String,
    },
    StorageFailure {
        reason: String,
    },
}

impl Resolution {
    pub fn category(&self) -> Category {
        match self {
            Resolution::MatchedNew { .. } => Category::Success,
            Resolution::MatchedDuplicate { .. } => Category::Informational,
            Resolution::Unknown { .. } => Category::RecognitionNegative,
            Resolution::CaptureFailed { .. }
            | Resolution::OracleFailure { .. }
            | Resolution::StorageFailure { .. } => Category::SystemError,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Resolution::MatchedNew { record } => format!("Welcome, {}!", record.identity_name),
            Resolution::MatchedDuplicate { identity_name, .. } => {
                format!("Already checked in today, {identity_name}.")
            }
            Resolution::Unknown { .. } => "Face not recognized.".to_string(),
            Resolution::CaptureFailed { .. } => {
                "Failed to capture camera frame. Please check permissions.".to_string()
            }
            Resolution::OracleFailure { .. } => {
                "System error. Please check oracle configuration.".to_string()
            }
            Resolution::StorageFailure { .. } => {
                "System error. Attendance could not be saved.".to_string()
            }
        }
    }

    /// Secondary line shown under the message, if any. Times are shown in
    /// the zone that decides the attendance day.
    pub fn details(&self, boundary: DayBoundary) -> Option<String> {
        match self {
            Resolution::MatchedNew { record } => Some(format!(
                "Attendance marked at {} (Confidence: {}%)",
                boundary.time_of(record.timestamp).format("%H:%M:%S"),
                record.confidence.percent()
            )),
            Resolution::Unknown { reasoning, .. } => Some(
                reasoning
                    .clone()
                    .unwrap_or_else(|| "Please register first or try again.".to_string()),
            ),
            Resolution::MatchedDuplicate { .. } => None,
            Resolution::CaptureFailed { reason }
            | Resolution::OracleFailure { reason }
            | Resolution::StorageFailure { reason } => Some(reason.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Awaiting,
    Resolved { resolution: Resolution },
}

impl SessionState {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Capturing | SessionState::Awaiting)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ScanRequested,
    FrameCaptured,
    CaptureFailed(CaptureError),
    Resolved(Resolution),
    DisplayElapsed,
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a scan is already in progress")]
    Busy,
    #[error("invalid transition: {event} while {state}")]
    InvalidTransition { state: String, event: String },
}

impl SessionState {
    /// Transition table for the scan cycle.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState, SessionError> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Idle | S::Resolved { .. }, E::ScanRequested) => Ok(S::Capturing),
            (S::Capturing | S::Awaiting, E::ScanRequested) => Err(SessionError::Busy),
            (S::Capturing, E::FrameCaptured) => Ok(S::Awaiting),
            (S::Capturing, E::CaptureFailed(e)) => Ok(S::Resolved {
                resolution: Resolution::CaptureFailed {
                    reason: e.to_string(),
                },
            }),
            (S::Awaiting, E::Resolved(resolution)) => Ok(S::Resolved { resolution }),
            (S::Resolved { .. }, E::DisplayElapsed) => Ok(S::Idle),
            (S::Capturing | S::Awaiting, E::Cancelled) => Ok(S::Idle),
            (state, event) => Err(SessionError::InvalidTransition {
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            }),
        }
    }
}

struct Inner {
    state: SessionState,
    resolved_at: Option<Instant>,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct AttendanceSession {
    registry: SharedRegistry,
    ledger: SharedLedger,
    orchestrator: MatchOrchestrator,
    camera: Arc<dyn FrameSource>,
    display_interval: Duration,
    clock: Clock,
    inner: Mutex<Inner>,
}

impl AttendanceSession {
    pub fn new(
        registry: SharedRegistry,
        ledger: SharedLedger,
        orchestrator: MatchOrchestrator,
        camera: Arc<dyn FrameSource>,
    ) -> Self {
        Self {
            registry,
            ledger,
            orchestrator,
            camera,
            display_interval: DEFAULT_DISPLAY_INTERVAL,
            clock: Arc::new(Utc::now),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                resolved_at: None,
            }),
        }
    }

    pub fn with_display_interval(mut self, interval: Duration) -> Self {
        self.display_interval = interval;
        self
    }

    /// Override wall-clock time used for ledger timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn camera(&self) -> &Arc<dyn FrameSource> {
        &self.camera
    }

    pub fn orchestrator(&self) -> &MatchOrchestrator {
        &self.orchestrator
    }

    /// Current state, with an expired Resolved display already decayed to Idle.
    pub fn state(&self) -> SessionState {
        let mut inner = self.lock_inner();
        self.decay(&mut inner);
        inner.state.clone()
    }

    /// Run one capture → identify → record cycle.
    ///
    /// Returns `SessionError::Busy` if a cycle is already running. Dropping
    /// the returned future mid-cycle puts the session back to Idle.
    pub async fn scan(&self) -> Result<Resolution, SessionError> {
        self.transition(SessionEvent::ScanRequested)?;
        let mut cycle = CycleGuard {
            session: self,
            armed: true,
        };

        let frame = match self.camera.capture_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "capture failed");
                let state = self.transition(SessionEvent::CaptureFailed(e))?;
                cycle.armed = false;
                return match state {
                    SessionState::Resolved { resolution } => Ok(resolution),
                    other => Err(SessionError::InvalidTransition {
                        state: format!("{other:?}"),
                        event: "CaptureFailed".into(),
                    }),
                };
            }
        };
        self.transition(SessionEvent::FrameCaptured)?;

        let snapshot = self.registry.lock().await.snapshot();
        let identification = self.orchestrator.identify(&frame, &snapshot).await;

        let resolution = if let Some(failure) = identification.failure {
            Resolution::OracleFailure {
                reason: failure.to_string(),
            }
        } else {
            let now = (self.clock)();
            let result = identification.result;
            let outcome = self.ledger.lock().await.submit(&result, &snapshot, now);
            match outcome {
                Ok(SubmitOutcome::Recorded { record }) => Resolution::MatchedNew { record },
                Ok(SubmitOutcome::RejectedDuplicate { identity_id }) => {
                    let identity_name = snapshot
                        .iter()
                        .find(|i| i.id == identity_id)
                        .map(|i| i.name.clone())
                        .unwrap_or_default();
                    Resolution::MatchedDuplicate {
                        identity_id,
                        identity_name,
                    }
                }
                Ok(SubmitOutcome::RejectedUnknown) => Resolution::Unknown {
                    confidence: result.confidence,
                    reasoning: result.reasoning,
                },
                Err(e) => Resolution::StorageFailure {
                    reason: e.to_string(),
                },
            }
        };

        tracing::info!(
            category = ?resolution.category(),
            message = %resolution.message(),
            "scan resolved"
        );
        self.transition(SessionEvent::Resolved(resolution.clone()))?;
        cycle.armed = false;
        Ok(resolution)
    }

    fn transition(&self, event: SessionEvent) -> Result<SessionState, SessionError> {
        let mut inner = self.lock_inner();
        self.decay(&mut inner);
        let next = inner.state.apply(event)?;
        tracing::debug!(from = ?inner.state, to = ?next, "session transition");
        inner.resolved_at = match &next {
            SessionState::Resolved { .. } => Some(Instant::now()),
            _ => None,
        };
        inner.state = next.clone();
        Ok(next)
    }

    fn decay(&self, inner: &mut Inner) {
        if let Some(at) = inner.resolved_at {
            if at.elapsed() >= self.display_interval {
                if let Ok(next) = inner.state.apply(SessionEvent::DisplayElapsed) {
                    inner.state = next;
                    inner.resolved_at = None;
                }
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resets the session to Idle if a scan future is dropped mid-cycle.
struct CycleGuard<'a> {
    session: &'a AttendanceSession,
    armed: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("scan cancelled; session back to idle");
            let _ = self.session.transition(SessionEvent::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use crate::orchestrator::testing::FakeOracle;
    use crate::persistence::{MemoryStore, SnapshotStore};
    use crate::types::IdentityCandidate;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCamera {
        result: Result<EncodedImage, CaptureError>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl FakeCamera {
        fn ok() -> Self {
            Self {
                result: Ok(EncodedImage::from_bytes(vec![0xff, 0xd8, 1])),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn denied() -> Self {
            Self {
                result: Err(CaptureError::PermissionDenied("/dev/video0".into())),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSource for FakeCamera {
        async fn capture_frame(&self) -> Result<EncodedImage, CaptureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.result.clone()
        }
    }

    struct Fixture {
        session: Arc<AttendanceSession>,
        oracle: Arc<FakeOracle>,
        camera: Arc<FakeCamera>,
        ana_id: String,
    }

    fn fixture(oracle: FakeOracle, camera: FakeCamera, enroll: bool) -> Fixture {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
        let mut registry = UserRegistry::load(store.clone());
        let ana_id = if enroll {
            registry
                .register(IdentityCandidate {
                    name: "Ana".into(),
                    department: "Eng".into(),
                    reference_image: EncodedImage::from_bytes(vec![1, 2, 3]),
                })
                .unwrap()
                .id
        } else {
            String::new()
        };
        let ledger = AttendanceLedger::load(store, DayBoundary::Local);
        let oracle = Arc::new(oracle);
        let camera = Arc::new(camera);
        let session = AttendanceSession::new(
            Arc::new(tokio::sync::Mutex::new(registry)),
            Arc::new(tokio::sync::Mutex::new(ledger)),
            MatchOrchestrator::new(oracle.clone()).with_timeout(Duration::from_secs(10)),
            camera.clone(),
        )
        .with_clock(|| Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        Fixture {
            session: Arc::new(session),
            oracle,
            camera,
            ana_id,
        }
    }

    #[test]
    fn test_transition_table() {
        let idle = SessionState::Idle;
        let capturing = idle.apply(SessionEvent::ScanRequested).unwrap();
        assert_eq!(capturing, SessionState::Capturing);
        assert_eq!(capturing.apply(SessionEvent::ScanRequested), Err(SessionError::Busy));
        let awaiting = capturing.apply(SessionEvent::FrameCaptured).unwrap();
        assert_eq!(awaiting.apply(SessionEvent::ScanRequested), Err(SessionError::Busy));
        let resolved = awaiting
            .apply(SessionEvent::Resolved(Resolution::OracleFailure {
                reason: "x".into(),
            }))
            .unwrap();
        assert_eq!(
            resolved.apply(SessionEvent::ScanRequested).unwrap(),
            SessionState::Capturing
        );
        assert_eq!(resolved.apply(SessionEvent::DisplayElapsed).unwrap(), SessionState::Idle);
        assert!(idle.apply(SessionEvent::FrameCaptured).is_err());
    }

    #[test]
    fn test_capture_failure_skips_awaiting() {
        let next = SessionState::Capturing
            .apply(SessionEvent::CaptureFailed(CaptureError::Unavailable("none".into())))
            .unwrap();
        match next {
            SessionState::Resolved { resolution } => {
                assert_eq!(resolution.category(), Category::SystemError);
                assert!(matches!(resolution, Resolution::CaptureFailed { .. }));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scan_records_then_reports_duplicate() {
        let f = fixture(FakeOracle::failing(), FakeCamera::ok(), true);
        f.oracle.set_match(Some(&f.ana_id), 0.92);

        let first = f.session.scan().await.unwrap();
        assert_eq!(first.category(), Category::Success);
        assert_eq!(first.message(), "Welcome, Ana!");

        let second = f.session.scan().await.unwrap();
        assert_eq!(
            second,
            Resolution::MatchedDuplicate {
                identity_id: f.ana_id.clone(),
                identity_name: "Ana".into()
            }
        );
        assert_eq!(f.session.ledger().lock().await.len(), 1);
        assert_eq!(f.oracle.calls(), 2);
    }

    #[test]
    fn test_details_use_boundary_zone() {
        let record = AttendanceRecord {
            id: "r1".into(),
            identity_id: "u1".into(),
            identity_name: "Ana".into(),
            department: "Eng".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 5).unwrap(),
            status: crate::types::AttendanceStatus::Present,
            confidence: Confidence::new(0.914),
        };
        let resolution = Resolution::MatchedNew { record };
        let plus_two = DayBoundary::Fixed(FixedOffset::east_opt(2 * 3600).unwrap());
        assert_eq!(
            resolution.details(plus_two).unwrap(),
            "Attendance marked at 09:00:05 (Confidence: 91%)"
        );
        let utc = DayBoundary::Fixed(FixedOffset::east_opt(0).unwrap());
        assert!(resolution.details(utc).unwrap().contains("07:00:05"));
        assert_eq!(
            Resolution::MatchedDuplicate {
                identity_id: "u1".into(),
                identity_name: "Ana".into()
            }
            .details(plus_two),
            None
        );
    }

    #[tokio::test]
    async fn test_unknown_face_is_recognition_negative() {
        let f = fixture(FakeOracle::answering(None, 0.2), FakeCamera::ok(), true);
        let resolution = f.session.scan().await.unwrap();
        assert_eq!(resolution.category(), Category::RecognitionNegative);
        assert_eq!(resolution.message(), "Face not recognized.");
        assert!(f.session.ledger().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_never_calls_oracle() {
        let f = fixture(FakeOracle::answering(None, 0.2), FakeCamera::denied(), true);
        let resolution = f.session.scan().await.unwrap();
        assert!(matches!(resolution, Resolution::CaptureFailed { .. }));
        assert_eq!(f.oracle.calls(), 0);
        assert!(f.session.ledger().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_oracle_failure_is_system_error() {
        let f = fixture(FakeOracle::failing(), FakeCamera::ok(), true);
        let resolution = f.session.scan().await.unwrap();
        assert_eq!(resolution.category(), Category::SystemError);
        assert_ne!(resolution.message(), "Face not recognized.");
        assert!(f.session.ledger().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = UserRegistry::load(store.clone());
        let ana = registry
            .register(IdentityCandidate {
                name: "Ana".into(),
                department: "Eng".into(),
                reference_image: EncodedImage::from_bytes(vec![1]),
            })
            .unwrap();
        let ledger = AttendanceLedger::load(store.clone(), DayBoundary::Local);
        let session = AttendanceSession::new(
            Arc::new(tokio::sync::Mutex::new(registry)),
            Arc::new(tokio::sync::Mutex::new(ledger)),
            MatchOrchestrator::new(Arc::new(FakeOracle::answering(Some(&ana.id), 0.9))),
            Arc::new(FakeCamera::ok()),
        );
        store.set_fail_saves(true);
        let resolution = session.scan().await.unwrap();
        assert!(matches!(resolution, Resolution::StorageFailure { .. }));
        assert!(session.ledger().lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scan_is_rejected() {
        let oracle = FakeOracle::answering(None, 0.1).delayed(Duration::from_secs(3));
        let f = fixture(oracle, FakeCamera::ok(), true);

        let session = f.session.clone();
        let running = tokio::spawn(async move { session.scan().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.session.state(), SessionState::Awaiting);
        assert_eq!(f.session.scan().await, Err(SessionError::Busy));

        let resolution = running.await.unwrap().unwrap();
        assert!(matches!(resolution, Resolution::Unknown { .. }));
        assert_eq!(f.oracle.calls(), 1);
        assert_eq!(f.camera.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_decays_to_idle() {
        let f = fixture(FakeOracle::answering(None, 0.1), FakeCamera::ok(), true);
        f.session.scan().await.unwrap();
        assert!(matches!(f.session.state(), SessionState::Resolved { .. }));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(f.session.state(), SessionState::Resolved { .. }));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_scan_ends_display_early() {
        let f = fixture(FakeOracle::answering(None, 0.1), FakeCamera::ok(), true);
        f.session.scan().await.unwrap();
        assert!(f.session.scan().await.is_ok());
        assert_eq!(f.oracle.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_scan_returns_to_idle() {
        let oracle = FakeOracle::answering(None, 0.1).delayed(Duration::from_secs(3));
        let f = fixture(oracle, FakeCamera::ok(), true);
        let outcome =
            tokio::time::timeout(Duration::from_secs(1), f.session.scan()).await;
        assert!(outcome.is_err());
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_registry_scan_is_unknown_without_oracle() {
        let f = fixture(FakeOracle::answering(Some("u1"), 0.9), FakeCamera::ok(), false);
        let resolution = f.session.scan().await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Unknown {
                confidence: Confidence::ZERO,
                reasoning: Some("no registered identities".into())
            }
        );
        assert_eq!(f.oracle.calls(), 0);
    }
}
