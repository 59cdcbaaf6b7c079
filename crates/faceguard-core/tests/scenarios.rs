//! End-to-end kiosk scenarios against a SQLite snapshot store.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use faceguard_core::oracle::{ComparisonRequest, Oracle, OracleError, OracleResponse};
use faceguard_core::persistence::{SnapshotStore, SqliteStore};
use faceguard_core::session::Category;
use faceguard_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

struct ScriptedOracle {
    matched: Mutex<Option<String>>,
    confidence: f64,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(confidence: f64) -> Self {
        Self {
            matched: Mutex::new(None),
            confidence,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn set_match(&self, id: &str) {
        *self.matched.lock().unwrap() = Some(id.to_string());
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn compare(&self, _: &ComparisonRequest<'_>) -> Result<OracleResponse, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(OracleResponse {
            matched_user_id: self.matched.lock().unwrap().clone(),
            confidence: self.confidence,
            reasoning: "scripted".into(),
        })
    }
}

struct StillCamera;

#[async_trait]
impl FrameSource for StillCamera {
    async fn capture_frame(&self) -> Result<EncodedImage, CaptureError> {
        Ok(EncodedImage::from_bytes(vec![0xff, 0xd8, 0xff, 0xe0, 0x00]))
    }
}

struct Kiosk {
    session: AttendanceSession,
    oracle: Arc<ScriptedOracle>,
}

fn kiosk(store: Arc<dyn SnapshotStore>, oracle: ScriptedOracle, timeout: Duration) -> Kiosk {
    let oracle = Arc::new(oracle);
    let registry = UserRegistry::load(store.clone());
    let ledger = AttendanceLedger::load(store, DayBoundary::Local);
    let session = AttendanceSession::new(
        Arc::new(AsyncMutex::new(registry)),
        Arc::new(AsyncMutex::new(ledger)),
        MatchOrchestrator::new(oracle.clone()).with_timeout(timeout),
        Arc::new(StillCamera),
    )
    .with_clock(|| Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
    Kiosk { session, oracle }
}

fn ana() -> IdentityCandidate {
    IdentityCandidate {
        name: "Ana".into(),
        department: "Engineering".into(),
        reference_image: EncodedImage::from_bytes(vec![0xff, 0xd8, 1, 2, 3]),
    }
}

#[tokio::test]
async fn test_scenario_a_empty_registry() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open(dir.path().join("k.db")).unwrap());
    let k = kiosk(store, ScriptedOracle::new(0.9), Duration::from_secs(5));

    let resolution = k.session.scan().await.unwrap();
    match resolution {
        Resolution::Unknown { confidence, .. } => assert_eq!(confidence, Confidence::ZERO),
        other => panic!("unexpected resolution {other:?}"),
    }
    assert!(k.session.ledger().lock().await.is_empty());
    assert_eq!(k.oracle.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scenario_b_record_then_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("k.db");
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let k = kiosk(store, ScriptedOracle::new(0.92), Duration::from_secs(5));

    let u1 = k.session.registry().lock().await.register(ana()).unwrap();
    k.oracle.set_match(&u1.id);

    let first = k.session.scan().await.unwrap();
    let Resolution::MatchedNew { record } = &first else {
        panic!("expected a new record, got {first:?}");
    };
    assert_eq!(record.status, AttendanceStatus::Present);
    assert_eq!(record.confidence.value(), 0.92);
    assert_eq!(record.identity_name, "Ana");

    let second = k.session.scan().await.unwrap();
    assert!(matches!(second, Resolution::MatchedDuplicate { .. }));
    assert_eq!(second.category(), Category::Informational);
    assert_eq!(k.session.ledger().lock().await.len(), 1);

    // The record survives a restart.
    drop(k);
    let reopened: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let ledger = AttendanceLedger::load(reopened, DayBoundary::Local);
    assert_eq!(ledger.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_oracle_timeout() {
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut oracle = ScriptedOracle::new(0.92);
    oracle.delay = Some(Duration::from_secs(120));
    let k = kiosk(store, oracle, Duration::from_secs(20));

    let u1 = k.session.registry().lock().await.register(ana()).unwrap();
    k.oracle.set_match(&u1.id);

    let resolution = k.session.scan().await.unwrap();
    assert!(matches!(resolution, Resolution::OracleFailure { .. }));
    assert_eq!(resolution.category(), Category::SystemError);
    assert_ne!(resolution.message(), "Face not recognized.");
    assert!(k.session.ledger().lock().await.is_empty());
}

#[tokio::test]
async fn test_round_trip_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("k.db");
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open(&path).unwrap());

    let mut registry = UserRegistry::load(store.clone());
    let mut ledger = AttendanceLedger::load(store.clone(), DayBoundary::Local);
    for n in 0..3 {
        registry
            .register(IdentityCandidate {
                name: format!("person {n}"),
                department: "Ops".into(),
                reference_image: EncodedImage::from_bytes(vec![n as u8; 16]),
            })
            .unwrap();
    }
    // Full-precision confidences as the oracle returns them.
    let confidences = [0.36751094992643507, 0.1 + 0.2];
    for (day, identity) in registry.identities().iter().take(2).enumerate() {
        let result = MatchResult {
            matched_identity_id: Some(identity.id.clone()),
            confidence: Confidence::new(confidences[day]),
            reasoning: None,
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 2 + day as u32, 12, 0, 0).unwrap();
        ledger.submit(&result, &registry, now).unwrap();
    }

    let reopened: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let registry2 = UserRegistry::load(reopened.clone());
    let ledger2 = AttendanceLedger::load(reopened, DayBoundary::Local);
    assert_eq!(registry2.identities(), registry.identities());
    assert_eq!(ledger2.records(), ledger.records());
    let mut reloaded: Vec<f64> = ledger2.records().iter().map(|r| r.confidence.value()).collect();
    reloaded.reverse();
    assert_eq!(reloaded, confidences);
}
