use anyhow::{Context, Result};
use faceguard_core::ledger::LedgerEvent;
use faceguard_core::oracle::GeminiOracle;
use faceguard_core::persistence::{SnapshotStore, SqliteStore};
use faceguard_core::{AttendanceLedger, AttendanceSession, MatchOrchestrator, UserRegistry};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FaceGuardService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceguardd starting");

    let config = config::Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        boundary = ?config.day_boundary(),
        "configuration loaded"
    );

    let store: Arc<dyn SnapshotStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let registry = UserRegistry::load(store.clone());
    let ledger = AttendanceLedger::load(store, config.day_boundary());
    tracing::info!(
        identities = registry.len(),
        records = ledger.len(),
        "stores loaded"
    );
    let mut ledger_events = ledger.subscribe();

    let api_key = config.oracle_api_key.clone().unwrap_or_else(|| {
        tracing::warn!("no oracle API key set (FACEGUARD_ORACLE_API_KEY / GEMINI_API_KEY); scans will fail");
        String::new()
    });
    let oracle_configured = !api_key.is_empty();
    let oracle = GeminiOracle::new(api_key)
        .with_endpoint(config.oracle_endpoint.clone())
        .with_model(config.oracle_model.clone());
    let oracle_model = oracle.model().to_string();
    let orchestrator =
        MatchOrchestrator::new(Arc::new(oracle)).with_timeout(config.oracle_timeout());
    tracing::info!(
        model = %oracle_model,
        timeout_secs = orchestrator.timeout().as_secs(),
        "oracle configured"
    );

    let engine = engine::spawn_engine(engine::CaptureSettings {
        device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
        attempts: config.capture_attempts,
        jpeg_quality: config.jpeg_quality,
    })?;

    let session = Arc::new(
        AttendanceSession::new(
            Arc::new(Mutex::new(registry)),
            Arc::new(Mutex::new(ledger)),
            orchestrator,
            Arc::new(engine.clone()),
        )
        .with_display_interval(config.display_interval()),
    );

    let service = FaceGuardService::new(
        session,
        engine,
        oracle_model,
        oracle_configured,
    );

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    let iface = connection
        .object_server()
        .interface::<_, FaceGuardService>(OBJECT_PATH)
        .await?;
    tokio::spawn(async move {
        loop {
            match ledger_events.recv().await {
                Ok(LedgerEvent::Recorded(record)) => {
                    let payload = match serde_json::to_string(&record) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, "could not encode record for signal");
                            continue;
                        }
                    };
                    if let Err(e) =
                        FaceGuardService::attendance_recorded(iface.signal_emitter(), &payload).await
                    {
                        tracing::warn!(error = %e, "failed to emit AttendanceRecorded");
                    }
                }
                Ok(LedgerEvent::Cleared { removed }) => {
                    tracing::debug!(removed, "ledger cleared");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ledger subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        "faceguardd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceguardd shutting down");

    Ok(())
}
