use crate::engine::EngineHandle;
use chrono::{DateTime, Utc};
use faceguard_core::registry::RegistryError;
use faceguard_core::{
    AttendanceSession, DashboardStats, EncodedImage, FrameSource, Identity, IdentityCandidate,
};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.freedesktop.FaceGuard1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceGuard1";

/// D-Bus interface for the FaceGuard attendance daemon.
///
/// Bus name: org.freedesktop.FaceGuard1
/// Object path: /org/freedesktop/FaceGuard1
pub struct FaceGuardService {
    session: Arc<AttendanceSession>,
    engine: EngineHandle,
    oracle_model: String,
    oracle_configured: bool,
}

impl FaceGuardService {
    pub fn new(
        session: Arc<AttendanceSession>,
        engine: EngineHandle,
        oracle_model: impl Into<String>,
        oracle_configured: bool,
    ) -> Self {
        Self {
            session,
            engine,
            oracle_model: oracle_model.into(),
            oracle_configured,
        }
    }

    async fn add_identity(
        &self,
        name: &str,
        department: &str,
        reference_image: EncodedImage,
    ) -> zbus::fdo::Result<String> {
        let candidate = IdentityCandidate {
            name: name.to_string(),
            department: department.to_string(),
            reference_image,
        };
        let identity = self
            .session
            .registry()
            .lock()
            .await
            .register(candidate)
            .map_err(registry_error)?;
        to_json(&IdentitySummary::from(&identity))
    }
}

/// Identity as exposed over the bus; the reference image stays in the daemon.
#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: &'a str,
    name: &'a str,
    department: &'a str,
    registered_at: DateTime<Utc>,
}

impl<'a> From<&'a Identity> for IdentitySummary<'a> {
    fn from(identity: &'a Identity) -> Self {
        Self {
            id: &identity.id,
            name: &identity.name,
            department: &identity.department,
            registered_at: identity.registered_at,
        }
    }
}

fn registry_error(e: RegistryError) -> zbus::fdo::Error {
    match e {
        RegistryError::Validation(v) => zbus::fdo::Error::InvalidArgs(v.to_string()),
        RegistryError::Persistence(p) => zbus::fdo::Error::Failed(p.to_string()),
    }
}

/// Decode a `data:image/...;base64,` URL (or bare base64) sent by a web client.
fn decode_data_url(photo: &str) -> zbus::fdo::Result<EncodedImage> {
    EncodedImage::from_data_url(photo)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("photo is not valid base64: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.FaceGuard1")]
impl FaceGuardService {
    /// Register an identity from an uploaded reference photo.
    async fn register(
        &self,
        name: &str,
        department: &str,
        photo: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, department, bytes = photo.len(), "register requested");
        self.add_identity(name, department, EncodedImage::from_bytes(photo))
            .await
    }

    /// Register an identity from a base64 data URL.
    async fn register_data_url(
        &self,
        name: &str,
        department: &str,
        photo: &str,
    ) -> zbus::fdo::Result<String> {
        let image = decode_data_url(photo)?;
        tracing::info!(
            name,
            department,
            mime = %image.mime_type,
            bytes = image.len(),
            "register requested"
        );
        self.add_identity(name, department, image).await
    }

    /// Register an identity using the kiosk camera for the reference photo.
    async fn enroll(&self, name: &str, department: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, department, "enroll requested");
        if self.session.state().is_busy() {
            return Err(zbus::fdo::Error::Failed("a scan is in progress".into()));
        }
        let photo = self
            .engine
            .capture_frame()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        self.add_identity(name, department, photo).await
    }

    /// Run one scan cycle and return its resolution.
    async fn scan(&self) -> zbus::fdo::Result<String> {
        tracing::info!("scan requested");
        let resolution = self
            .session
            .scan()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let boundary = self.session.ledger().lock().await.boundary();
        Ok(serde_json::json!({
            "category": resolution.category(),
            "message": resolution.message(),
            "details": resolution.details(boundary),
            "resolution": resolution,
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let identities = self.session.registry().lock().await.len();
        let ledger = self.session.ledger().lock().await;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": self.session.state(),
            "camera_open": self.engine.camera_open(),
            "oracle_model": self.oracle_model,
            "oracle_configured": self.oracle_configured,
            "oracle_timeout_secs": self.session.orchestrator().timeout().as_secs(),
            "identities": identities,
            "records": ledger.len(),
        })
        .to_string())
    }

    /// List registered identities, oldest first, without reference images.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let registry = self.session.registry().lock().await;
        let summaries: Vec<IdentitySummary<'_>> =
            registry.identities().iter().map(IdentitySummary::from).collect();
        to_json(&summaries)
    }

    /// List attendance records, newest first. `limit` 0 returns all of them.
    async fn list_records(&self, limit: u32) -> zbus::fdo::Result<String> {
        let ledger = self.session.ledger().lock().await;
        let records = if limit == 0 {
            ledger.records()
        } else {
            ledger.recent(limit as usize)
        };
        to_json(records)
    }

    /// Remove every attendance record. Returns how many were removed.
    async fn clear_attendance(&self) -> zbus::fdo::Result<u32> {
        let removed = self
            .session
            .ledger()
            .lock()
            .await
            .clear()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        tracing::info!(removed, "attendance cleared");
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Dashboard figures for today.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let registry = self.session.registry().lock().await;
        let ledger = self.session.ledger().lock().await;
        to_json(&DashboardStats::from_ledger(
            registry.identities(),
            &ledger,
            Utc::now(),
        ))
    }

    /// Emitted for every newly recorded attendance entry (JSON record).
    #[zbus(signal)]
    pub async fn attendance_recorded(emitter: &SignalEmitter<'_>, record: &str)
        -> zbus::Result<()>;
}
