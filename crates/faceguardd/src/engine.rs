use async_trait::async_trait;
use faceguard_core::{CaptureError, EncodedImage, FrameSource};
use faceguard_hw::{Camera, CameraError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn camera thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("camera thread exited")]
    ChannelClosed,
}

impl From<EngineError> for CaptureError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Camera(CameraError::PermissionDenied(path)) => {
                CaptureError::PermissionDenied(path)
            }
            EngineError::Camera(
                e @ (CameraError::DeviceNotFound(_)
                | CameraError::DeviceBusy(_)
                | CameraError::NotCaptureDevice(_)),
            ) => CaptureError::Unavailable(e.to_string()),
            EngineError::Camera(e) => CaptureError::Failed(e.to_string()),
            e @ (EngineError::Spawn(_) | EngineError::ChannelClosed) => {
                CaptureError::Unavailable(e.to_string())
            }
        }
    }
}

/// Capture settings handed to the camera thread.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub warmup_frames: usize,
    pub attempts: usize,
    pub jpeg_quality: u8,
}

enum EngineRequest {
    Capture {
        reply: oneshot::Sender<Result<Vec<u8>, EngineError>>,
    },
}

/// Clone-safe handle to the camera thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    camera_open: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Capture one JPEG still.
    pub async fn capture(&self) -> Result<Vec<u8>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Whether the device is currently held open by the camera thread.
    pub fn camera_open(&self) -> bool {
        self.camera_open.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for EngineHandle {
    async fn capture_frame(&self) -> Result<EncodedImage, CaptureError> {
        let jpeg = self.capture().await?;
        Ok(EncodedImage::from_bytes(jpeg))
    }
}

/// Spawn the camera worker on a dedicated OS thread.
///
/// The device is opened on first use and dropped again after a device-level
/// failure, so an unplugged or busy camera recovers on the next request
/// without restarting the daemon.
pub fn spawn_engine(settings: CaptureSettings) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let camera_open = Arc::new(AtomicBool::new(false));
    let open_flag = camera_open.clone();

    std::thread::Builder::new()
        .name("faceguard-camera".into())
        .spawn(move || {
            tracing::info!(device = %settings.device, "camera thread started");
            let mut camera: Option<Camera> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { reply } => {
                        let result = run_capture(&mut camera, &settings);
                        open_flag.store(camera.is_some(), Ordering::Relaxed);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("camera thread exiting");
        })?;

    Ok(EngineHandle { tx, camera_open })
}

fn run_capture(
    camera: &mut Option<Camera>,
    settings: &CaptureSettings,
) -> Result<Vec<u8>, EngineError> {
    let cam = match camera.take() {
        Some(cam) => cam,
        None => {
            let opened = Camera::open(&settings.device)?;
            opened.warm_up(settings.warmup_frames)?;
            opened
        }
    };

    match cam.capture_still(settings.attempts, settings.jpeg_quality) {
        Ok(jpeg) => {
            *camera = Some(cam);
            Ok(jpeg)
        }
        // Dark frames are a scene problem; keep the device.
        Err(e @ CameraError::NoUsableFrame(_)) => {
            *camera = Some(cam);
            Err(e.into())
        }
        Err(e) => {
            tracing::warn!(error = %e, "capture failed; releasing camera");
            Err(e.into())
        }
    }
}
