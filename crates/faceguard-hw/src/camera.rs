//! Kiosk camera: open a V4L2 node, settle exposure, grab a usable still.

use crate::frame::{self, Frame, FrameError, Layout};
use std::io;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const PREFERRED_WIDTH: u32 = 640;
const PREFERRED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Share of near-black pixels above which a frame is discarded.
const DARK_SHARE: f32 = 0.95;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("{0} is in use by another process")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("{op} on {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("driver offered {0}; only YUYV and GREY are supported")]
    UnsupportedFormat(String),
    #[error("no usable frame after {0} attempts (all too dark)")]
    NoUsableFrame(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Pixel encodings the kiosk can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2, decoded to RGB.
    Yuyv,
    /// 8-bit luma only.
    Grey,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }
}

/// What the driver agreed to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixel: PixelFormat,
}

/// A capture node found under /dev.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

pub struct Camera {
    device: Device,
    path: String,
    format: StreamFormat,
}

impl Camera {
    /// Open `path` and negotiate 640x480 YUYV, falling back to GREY.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        let device = Device::with_path(path).map_err(|e| classify_open_error(path, e))?;

        let caps = device.query_caps().map_err(|source| CameraError::Io {
            op: "query capabilities",
            path: path.to_string(),
            source,
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::NotCaptureDevice(path.to_string()));
        }

        let format = negotiate(&device, path)?;
        tracing::info!(
            device = path,
            card = %caps.card,
            driver = %caps.driver,
            width = format.width,
            height = format.height,
            pixel = ?format.pixel,
            "camera ready"
        );

        Ok(Self {
            device,
            path: path.to_string(),
            format,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Throw away `count` frames while auto-exposure settles.
    pub fn warm_up(&self, count: usize) -> Result<(), CameraError> {
        if count == 0 {
            return Ok(());
        }
        let mut stream = self.stream()?;
        for _ in 0..count {
            stream.next().map_err(|e| self.io_error("dequeue", e))?;
        }
        tracing::debug!(count, "warm-up done");
        Ok(())
    }

    /// JPEG of the first frame out of `attempts` that is not too dark.
    pub fn capture_still(&self, attempts: usize, quality: u8) -> Result<Vec<u8>, CameraError> {
        let attempts = attempts.max(1);
        let mut stream = self.stream()?;

        for attempt in 1..=attempts {
            let (buf, meta) = stream.next().map_err(|e| self.io_error("dequeue", e))?;
            match decode(buf, self.format, meta.sequence)? {
                Some(frame) => {
                    let jpeg = frame.to_jpeg(quality)?;
                    tracing::debug!(attempt, bytes = jpeg.len(), "still captured");
                    return Ok(jpeg);
                }
                None => tracing::debug!(attempt, "dark frame discarded"),
            }
        }

        Err(CameraError::NoUsableFrame(attempts))
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| self.io_error("start stream", e))
    }

    fn io_error(&self, op: &'static str, source: io::Error) -> CameraError {
        CameraError::Io {
            op,
            path: self.path.clone(),
            source,
        }
    }

    /// Every V4L2 node that can capture video.
    pub fn list_devices() -> Vec<DeviceInfo> {
        v4l::context::enum_devices()
            .into_iter()
            .filter_map(|node| {
                let path = node.path().to_string_lossy().into_owned();
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

fn negotiate(device: &Device, path: &str) -> Result<StreamFormat, CameraError> {
    let mut requested = device.format().map_err(|source| CameraError::Io {
        op: "read format",
        path: path.to_string(),
        source,
    })?;
    requested.fourcc = PixelFormat::Yuyv.fourcc();
    requested.width = PREFERRED_WIDTH;
    requested.height = PREFERRED_HEIGHT;

    let granted = device.set_format(&requested).map_err(|source| CameraError::Io {
        op: "set format",
        path: path.to_string(),
        source,
    })?;
    let pixel = PixelFormat::from_fourcc(granted.fourcc)
        .ok_or_else(|| CameraError::UnsupportedFormat(granted.fourcc.to_string()))?;

    Ok(StreamFormat {
        width: granted.width,
        height: granted.height,
        pixel,
    })
}

fn classify_open_error(path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(path.to_string()),
        _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy(path.to_string()),
        _ => CameraError::Io {
            op: "open",
            path: path.to_string(),
            source: e,
        },
    }
}

/// Turn a raw driver buffer into a frame; `None` when it is too dark to use.
fn decode(buf: &[u8], format: StreamFormat, sequence: u32) -> Result<Option<Frame>, CameraError> {
    let StreamFormat { width, height, pixel } = format;

    let (luma, data, layout) = match pixel {
        PixelFormat::Grey => {
            let pixels = width as usize * height as usize;
            let gray = buf.get(..pixels).ok_or(FrameError::InvalidLength {
                expected: pixels,
                actual: buf.len(),
            })?;
            (gray.to_vec(), None, Layout::Luma)
        }
        PixelFormat::Yuyv => (
            frame::yuyv_to_grayscale(buf, width, height)?,
            Some(buf),
            Layout::Rgb,
        ),
    };

    if frame::is_dark_frame(&luma, DARK_SHARE) {
        return Ok(None);
    }

    let data = match data {
        Some(yuyv) => frame::yuyv_to_rgb(yuyv, width, height)?,
        None => luma,
    };
    Ok(Some(Frame {
        data,
        width,
        height,
        layout,
        sequence,
    }))
}
