//! faceguard-hw: camera capture for the attendance kiosk.
//!
//! Opens a V4L2 device, rejects dark frames and hands back JPEG stills.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, StreamFormat};
pub use frame::{Frame, FrameError, Layout};
