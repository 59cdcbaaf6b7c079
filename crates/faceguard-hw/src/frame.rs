//! Decoded frames, YUYV conversion, dark-frame rejection and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Pixel layout of [`Frame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 8-bit grayscale, 1 byte/pixel.
    Luma,
    /// 8-bit RGB, 3 bytes/pixel.
    Rgb,
}

impl Layout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Layout::Luma => 1,
            Layout::Rgb => 3,
        }
    }
}

/// A decoded camera frame.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: Layout,
    pub sequence: u32,
}

impl Frame {
    /// Encode as a baseline JPEG at the given quality (1–100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let expected = self.width as usize * self.height as usize * self.layout.bytes_per_pixel();
        if self.data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        let color = match self.layout {
            Layout::Luma => ExtendedColorType::L8,
            Layout::Rgb => ExtendedColorType::Rgb8,
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data[..expected], self.width, self.height, color)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Luma plane of a packed YUYV buffer (every even byte).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let packed = packed_yuyv(yuyv, width, height)?;
    Ok(packed.iter().step_by(2).copied().collect())
}

fn packed_yuyv(yuyv: &[u8], width: u32, height: u32) -> Result<&[u8], FrameError> {
    let expected = width as usize * height as usize * 2;
    yuyv.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 studio-range coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let packed = packed_yuyv(yuyv, width, height)?;
    let mut rgb = Vec::with_capacity(packed.len() / 2 * 3);
    for chunk in packed.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

const BLACK_LEVEL: u8 = 32;

/// True when more than `max_share` of the pixels sit below the black level.
/// An empty frame counts as dark.
pub fn is_dark_frame(gray: &[u8], max_share: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let black = gray.iter().filter(|&&p| p < BLACK_LEVEL).count();
    black as f32 > max_share * gray.len() as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grayscale_keeps_luma_samples() {
        let gray = yuyv_to_grayscale(&[40, 90, 220, 160, 7, 128, 99, 128], 4, 1).unwrap();
        assert_eq!(gray, vec![40, 220, 7, 99]);
    }

    #[test]
    fn test_conversions_reject_truncated_buffers() {
        let half = [50u8; 4];
        assert!(matches!(
            yuyv_to_grayscale(&half, 4, 1),
            Err(FrameError::InvalidLength { expected: 8, actual: 4 })
        ));
        assert!(yuyv_to_rgb(&half, 4, 1).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_dominant() {
        let rgb = yuyv_to_rgb(&[82, 90, 82, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200, "red channel {}", rgb[0]);
        assert!(rgb[1] < 50 && rgb[2] < 50);
    }

    #[test]
    fn test_dark_detection() {
        for (gray, dark) in [
            (vec![], true),
            (vec![0u8; 100], true),
            (vec![200u8; 100], false),
        ] {
            assert_eq!(is_dark_frame(&gray, 0.95), dark, "{} pixels", gray.len());
        }

        // Mostly black room with a lit face in frame.
        let mut scene = vec![5u8; 90];
        scene.extend([150u8; 10]);
        assert!(!is_dark_frame(&scene, 0.95));
    }

    #[test]
    fn test_to_jpeg_produces_jpeg_magic() {
        let frame = Frame {
            data: vec![128u8; 16 * 16 * 3],
            width: 16,
            height: 16,
            layout: Layout::Rgb,
            sequence: 0,
        };
        let jpeg = frame.to_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn test_to_jpeg_rejects_short_buffer() {
        let frame = Frame {
            data: vec![0u8; 10],
            width: 16,
            height: 16,
            layout: Layout::Luma,
            sequence: 0,
        };
        assert!(matches!(frame.to_jpeg(85), Err(FrameError::InvalidLength { .. })));
    }
}
