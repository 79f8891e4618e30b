use serde::{Deserialize, Serialize};

/// Native encoding of the bytes a camera driver writes into the capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Compressed JPEG, variable length.
    Jpeg,
    /// Interleaved 8-bit R, G, B.
    Rgb888,
    /// Packed 16-bit 5:6:5, big-endian as delivered by the sensor.
    Rgb565,
    /// 8-bit luma.
    Grayscale,
}

impl PixelFormat {
    /// Bytes per pixel for raw formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgb565 => Some(2),
            PixelFormat::Grayscale => Some(1),
        }
    }

    /// Expected byte length of a raw frame at the given resolution.
    pub fn raw_len(self, width: u32, height: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            PixelFormat::Jpeg => "image/jpeg",
            _ => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Rgb888 => "rgb888",
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Grayscale => "grayscale",
        };
        f.write_str(name)
    }
}

/// What a driver reports after filling the capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInfo {
    pub format: PixelFormat,
    /// Number of valid bytes at the start of the buffer.
    pub len: usize,
    pub width: u32,
    pub height: u32,
}
