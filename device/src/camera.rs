use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tracing::{debug, info, trace, warn};
use wastecam_common::config::CameraConfig;
use wastecam_common::frame::{CaptureInfo, PixelFormat};

/// The capture primitive behind the frame source.
///
/// A driver writes one frame into the caller's buffer and reports what it
/// wrote. It never keeps a reference to the buffer between calls.
pub trait CameraDriver: Send {
    fn capture(&mut self, buf: &mut [u8]) -> Result<CaptureInfo, DriverError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("frame of {needed} bytes does not fit the {capacity}-byte capture buffer")]
    Overflow { needed: usize, capacity: usize },
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to read frame: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera busy: a frame is already outstanding")]
    DeviceBusy,
    #[error("camera capture failed: {0}")]
    HardwareFault(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CameraInitError {
    #[error("unknown camera driver '{0}', expected 'synthetic' or 'directory'")]
    UnknownDriver(String),
    #[error("camera.frames_dir is required by the directory driver")]
    MissingFramesDir,
    #[error("failed to read frames directory {0}: {1}")]
    ReadDir(String, std::io::Error),
    #[error("no .jpg frames found in {0}")]
    NoFrames(String),
    #[error("invalid camera resolution {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },
    #[error("capture buffer must not be empty")]
    EmptyBuffer,
    #[error("first capture failed: {0}")]
    FirstCapture(String),
}

/// Owns the camera driver and the single reusable capture buffer.
///
/// At most one [`Frame`] borrows the buffer at a time. Frames go back to the
/// source when dropped, so every exit path of the renting code returns them.
pub struct FrameSource {
    driver: Box<dyn CameraDriver>,
    buffer: Box<[u8]>,
    outstanding: bool,
    seq: u64,
}

impl FrameSource {
    pub fn new(driver: Box<dyn CameraDriver>, buffer_bytes: usize) -> Self {
        Self {
            driver,
            buffer: vec![0u8; buffer_bytes].into_boxed_slice(),
            outstanding: false,
            seq: 0,
        }
    }

    /// Build the source and run one capture, so a dead camera fails
    /// at startup instead of on the first cycle.
    pub fn open(driver: Box<dyn CameraDriver>, buffer_bytes: usize) -> Result<Self, CameraInitError> {
        if buffer_bytes == 0 {
            return Err(CameraInitError::EmptyBuffer);
        }
        let mut source = Self::new(driver, buffer_bytes);
        {
            let frame = source
                .acquire()
                .map_err(|e| CameraInitError::FirstCapture(e.to_string()))?;
            info!(
                driver = frame.driver_name,
                format = %frame.format(),
                width = frame.width(),
                height = frame.height(),
                bytes = frame.len(),
                "camera initialized"
            );
        }
        Ok(source)
    }

    /// Capture into the shared buffer and rent it out.
    pub fn acquire(&mut self) -> Result<Frame<'_>, CaptureError> {
        if self.outstanding {
            return Err(CaptureError::DeviceBusy);
        }

        let capacity = self.buffer.len();
        let info = self.driver.capture(&mut self.buffer).map_err(|e| {
            warn!(driver = self.driver.name(), error = %e, "capture failed");
            CaptureError::HardwareFault(e.to_string())
        })?;
        if info.len > capacity {
            return Err(CaptureError::HardwareFault(
                DriverError::Overflow {
                    needed: info.len,
                    capacity,
                }
                .to_string(),
            ));
        }

        self.seq += 1;
        self.outstanding = true;
        trace!(seq = self.seq, bytes = info.len, "frame rented");

        Ok(Frame {
            data: &self.buffer[..info.len],
            info,
            captured_at_ms: Utc::now().timestamp_millis(),
            seq: self.seq,
            driver_name: self.driver.name(),
            outstanding: &mut self.outstanding,
        })
    }

    #[cfg(test)]
    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }
}

/// A rented view of the capture buffer.
pub struct Frame<'a> {
    data: &'a [u8],
    info: CaptureInfo,
    captured_at_ms: i64,
    seq: u64,
    driver_name: &'a str,
    outstanding: &'a mut bool,
}

impl<'a> Frame<'a> {
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Hand the buffer back to the source. Dropping the frame does the same.
    pub fn release(self) {}
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        debug_assert!(*self.outstanding, "frame {} released twice", self.seq);
        *self.outstanding = false;
        trace!(seq = self.seq, "frame released");
    }
}

/// Pick the driver named in the camera config.
pub fn build_driver(config: &CameraConfig) -> Result<Box<dyn CameraDriver>, CameraInitError> {
    match config.driver.as_str() {
        "synthetic" => Ok(Box::new(SyntheticCamera::new(
            config.width,
            config.height,
            config.jpeg_quality,
        )?)),
        "directory" => {
            let dir = config
                .frames_dir
                .as_deref()
                .ok_or(CameraInitError::MissingFramesDir)?;
            Ok(Box::new(DirectoryCamera::open(Path::new(dir))?))
        }
        other => Err(CameraInitError::UnknownDriver(other.to_string())),
    }
}

/// Renders a moving test pattern and JPEG-encodes it into the capture buffer.
///
/// A coloured block sweeps across a gradient, changing tint every pass, so
/// consecutive classification cycles see different dominant colours.
pub struct SyntheticCamera {
    canvas: RgbImage,
    quality: u8,
    tick: u32,
}

const PALETTE: [[u8; 3]; 6] = [
    [200, 40, 40],
    [40, 180, 60],
    [150, 100, 40],
    [60, 80, 200],
    [160, 160, 160],
    [230, 200, 40],
];

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, quality: u8) -> Result<Self, CameraInitError> {
        if width == 0 || height == 0 {
            return Err(CameraInitError::InvalidResolution { width, height });
        }
        Ok(Self {
            canvas: RgbImage::new(width, height),
            quality: quality.clamp(1, 100),
            tick: 0,
        })
    }

    fn render(&mut self) {
        let (width, height) = self.canvas.dimensions();
        let block = (width / 3).max(1);
        let pass = self.tick / width.max(1);
        let offset = self.tick % width.max(1);
        let tint = PALETTE[pass as usize % PALETTE.len()];

        for (x, y, pixel) in self.canvas.enumerate_pixels_mut() {
            let in_block = x.wrapping_sub(offset) < block;
            *pixel = if in_block {
                Rgb(tint)
            } else {
                let shade = ((x + y) * 255 / (width + height)) as u8;
                Rgb([shade / 2, shade / 2, shade / 2])
            };
        }
        self.tick = self.tick.wrapping_add(8);
    }
}

impl CameraDriver for SyntheticCamera {
    fn capture(&mut self, buf: &mut [u8]) -> Result<CaptureInfo, DriverError> {
        self.render();
        let (width, height) = self.canvas.dimensions();
        let mut cursor = Cursor::new(buf);
        JpegEncoder::new_with_quality(&mut cursor, self.quality)
            .encode_image(&self.canvas)
            .map_err(|e| DriverError::Encode(e.to_string()))?;
        Ok(CaptureInfo {
            format: PixelFormat::Jpeg,
            len: cursor.position() as usize,
            width,
            height,
        })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Replays the `.jpg` files of a directory in name order, looping.
pub struct DirectoryCamera {
    frames: Vec<(PathBuf, u32, u32)>,
    next: usize,
}

impl DirectoryCamera {
    pub fn open(dir: &Path) -> Result<Self, CameraInitError> {
        let dir_name = dir.display().to_string();
        let entries =
            std::fs::read_dir(dir).map_err(|e| CameraInitError::ReadDir(dir_name.clone(), e))?;

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("jpg" | "jpeg" | "JPG" | "JPEG")
                )
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            match image::image_dimensions(&path) {
                Ok((w, h)) => frames.push((path, w, h)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
            }
        }
        if frames.is_empty() {
            return Err(CameraInitError::NoFrames(dir_name));
        }

        debug!(dir = dir_name, frames = frames.len(), "directory camera loaded");
        Ok(Self { frames, next: 0 })
    }
}

impl CameraDriver for DirectoryCamera {
    fn capture(&mut self, buf: &mut [u8]) -> Result<CaptureInfo, DriverError> {
        let (path, width, height) = &self.frames[self.next];
        self.next = (self.next + 1) % self.frames.len();

        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len > buf.len() {
            return Err(DriverError::Overflow {
                needed: len,
                capacity: buf.len(),
            });
        }
        file.read_exact(&mut buf[..len])?;

        Ok(CaptureInfo {
            format: PixelFormat::Jpeg,
            len,
            width: *width,
            height: *height,
        })
    }

    fn name(&self) -> &str {
        "directory"
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn acquire_and_release_by_drop() {
        let mut source = FrameSource::new(Box::new(StaticCamera::jpeg(vec![1, 2, 3])), 16);
        {
            let frame = source.acquire().unwrap();
            assert_eq!(frame.data(), &[1, 2, 3]);
            assert_eq!(frame.format(), PixelFormat::Jpeg);
            assert_eq!(frame.seq(), 1);
        }
        assert!(!source.is_outstanding());
        let frame = source.acquire().unwrap();
        assert_eq!(frame.seq(), 2);
        frame.release();
        assert!(!source.is_outstanding());
    }

    #[test]
    fn leaked_frame_keeps_device_busy() {
        let mut source = FrameSource::new(Box::new(StaticCamera::jpeg(vec![9; 4])), 16);
        std::mem::forget(source.acquire().unwrap());
        assert!(source.is_outstanding());
        assert!(matches!(source.acquire(), Err(CaptureError::DeviceBusy)));
    }

    #[test]
    fn driver_failure_is_hardware_fault() {
        let camera = StaticCamera::jpeg(vec![1]);
        camera.fail.store(true, Ordering::SeqCst);
        let mut source = FrameSource::new(Box::new(camera), 16);
        assert!(matches!(source.acquire(), Err(CaptureError::HardwareFault(_))));
        assert!(!source.is_outstanding());
    }

    #[test]
    fn oversized_frame_is_hardware_fault() {
        let mut source = FrameSource::new(Box::new(StaticCamera::jpeg(vec![0; 64])), 16);
        assert!(matches!(source.acquire(), Err(CaptureError::HardwareFault(_))));
    }

    #[test]
    fn open_fails_when_first_capture_fails() {
        let camera = StaticCamera::jpeg(vec![1]);
        camera.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            FrameSource::open(Box::new(camera), 16),
            Err(CameraInitError::FirstCapture(_))
        ));
        assert!(matches!(
            FrameSource::open(Box::new(StaticCamera::jpeg(vec![1])), 0),
            Err(CameraInitError::EmptyBuffer)
        ));
    }

    #[test]
    fn synthetic_camera_produces_decodable_jpeg() {
        let camera = SyntheticCamera::new(64, 48, 80).unwrap();
        let mut source = FrameSource::new(Box::new(camera), 64 * 1024);
        let frame = source.acquire().unwrap();
        assert_eq!(frame.format(), PixelFormat::Jpeg);
        assert_eq!(&frame.data()[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(frame.data()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn synthetic_camera_rejects_zero_resolution() {
        assert!(matches!(
            SyntheticCamera::new(0, 10, 80),
            Err(CameraInitError::InvalidResolution { .. })
        ));
    }

    #[test]
    fn synthetic_frame_too_big_for_buffer() {
        let camera = SyntheticCamera::new(64, 48, 80).unwrap();
        let mut source = FrameSource::new(Box::new(camera), 32);
        assert!(matches!(source.acquire(), Err(CaptureError::HardwareFault(_))));
    }

    #[test]
    fn directory_camera_loops_in_name_order() {
        let dir = std::env::temp_dir().join(format!("wastecam-dir-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = solid_jpeg(8, 8, [255, 0, 0]);
        let second = solid_jpeg(16, 8, [0, 0, 255]);
        std::fs::write(dir.join("b.jpg"), &second).unwrap();
        std::fs::write(dir.join("a.jpg"), &first).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let camera = DirectoryCamera::open(&dir).unwrap();
        let mut source = FrameSource::new(Box::new(camera), 64 * 1024);
        assert_eq!(source.acquire().unwrap().data(), first.as_slice());
        let frame = source.acquire().unwrap();
        assert_eq!(frame.data(), second.as_slice());
        assert_eq!(frame.width(), 16);
        drop(frame);
        assert_eq!(source.acquire().unwrap().data(), first.as_slice());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn directory_camera_without_frames_fails() {
        let dir = std::env::temp_dir().join(format!("wastecam-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            DirectoryCamera::open(&dir),
            Err(CameraInitError::NoFrames(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
