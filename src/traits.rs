//! Collaborator traits and frame types shared by the acquisition core.

use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::config::CaptureConfig;

/// Device identification reported by a camera backend.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
}

/// Metadata for a raw frame, as reported by the device.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u64,
    /// Device timestamp.
    pub timestamp: Duration,
}

/// Sample buffer straight off the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPixels {
    /// 8-bit monochrome samples.
    Mono8(Vec<u8>),
    /// 16-bit monochrome samples.
    Mono16(Vec<u16>),
}

impl RawPixels {
    /// Reduce to 8 bits per sample.
    ///
    /// 16-bit samples keep their high byte (`pixel >> 8`); the low byte is
    /// dropped, not rounded.
    pub fn into_mono8(self) -> Vec<u8> {
        match self {
            Self::Mono8(pixels) => pixels,
            Self::Mono16(pixels) => pixels
                .into_iter()
                .map(|pixel| {
                    let [high, _] = pixel.to_be_bytes();
                    high
                })
                .collect(),
        }
    }

    /// Number of samples in the buffer.
    pub fn len(&self) -> usize {
        match self {
            Self::Mono8(pixels) => pixels.len(),
            Self::Mono16(pixels) => pixels.len(),
        }
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One capture as returned by [`CameraHandle::trigger_capture`].
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Sample data, row-major.
    pub pixels: RawPixels,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// A normalized 8-bit frame, ready for display or persistence.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 8-bit samples, row-major.
    pub pixels: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Device sequence number.
    pub sequence: u64,
    /// Wall-clock time at which the capture completed.
    pub captured_at: DateTime<Local>,
}

impl Frame {
    /// Normalize a raw capture to 8 bits per sample.
    pub fn from_raw(raw: RawFrame, captured_at: DateTime<Local>) -> Self {
        Self {
            pixels: raw.pixels.into_mono8(),
            width: raw.width,
            height: raw.height,
            sequence: raw.metadata.sequence,
            captured_at,
        }
    }

    /// Sample at `(x, y)`, or `None` outside the frame.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = usize::try_from(u64::from(y) * u64::from(self.width) + u64::from(x)).ok()?;
        self.pixels.get(offset).copied()
    }

    /// Average sample value, 0.0 for an empty frame.
    pub fn mean_intensity(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&p| u64::from(p)).sum();
        #[allow(clippy::cast_precision_loss)]
        {
            sum as f64 / self.pixels.len() as f64
        }
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given index was not found.
    #[error("device {0} not found")]
    DeviceNotFound(u32),
    /// Failed to open the device.
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    /// The device rejected exposure, delay or ROI.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),
    /// A capture could not be completed.
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    /// A capture did not complete in time.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A camera model that can be opened for exclusive use.
pub trait CameraDevice {
    /// Open handle, owned by the acquisition thread for a whole run.
    type Handle: CameraHandle + Send + 'static;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Open the camera.
    fn open(&self) -> Result<Self::Handle>;
}

/// An open camera.
pub trait CameraHandle {
    /// Apply exposure, delay and ROI. Called before every capture.
    fn apply_config(&mut self, config: &CaptureConfig) -> Result<()>;

    /// Capture one frame with the last applied configuration.
    fn trigger_capture(&mut self) -> Result<RawFrame>;

    /// Release the camera.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Renders normalized frames. May drop frames.
pub trait DisplaySink {
    /// Show `frame`.
    fn show(&mut self, frame: &Frame);
}
