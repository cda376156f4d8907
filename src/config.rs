//! Capture configuration and application settings.
//!
//! Settings are loaded from:
//! 1. built-in defaults
//! 2. a TOML file (optional)
//! 3. environment variables prefixed with `LIVE_CAPTURE_`, nested with `__`
//!    (e.g. `LIVE_CAPTURE_CAPTURE__EXPOSURE_MS=5`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::ImageFileFormat;
use crate::roi::{legalize, DeviceGeometry, LegalRectangle, RequestedRectangle};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LIVE_CAPTURE_";

/// Error raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Exposure, delay and ROI applied to the camera for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CaptureConfig {
    /// Exposure time in seconds, > 0.
    pub exposure_time_s: f64,
    /// Delay between trigger and exposure in seconds, >= 0.
    pub delay_time_s: f64,
    /// Readout rectangle.
    pub roi: LegalRectangle,
}

impl CaptureConfig {
    /// Default exposure time (10 ms).
    pub const DEFAULT_EXPOSURE_S: f64 = 0.01;

    /// The request the default ROI is legalized from.
    pub const DEFAULT_ROI_REQUEST: RequestedRectangle = RequestedRectangle::edges(1, 1, 512, 512);

    /// Default configuration for a sensor.
    pub fn default_for(geometry: &DeviceGeometry) -> Self {
        let full = LegalRectangle::full_sensor(geometry);
        Self {
            exposure_time_s: Self::DEFAULT_EXPOSURE_S,
            delay_time_s: 0.0,
            roi: legalize(&Self::DEFAULT_ROI_REQUEST, &full, geometry).rect,
        }
    }

    /// Exposure as a [`Duration`]; zero if the value is not representable.
    pub fn exposure(&self) -> Duration {
        Duration::try_from_secs_f64(self.exposure_time_s).unwrap_or_default()
    }

    /// Delay as a [`Duration`]; zero if the value is not representable.
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_time_s).unwrap_or_default()
    }
}

/// Which camera backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated sensor.
    #[default]
    Mock,
    /// A V4L2 capture device.
    V4l2,
}

/// `[camera]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    /// Backend to open.
    pub backend: Backend,
    /// `/dev/videoN` index for the V4L2 backend.
    pub device_index: u32,
    /// Sensor geometry used for ROI legalization.
    pub geometry: DeviceGeometry,
}

/// `[capture]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Exposure time in milliseconds.
    pub exposure_ms: f64,
    /// Delay time in milliseconds.
    pub delay_ms: f64,
    /// Initial ROI request, legalized against the full sensor.
    pub roi: RequestedRectangle,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            exposure_ms: CaptureConfig::DEFAULT_EXPOSURE_S * 1000.0,
            delay_ms: 0.0,
            roi: CaptureConfig::DEFAULT_ROI_REQUEST,
        }
    }
}

/// `[recording]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSection {
    /// Interval between recording ticks in milliseconds.
    pub interval_ms: u64,
    /// Directory images are written to; recording is off when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Image file format.
    pub format: ImageFileFormat,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            output_dir: None,
            format: ImageFileFormat::Png,
        }
    }
}

/// `[display]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    /// Interval between display refreshes in milliseconds.
    pub refresh_ms: u64,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self { refresh_ms: 33 }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Camera backend and geometry.
    pub camera: CameraSection,
    /// Initial capture parameters.
    pub capture: CaptureSection,
    /// Recording cadence and target.
    pub recording: RecordingSection,
    /// Display refresh.
    pub display: DisplaySection,
}

impl AppConfig {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges the type system does not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if !(capture.exposure_ms.is_finite() && capture.exposure_ms > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "capture.exposure_ms must be positive, got {}",
                capture.exposure_ms
            )));
        }
        if !(capture.delay_ms.is_finite() && capture.delay_ms >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "capture.delay_ms must be non-negative, got {}",
                capture.delay_ms
            )));
        }
        if self.recording.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recording.interval_ms must be at least 1".to_owned(),
            ));
        }
        if self.display.refresh_ms == 0 {
            return Err(ConfigError::Invalid(
                "display.refresh_ms must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Initial capture configuration, with the ROI request legalized.
    pub fn capture_config(&self) -> CaptureConfig {
        let geometry = &self.camera.geometry;
        let full = LegalRectangle::full_sensor(geometry);
        CaptureConfig {
            exposure_time_s: self.capture.exposure_ms / 1000.0,
            delay_time_s: self.capture.delay_ms / 1000.0,
            roi: legalize(&self.capture.roi, &full, geometry).rect,
        }
    }

    /// Recording tick interval.
    pub const fn recording_interval(&self) -> Duration {
        Duration::from_millis(self.recording.interval_ms)
    }

    /// Display refresh interval.
    pub const fn display_refresh(&self) -> Duration {
        Duration::from_millis(self.display.refresh_ms)
    }
}
