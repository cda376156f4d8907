//! Simulated camera for running without hardware.
//!
//! Produces 16-bit test patterns sized to the applied ROI, sleeps for
//! delay + exposure per capture, and can be told to fail on demand. A shared
//! [`MockProbe`] lets tests see how many handles are open.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::roi::{DeviceGeometry, GeometryParams};
use crate::traits::{
    CameraDevice, CameraError, CameraHandle, DeviceCapabilities, FrameMetadata, RawFrame,
    RawPixels, Result,
};
use crate::validation::validate_legal_rectangle;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Every sample set to the given value.
    Solid(u16),
}

/// Counters shared between a [`MockCamera`] and its handles.
#[derive(Debug, Default)]
pub struct MockProbe {
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
    opens: AtomicU64,
    captures: AtomicU64,
}

impl MockProbe {
    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of handles ever open at once.
    pub fn max_open_handles(&self) -> usize {
        self.max_open_handles.load(Ordering::SeqCst)
    }

    /// Successful `open` calls.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Captures attempted across all handles.
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }
}

/// Mock camera for testing without hardware.
#[derive(Debug, Clone)]
pub struct MockCamera {
    capabilities: DeviceCapabilities,
    geometry: DeviceGeometry,
    pattern: TestPattern,
    exposure_range: (f64, f64),
    max_delay_s: f64,
    fail_open: bool,
    fail_capture_at: Option<u64>,
    probe: Arc<MockProbe>,
}

impl MockCamera {
    /// Create a mock camera with the given sensor geometry.
    pub fn new(geometry: DeviceGeometry) -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
            },
            geometry,
            pattern: TestPattern::Gradient,
            exposure_range: (1e-6, 5.0),
            max_delay_s: 1.0,
            fail_open: false,
            fail_capture_at: None,
            probe: Arc::new(MockProbe::default()),
        }
    }

    /// A 64 x 32 sensor with an 8-column step, small enough for fast tests.
    pub fn test_geometry() -> DeviceGeometry {
        let geometry = DeviceGeometry::new(GeometryParams {
            min_lr: 1,
            min_ud: 1,
            min_width: 16,
            min_height: 4,
            max_lr: 64,
            max_ud: 32,
            step_lr: 8,
        });
        geometry.unwrap_or_default()
    }

    /// Set the test pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Accepted exposure range in seconds; anything outside is rejected.
    #[must_use]
    pub fn with_exposure_range(mut self, min_s: f64, max_s: f64) -> Self {
        self.exposure_range = (min_s, max_s);
        self
    }

    /// Make every `open` fail.
    #[must_use]
    pub const fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail the `n`-th capture (1-based, counted across all handles).
    #[must_use]
    pub const fn with_capture_failure_at(mut self, n: u64) -> Self {
        self.fail_capture_at = Some(n);
        self
    }

    /// Counters shared with every handle this camera opens.
    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }
}

impl CameraDevice for MockCamera {
    type Handle = MockHandle;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn open(&self) -> Result<MockHandle> {
        if self.fail_open {
            return Err(CameraError::OpenFailed("mock camera unavailable".to_owned()));
        }

        let open = self.probe.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_open_handles.fetch_max(open, Ordering::SeqCst);
        self.probe.opens.fetch_add(1, Ordering::SeqCst);

        Ok(MockHandle {
            camera: self.clone(),
            config: None,
            sequence: 0,
        })
    }
}

/// An open mock camera. Dropping it releases it.
#[derive(Debug)]
pub struct MockHandle {
    camera: MockCamera,
    config: Option<CaptureConfig>,
    sequence: u64,
}

impl CameraHandle for MockHandle {
    fn apply_config(&mut self, config: &CaptureConfig) -> Result<()> {
        let (min_s, max_s) = self.camera.exposure_range;
        if !(min_s..=max_s).contains(&config.exposure_time_s) {
            return Err(CameraError::ConfigRejected(format!(
                "exposure {} s outside [{min_s}, {max_s}]",
                config.exposure_time_s
            )));
        }
        if !(0.0..=self.camera.max_delay_s).contains(&config.delay_time_s) {
            return Err(CameraError::ConfigRejected(format!(
                "delay {} s outside [0, {}]",
                config.delay_time_s, self.camera.max_delay_s
            )));
        }
        validate_legal_rectangle(&config.roi, &self.camera.geometry)
            .map_err(|err| CameraError::ConfigRejected(err.to_string()))?;

        self.config = Some(*config);
        Ok(())
    }

    fn trigger_capture(&mut self) -> Result<RawFrame> {
        let config = self
            .config
            .ok_or_else(|| CameraError::CaptureFailed("no configuration applied".to_owned()))?;

        let attempt = self.camera.probe.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.camera.fail_capture_at == Some(attempt) {
            return Err(CameraError::Timeout(config.exposure() + Duration::from_secs(1)));
        }

        std::thread::sleep(config.delay() + config.exposure());

        let (width, height) = (config.roi.width(), config.roi.height());
        let sequence = self.sequence;
        self.sequence += 1;

        Ok(RawFrame {
            pixels: RawPixels::Mono16(generate_test_frame(width, height, self.camera.pattern)),
            width,
            height,
            metadata: FrameMetadata {
                sequence,
                timestamp: (config.delay() + config.exposure())
                    .saturating_mul(u32::try_from(sequence + 1).unwrap_or(u32::MAX)),
            },
        })
    }

    fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.camera.probe.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Generate 16-bit frame data for `pattern`.
fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u16> {
    match pattern {
        TestPattern::Gradient => {
            let span = u64::from(width.saturating_sub(1).max(1));
            let row: Vec<u16> = (0..width)
                .map(|x| {
                    let value = u64::from(x) * u64::from(u16::MAX) / span;
                    u16::try_from(value).unwrap_or(u16::MAX)
                })
                .collect();
            (0..height).flat_map(|_| row.iter().copied()).collect()
        }
        TestPattern::Solid(value) => {
            let samples = u64::from(width) * u64::from(height);
            vec![value; usize::try_from(samples).unwrap_or(0)]
        }
    }
}
