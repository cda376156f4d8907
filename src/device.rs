//! V4L2 camera backend using the v4l crate.
//!
//! The ROI is realized as the capture size; V4L2 has no notion of sensor
//! offsets, so only width and height reach the driver. Exposure goes through
//! `V4L2_CID_EXPOSURE_ABSOLUTE` when the driver exposes it.

use std::io;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::CaptureConfig;
use crate::traits::{
    CameraDevice, CameraError, CameraHandle, DeviceCapabilities, FrameMetadata, RawFrame,
    RawPixels, Result,
};

/// `V4L2_CID_CAMERA_CLASS_BASE + 2`, in 100 µs units.
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

/// 16-bit little-endian greyscale.
const Y16: FourCC = FourCC { repr: *b"Y16 " };
/// 8-bit greyscale.
const GREY: FourCC = FourCC { repr: *b"GREY" };

/// Extra time allowed on top of delay + exposure before a capture times out.
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

/// A V4L2 capture device, identified by its `/dev/videoN` index.
pub struct V4L2Device {
    index: u32,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Probe `/dev/video{index}` and remember its identity.
    pub fn new(index: u32) -> Result<Self> {
        let device = open_device(index)?;
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::OpenFailed(err.to_string()))?;

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::OpenFailed(format!(
                "{} cannot capture video",
                caps.card
            )));
        }

        Ok(Self {
            index,
            capabilities: DeviceCapabilities {
                driver: caps.driver,
                card: caps.card,
                bus_info: caps.bus,
            },
        })
    }
}

fn open_device(index: u32) -> Result<Device> {
    let slot = usize::try_from(index).map_err(|_| CameraError::DeviceNotFound(index))?;
    Device::new(slot).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(index),
        _ => CameraError::OpenFailed(err.to_string()),
    })
}

impl CameraDevice for V4L2Device {
    type Handle = V4L2Handle;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn open(&self) -> Result<V4L2Handle> {
        let device = open_device(self.index)?;
        let exposure = query_exposure_range(&device);
        if exposure.is_none() {
            warn!(camera = %self.capabilities.card, "no absolute exposure control, exposure ignored");
        }
        Ok(V4L2Handle {
            stream: None,
            device,
            negotiated: None,
            exposure,
            timeout: CAPTURE_GRACE,
        })
    }
}

/// Inclusive range of `V4L2_CID_EXPOSURE_ABSOLUTE`, if the driver has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExposureRange {
    min: i64,
    max: i64,
}

fn query_exposure_range(device: &Device) -> Option<ExposureRange> {
    let controls = match device.query_controls() {
        Ok(controls) => controls,
        Err(err) => {
            debug!(error = %err, "control query failed");
            return None;
        }
    };
    controls
        .into_iter()
        .find(|desc| desc.id == V4L2_CID_EXPOSURE_ABSOLUTE)
        .map(|desc| ExposureRange {
            min: desc.minimum,
            max: desc.maximum,
        })
}

/// Exposure in the control's 100 µs units, checked against `range`.
fn exposure_units(seconds: f64, range: ExposureRange) -> Result<i64> {
    #[allow(clippy::cast_possible_truncation)]
    let units = (seconds * 10_000.0).round().max(1.0) as i64;
    if units < range.min || units > range.max {
        return Err(CameraError::ConfigRejected(format!(
            "exposure {seconds} s is {units} x 100 us, outside [{}, {}]",
            range.min, range.max
        )));
    }
    Ok(units)
}

/// Format agreed with the driver for the current ROI size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Negotiated {
    width: u32,
    height: u32,
    fourcc: FourCC,
}

/// An open V4L2 device. Dropping it closes the file descriptor.
///
/// The mmap stream is created on the first capture after a format change
/// and kept running until the next one, so the driver may hand out a frame
/// queued up to two buffers earlier.
pub struct V4L2Handle {
    stream: Option<Stream<'static>>,
    device: Device,
    negotiated: Option<Negotiated>,
    exposure: Option<ExposureRange>,
    timeout: Duration,
}

impl V4L2Handle {
    fn negotiate(&self, width: u32, height: u32) -> Result<Negotiated> {
        let mut fmt = self.device.format().map_err(config_error)?;
        fmt.width = width;
        fmt.height = height;

        for fourcc in [Y16, GREY] {
            fmt.fourcc = fourcc;
            let actual = self.device.set_format(&fmt).map_err(config_error)?;
            if actual.fourcc != fourcc {
                continue;
            }
            if (actual.width, actual.height) != (width, height) {
                return Err(CameraError::ConfigRejected(format!(
                    "driver changed {width}x{height} to {}x{}",
                    actual.width, actual.height
                )));
            }
            return Ok(Negotiated {
                width,
                height,
                fourcc,
            });
        }

        Err(CameraError::ConfigRejected(
            "device offers neither Y16 nor GREY".to_owned(),
        ))
    }

    fn set_exposure(&self, seconds: f64) -> Result<()> {
        let Some(range) = self.exposure else {
            return Ok(());
        };

        let control = Control {
            id: V4L2_CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(exposure_units(seconds, range)?),
        };
        self.device.set_control(control).map_err(config_error)
    }
}

impl CameraHandle for V4L2Handle {
    fn apply_config(&mut self, config: &CaptureConfig) -> Result<()> {
        if config.delay_time_s > 0.0 {
            return Err(CameraError::ConfigRejected(format!(
                "trigger delay {} s is not supported",
                config.delay_time_s
            )));
        }

        let (width, height) = (config.roi.width(), config.roi.height());
        let current = self.negotiated.map(|n| (n.width, n.height));
        if current != Some((width, height)) {
            // Buffers are sized for the old format; the driver refuses a
            // new one while they exist.
            self.stream = None;
            let negotiated = self.negotiate(width, height)?;
            debug!(width, height, fourcc = %negotiated.fourcc, "capture format set");
            self.negotiated = Some(negotiated);
        }

        self.set_exposure(config.exposure_time_s)?;
        self.timeout = config.exposure() + CAPTURE_GRACE;
        Ok(())
    }

    fn trigger_capture(&mut self) -> Result<RawFrame> {
        let negotiated = self
            .negotiated
            .ok_or_else(|| CameraError::CaptureFailed("no format negotiated".to_owned()))?;

        let timeout = self.timeout;
        let stream = match &mut self.stream {
            Some(stream) => stream,
            empty => {
                let stream = Stream::with_buffers(&self.device, Type::VideoCapture, 2)
                    .map_err(|err| CameraError::CaptureFailed(err.to_string()))?;
                debug!("capture stream started");
                empty.insert(stream)
            }
        };
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut => CameraError::Timeout(timeout),
            _ => CameraError::CaptureFailed(err.to_string()),
        })?;

        let used = usize::try_from(meta.bytesused).map_or(buf.len(), |n| n.min(buf.len()));
        let bytes = buf.get(..used).unwrap_or(buf);
        let pixels = if negotiated.fourcc == Y16 {
            RawPixels::Mono16(
                bytes
                    .chunks_exact(2)
                    .filter_map(|pair| <[u8; 2]>::try_from(pair).ok())
                    .map(u16::from_le_bytes)
                    .collect(),
            )
        } else {
            RawPixels::Mono8(bytes.to_vec())
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(RawFrame {
            pixels,
            width: negotiated.width,
            height: negotiated.height,
            metadata: FrameMetadata {
                sequence: u64::from(meta.sequence),
                timestamp: Duration::new(secs, nanos),
            },
        })
    }

    fn close(self) -> Result<()> {
        drop(self.stream);
        drop(self.device);
        Ok(())
    }
}

fn config_error(err: io::Error) -> CameraError {
    CameraError::ConfigRejected(err.to_string())
}
