//! Integration tests using the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded via: `./scripts/dev-setup.sh load-vivid`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration (set by `dev-setup.sh`):
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Greyscale capture formats (`Y16 ` or `GREY`) enabled
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_cam_capture::config::CaptureConfig;
use live_cam_capture::controller::{AcquisitionController, AcquisitionEvent, AcquisitionState};
use live_cam_capture::device::V4L2Device;
use live_cam_capture::persistence::{ImageFileFormat, ImageFilePersistence};
use live_cam_capture::pipeline::FramePipeline;
use live_cam_capture::recorder::RecordingScheduler;
use live_cam_capture::roi::{DeviceGeometry, GeometryParams, LegalRectangle, RequestedRectangle};
use live_cam_capture::traits::{CameraDevice, CameraError, CameraHandle, Frame};
use live_cam_capture::validation::{
    validate_frame_matches_roi, validate_frame_sequence, validate_gradient,
};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(10);

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check the driver name before opening, avoiding unnecessary
/// opens on real cameras.
fn find_vivid_devices() -> Vec<u32> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        if V4L2Device::new(index).is_ok() {
            devices.push(index);
        }
    }
    devices
}

/// The first vivid device. Integration tests MUST have vivid loaded: they
/// fail rather than silently skip, so CI catches a missing setup.
fn require_vivid() -> V4L2Device {
    let index = find_vivid_devices().first().copied().expect(
        "vivid virtual camera not available.\n\
         Load vivid with: ./scripts/dev-setup.sh load-vivid\n\
         Or run unit tests only: cargo test --lib",
    );
    V4L2Device::new(index).expect("Failed to open vivid device")
}

/// vivid's default 640x480 frame described as a sensor.
fn vivid_geometry() -> DeviceGeometry {
    DeviceGeometry::new(GeometryParams {
        min_lr: 1,
        min_ud: 1,
        min_width: 64,
        min_height: 16,
        max_lr: 640,
        max_ud: 480,
        step_lr: 32,
    })
    .expect("vivid geometry is valid")
}

fn full_frame_config(geometry: &DeviceGeometry) -> CaptureConfig {
    CaptureConfig {
        exposure_time_s: 0.01,
        delay_time_s: 0.0,
        roi: LegalRectangle::full_sensor(geometry),
    }
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let device = require_vivid();
    let caps = device.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");

    println!("Opened vivid device:");
    println!("  Driver: {}", caps.driver);
    println!("  Card: {}", caps.card);
    println!("  Bus: {}", caps.bus_info);
}

#[test]
#[serial]
fn test_vivid_single_capture() {
    let device = require_vivid();
    let geometry = vivid_geometry();
    let config = full_frame_config(&geometry);

    let mut handle = device.open().expect("Failed to open handle");
    handle.apply_config(&config).expect("Failed to apply config");
    let raw = handle.trigger_capture().expect("Failed to capture frame");
    handle.close().expect("Failed to close handle");

    println!(
        "Captured frame: seq={}, ts={:?}, {}x{}, {} samples",
        raw.metadata.sequence,
        raw.metadata.timestamp,
        raw.width,
        raw.height,
        raw.pixels.len()
    );

    let frame = Frame::from_raw(raw, chrono::Local::now());
    validate_frame_matches_roi(&frame, &config.roi).expect("frame matches full ROI");
}

#[test]
#[serial]
fn test_vivid_rejects_trigger_delay() {
    let device = require_vivid();
    let geometry = vivid_geometry();
    let config = CaptureConfig {
        delay_time_s: 0.05,
        ..full_frame_config(&geometry)
    };

    let mut handle = device.open().expect("Failed to open handle");
    let result = handle.apply_config(&config);
    assert!(
        matches!(result, Err(CameraError::ConfigRejected(_))),
        "Expected delay to be rejected, got {result:?}"
    );
}

#[test]
#[serial]
fn test_vivid_controller_run() {
    let geometry = vivid_geometry();
    let controller = AcquisitionController::new(
        require_vivid(),
        geometry,
        full_frame_config(&geometry),
        Arc::new(FramePipeline::new()),
    );
    let events = controller.subscribe(64);

    controller.start().expect("Failed to start acquisition");
    assert!(
        wait_until(WAIT, || controller.pipeline().frames_published() >= 10),
        "Fewer than 10 frames published, state {}",
        controller.state()
    );
    assert_eq!(controller.stop(), AcquisitionState::Idle);

    let frames: Vec<Arc<Frame>> = events
        .try_iter()
        .filter_map(|event| match event {
            AcquisitionEvent::FrameReady(frame) => Some(frame),
            _ => None,
        })
        .collect();
    let result = validate_frame_sequence(&frames);
    assert!(
        result.is_ok(),
        "Frame sequence validation failed: {:?}",
        result.err()
    );

    // First vivid device is configured with Gray Ramp (test_pattern=20)
    let last = frames.last().expect("at least one frame");
    let result = validate_gradient(last);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Run: ./scripts/dev-setup.sh load-vivid\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_roi_change_while_running() {
    let geometry = vivid_geometry();
    let controller = AcquisitionController::new(
        require_vivid(),
        geometry,
        full_frame_config(&geometry),
        Arc::new(FramePipeline::new()),
    );

    controller.start().expect("Failed to start acquisition");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 1));

    let applied = controller.update_roi(&RequestedRectangle::edges(65, 121, 384, 360));
    println!("Applied ROI: {}", applied.rect);
    assert_eq!((applied.rect.width(), applied.rect.height()), (320, 240));

    assert!(wait_until(WAIT, || {
        controller
            .pipeline()
            .latest()
            .is_some_and(|frame| validate_frame_matches_roi(&frame, &applied.rect).is_ok())
    }));
    assert_eq!(controller.stop(), AcquisitionState::Idle);
}

#[test]
#[serial]
fn test_vivid_recording() {
    let dir = tempfile::tempdir().expect("temp dir");
    let geometry = vivid_geometry();
    let controller = AcquisitionController::new(
        require_vivid(),
        geometry,
        full_frame_config(&geometry),
        Arc::new(FramePipeline::new()),
    );
    let mut recorder = RecordingScheduler::new(
        Arc::clone(controller.pipeline()),
        Arc::new(ImageFilePersistence::new(ImageFileFormat::Png)),
    );
    recorder.set_target(Some(dir.path().to_path_buf()));

    controller.start().expect("Failed to start acquisition");
    recorder
        .arm(Duration::from_millis(100))
        .expect("Failed to arm recorder");
    assert!(wait_until(WAIT, || recorder.stats().saved >= 1));
    recorder.disarm();
    controller.stop();

    let saved = fs::read_dir(dir.path())
        .expect("output dir readable")
        .filter_map(Result::ok)
        .count();
    assert!(saved >= 1, "No images written");
}
