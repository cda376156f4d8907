//! Acquisition controller and recorder tests against the mock camera.
//!
//! These run without hardware: `cargo test`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_cam_capture::config::CaptureConfig;
use live_cam_capture::controller::{
    AcquisitionController, AcquisitionEvent, AcquisitionFault, AcquisitionState, Command,
    ControlError,
};
use live_cam_capture::mock::MockCamera;
use live_cam_capture::persistence::{ImageFileFormat, ImageFilePersistence};
use live_cam_capture::pipeline::{FrameCursor, FramePipeline};
use live_cam_capture::recorder::{Persistence, PersistenceError, RecordingScheduler};
use live_cam_capture::roi::RequestedRectangle;
use live_cam_capture::traits::Frame;
use live_cam_capture::validation::{
    validate_frame_matches_roi, validate_frame_sequence, validate_gradient,
};

const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` passes.
fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn controller_for(camera: MockCamera) -> AcquisitionController<MockCamera> {
    let geometry = MockCamera::test_geometry();
    let initial = CaptureConfig {
        exposure_time_s: 1e-3,
        ..CaptureConfig::default_for(&geometry)
    };
    AcquisitionController::new(camera, geometry, initial, Arc::new(FramePipeline::new()))
}

fn mock() -> MockCamera {
    MockCamera::new(MockCamera::test_geometry())
}

#[test]
fn test_second_start_keeps_single_handle() {
    let camera = mock();
    let probe = camera.probe();
    let controller = controller_for(camera);

    assert_eq!(
        controller.start().expect("first start"),
        AcquisitionState::Running
    );
    assert_eq!(
        controller.start().expect("second start is a no-op"),
        AcquisitionState::Running
    );
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 3));

    assert_eq!(probe.opens(), 1);
    assert_eq!(probe.max_open_handles(), 1);

    assert_eq!(controller.stop(), AcquisitionState::Idle);
    assert_eq!(probe.open_handles(), 0);
}

#[test]
fn test_stop_closes_camera_and_freezes_pipeline() {
    let camera = mock();
    let probe = camera.probe();
    let controller = controller_for(camera);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 2));

    assert_eq!(controller.stop(), AcquisitionState::Idle);
    assert_eq!(probe.open_handles(), 0);

    let published = controller.pipeline().frames_published();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(controller.pipeline().frames_published(), published);

    // Stopping twice is harmless.
    assert_eq!(controller.stop(), AcquisitionState::Idle);
}

#[test]
fn test_restart_after_stop_reopens_camera() {
    let camera = mock();
    let probe = camera.probe();
    let controller = controller_for(camera);

    for _ in 0..3 {
        controller.start().expect("start");
        let before = controller.pipeline().frames_published();
        assert!(wait_until(WAIT, || controller.pipeline().frames_published() > before));
        controller.stop();
    }

    assert_eq!(probe.opens(), 3);
    assert_eq!(probe.max_open_handles(), 1);
    assert_eq!(probe.open_handles(), 0);
}

#[test]
fn test_capture_failure_requires_reset() {
    let camera = mock().with_capture_failure_at(3);
    let probe = camera.probe();
    let controller = controller_for(camera);
    let events = controller.subscribe(64);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.state() == AcquisitionState::Error));

    assert_eq!(controller.pipeline().frames_published(), 2);
    assert_eq!(probe.open_handles(), 0);
    assert!(matches!(
        controller.last_fault(),
        Some(AcquisitionFault::Capture(_))
    ));
    assert!(wait_until(WAIT, || events
        .try_iter()
        .any(|event| matches!(event, AcquisitionEvent::Error(_)))));

    assert!(matches!(
        controller.start(),
        Err(ControlError::ResetRequired)
    ));
    assert_eq!(controller.stop(), AcquisitionState::Error);

    assert_eq!(controller.reset(), AcquisitionState::Idle);
    assert!(controller.last_fault().is_none());

    controller.start().expect("start after reset");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() > 2));
    assert_eq!(controller.stop(), AcquisitionState::Idle);
}

#[test]
fn test_rejected_exposure_ends_run() {
    let camera = mock().with_exposure_range(1e-4, 0.5);
    let probe = camera.probe();
    let controller = controller_for(camera);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 1));

    controller
        .update_exposure(2.0)
        .expect("positive exposure is accepted by the controller");
    assert!(wait_until(WAIT, || controller.state() == AcquisitionState::Error));

    assert!(matches!(
        controller.last_fault(),
        Some(AcquisitionFault::Config(_))
    ));
    assert_eq!(probe.open_handles(), 0);
}

#[test]
fn test_open_failure_stays_idle() {
    let controller = controller_for(mock().with_open_failure());

    assert!(matches!(controller.start(), Err(ControlError::Open(_))));
    assert_eq!(controller.state(), AcquisitionState::Idle);
    assert_eq!(controller.pipeline().frames_published(), 0);
}

#[test]
fn test_roi_change_applies_on_next_frame() {
    let controller = controller_for(mock());
    let events = controller.subscribe(4096);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 1));

    let applied = controller.update_roi(&RequestedRectangle::edges(9, 5, 40, 28));
    assert!(!applied.adjusted);
    assert_eq!(applied.rect.width(), 32);
    assert_eq!(applied.rect.height(), 24);

    assert!(wait_until(WAIT, || {
        controller
            .pipeline()
            .latest()
            .is_some_and(|frame| validate_frame_matches_roi(&frame, &applied.rect).is_ok())
    }));
    controller.stop();

    let frames: Vec<Arc<Frame>> = events
        .try_iter()
        .filter_map(|event| match event {
            AcquisitionEvent::FrameReady(frame) => Some(frame),
            _ => None,
        })
        .collect();
    validate_frame_sequence(&frames).expect("sequence numbers increase");

    let last = frames.last().expect("at least one frame");
    validate_frame_matches_roi(last, &applied.rect).expect("last frame uses new ROI");
    validate_gradient(last).expect("mock gradient survives normalization");
}

#[test]
fn test_dispatch_routes_commands() {
    let controller = controller_for(mock());

    controller
        .dispatch(Command::SetExposure(2e-3))
        .expect("exposure");
    controller.dispatch(Command::SetDelay(0.0)).expect("delay");
    controller
        .dispatch(Command::SetRoi(RequestedRectangle {
            left: Some(100),
            ..RequestedRectangle::default()
        }))
        .expect("roi");

    let snapshot = controller.config_snapshot();
    assert!((snapshot.exposure_time_s - 2e-3).abs() < f64::EPSILON);
    assert_eq!(snapshot.roi.left(), 49);

    assert!(matches!(
        controller.dispatch(Command::SetDelay(-1.0)),
        Err(ControlError::InvalidParameter { name: "delay", .. })
    ));

    controller.dispatch(Command::Start).expect("start");
    assert_eq!(controller.state(), AcquisitionState::Running);
    controller.dispatch(Command::Stop).expect("stop");
    assert_eq!(controller.state(), AcquisitionState::Idle);
}

#[test]
fn test_consumers_track_versions_independently() {
    let controller = controller_for(mock());
    let pipeline = Arc::clone(controller.pipeline());
    let mut display = FrameCursor::default();
    let mut recorder = FrameCursor::default();

    controller.start().expect("start");
    assert!(wait_until(WAIT, || pipeline.frames_published() >= 1));
    controller.stop();

    assert!(pipeline.consume(&mut display).new_frame().is_some());
    assert!(pipeline.consume(&mut display).new_frame().is_none());
    assert!(pipeline.consume(&mut recorder).new_frame().is_some());
}

fn image_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_recorder_writes_images_while_running() {
    let dir = tempfile::tempdir().expect("temp dir");
    let controller = controller_for(mock());
    let persistence = Arc::new(ImageFilePersistence::new(ImageFileFormat::Png));
    let mut recorder = RecordingScheduler::new(Arc::clone(controller.pipeline()), persistence);
    recorder.set_target(Some(dir.path().to_path_buf()));

    controller.start().expect("start");
    recorder
        .arm(Duration::from_millis(20))
        .expect("arm recorder");
    assert!(wait_until(WAIT, || recorder.stats().saved >= 2));
    recorder.disarm();
    controller.stop();

    let files = image_files(dir.path());
    assert!(!files.is_empty());
    assert!(files
        .iter()
        .all(|name| name.starts_with("Image_") && name.ends_with(".png")));

    let saved = recorder.stats().saved;
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(recorder.stats().saved, saved);
}

struct FailingPersistence;

impl Persistence for FailingPersistence {
    fn extension(&self) -> &str {
        "png"
    }

    fn save(&self, path: &Path, _frame: &Frame) -> Result<(), PersistenceError> {
        Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}

#[test]
fn test_failed_save_does_not_stop_acquisition() {
    let controller = controller_for(mock());
    let mut recorder =
        RecordingScheduler::new(Arc::clone(controller.pipeline()), Arc::new(FailingPersistence));
    recorder.set_target(Some("/unused".into()));

    controller.start().expect("start");
    recorder
        .arm(Duration::from_millis(10))
        .expect("arm recorder");
    assert!(wait_until(WAIT, || recorder.stats().failed >= 2));

    assert_eq!(controller.state(), AcquisitionState::Running);
    assert_eq!(recorder.stats().saved, 0);

    recorder.disarm();
    assert_eq!(controller.stop(), AcquisitionState::Idle);
}

#[test]
fn test_lagging_subscriber_still_gets_failure() {
    let controller = controller_for(mock().with_capture_failure_at(20));
    let events = controller.subscribe(4);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.state() == AcquisitionState::Error));
    controller.stop();

    let received: Vec<AcquisitionEvent> = events.try_iter().collect();
    let frames = received
        .iter()
        .filter(|event| matches!(event, AcquisitionEvent::FrameReady(_)))
        .count();
    assert!(frames <= 4, "frame events beyond capacity: {frames}");
    assert!(received
        .iter()
        .any(|event| matches!(event, AcquisitionEvent::StateChanged(AcquisitionState::Error))));
    assert!(matches!(received.last(), Some(AcquisitionEvent::Error(_))));
}

#[test]
fn test_state_events_in_order() {
    let controller = controller_for(mock());
    let events = controller.subscribe(4096);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 2));
    controller.stop();

    let states: Vec<AcquisitionState> = events
        .try_iter()
        .filter_map(|event| match event {
            AcquisitionEvent::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            AcquisitionState::Running,
            AcquisitionState::StoppingRequested,
            AcquisitionState::Idle
        ]
    );
}

#[test]
fn test_slow_and_closed_subscribers_do_not_block_loop() {
    let controller = controller_for(mock());
    let _lagging = controller.subscribe(1);
    let closed = controller.subscribe(1);
    drop(closed);
    assert_eq!(controller.subscriber_count(), 2);

    controller.start().expect("start");
    assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 10));
    controller.stop();

    assert_eq!(controller.subscriber_count(), 1);
}

#[test]
fn test_dropping_controller_closes_camera() {
    let camera = mock();
    let probe = camera.probe();
    {
        let controller = controller_for(camera);
        controller.start().expect("start");
        assert!(wait_until(WAIT, || controller.pipeline().frames_published() >= 1));
        assert_eq!(probe.open_handles(), 1);
    }

    assert_eq!(probe.open_handles(), 0);
    let captures = probe.captures();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(probe.captures(), captures);
}

/// Counts saves; each one takes `delay`.
#[derive(Default)]
struct CountingPersistence {
    delay: Duration,
    started: AtomicU64,
    finished: AtomicU64,
}

impl Persistence for CountingPersistence {
    fn extension(&self) -> &str {
        "png"
    }

    fn save(&self, _path: &Path, _frame: &Frame) -> Result<(), PersistenceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_disarm_waits_for_in_flight_save() {
    let controller = controller_for(mock());
    let store = Arc::new(CountingPersistence {
        delay: Duration::from_millis(200),
        ..CountingPersistence::default()
    });
    let mut recorder = RecordingScheduler::new(
        Arc::clone(controller.pipeline()),
        Arc::clone(&store) as Arc<dyn Persistence>,
    );
    recorder.set_target(Some("/unused".into()));

    controller.start().expect("start");
    recorder
        .arm(Duration::from_millis(10))
        .expect("arm recorder");
    assert!(wait_until(WAIT, || store.started.load(Ordering::SeqCst) >= 1));

    recorder.disarm();
    assert_eq!(store.finished.load(Ordering::SeqCst), 1);
    assert_eq!(store.started.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.stats().saved, 1);
    controller.stop();
}

#[test]
fn test_dropping_armed_recorder_stops_ticks() {
    let controller = controller_for(mock());
    let store = Arc::new(CountingPersistence::default());
    let mut recorder = RecordingScheduler::new(
        Arc::clone(controller.pipeline()),
        Arc::clone(&store) as Arc<dyn Persistence>,
    );
    recorder.set_target(Some("/unused".into()));

    controller.start().expect("start");
    recorder
        .arm(Duration::from_millis(5))
        .expect("arm recorder");
    assert!(wait_until(WAIT, || store.finished.load(Ordering::SeqCst) >= 2));

    drop(recorder);
    let saved = store.finished.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(store.finished.load(Ordering::SeqCst), saved);
    assert_eq!(store.started.load(Ordering::SeqCst), saved);
    controller.stop();
}
