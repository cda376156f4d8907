//! live-cam-capture binary: runs the acquisition loop against a camera,
//! logs a frame summary at the display refresh rate and optionally records
//! images to disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam_channel::{select, tick};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use live_cam_capture::config::{AppConfig, Backend};
use live_cam_capture::controller::{AcquisitionController, AcquisitionEvent, AcquisitionState};
use live_cam_capture::persistence::ImageFilePersistence;
use live_cam_capture::pipeline::{FrameCursor, FramePipeline};
use live_cam_capture::recorder::RecordingScheduler;
use live_cam_capture::traits::{CameraDevice, DisplaySink, Frame};
use live_cam_capture::{MockCamera, V4L2Device};

/// Live camera acquisition with ROI control and periodic recording.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the simulated camera regardless of the configured backend.
    #[arg(long)]
    mock: bool,

    /// V4L2 device index (/dev/videoN). Selects the V4L2 backend.
    #[arg(short, long, conflicts_with = "mock")]
    device: Option<u32>,

    /// Exposure time in milliseconds.
    #[arg(short, long)]
    exposure_ms: Option<f64>,

    /// Record images into this directory.
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Interval between recorded images in milliseconds.
    #[arg(long)]
    record_interval_ms: Option<u64>,

    /// Stop after this many seconds. Runs until the camera fails otherwise.
    #[arg(long)]
    duration_secs: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if self.mock {
            config.camera.backend = Backend::Mock;
        }
        if let Some(index) = self.device {
            config.camera.backend = Backend::V4l2;
            config.camera.device_index = index;
        }
        if let Some(exposure) = self.exposure_ms {
            config.capture.exposure_ms = exposure;
        }
        if let Some(dir) = &self.record {
            config.recording.output_dir = Some(dir.clone());
        }
        if let Some(interval) = self.record_interval_ms {
            config.recording.interval_ms = interval;
        }
    }
}

/// Display stand-in that logs a summary of every shown frame.
#[derive(Debug, Default)]
struct LogSink {
    shown: u64,
}

impl DisplaySink for LogSink {
    fn show(&mut self, frame: &Frame) {
        self.shown += 1;
        info!(
            sequence = frame.sequence,
            width = frame.width,
            height = frame.height,
            mean = frame.mean_intensity(),
            "frame"
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("live_cam_capture=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("applying command-line overrides")?;

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    match config.camera.backend {
        Backend::Mock => run(MockCamera::new(config.camera.geometry), &config, deadline),
        Backend::V4l2 => {
            let index = config.camera.device_index;
            let device = V4L2Device::new(index)
                .with_context(|| format!("opening /dev/video{index}"))?;
            run(device, &config, deadline)
        }
    }
}

fn run<D: CameraDevice>(
    device: D,
    config: &AppConfig,
    deadline: Option<Instant>,
) -> anyhow::Result<()> {
    let caps = device.capabilities();
    info!(card = %caps.card, driver = %caps.driver, bus = %caps.bus_info, "camera");

    let pipeline = Arc::new(FramePipeline::new());
    let initial = config.capture_config();
    info!(
        exposure_s = initial.exposure_time_s,
        delay_s = initial.delay_time_s,
        roi = %initial.roi,
        "initial configuration"
    );

    let controller =
        AcquisitionController::new(device, config.camera.geometry, initial, Arc::clone(&pipeline));
    let events = controller.subscribe(16);

    let persistence = Arc::new(ImageFilePersistence::new(config.recording.format));
    let mut recorder = RecordingScheduler::new(Arc::clone(&pipeline), persistence);
    if let Some(dir) = &config.recording.output_dir {
        recorder.set_target(Some(dir.clone()));
        recorder
            .arm(config.recording_interval())
            .context("arming recorder")?;
    }

    controller.start().context("starting acquisition")?;

    let mut sink = LogSink::default();
    let mut cursor = FrameCursor::default();
    let refresh = tick(config.display_refresh());
    let result = loop {
        if deadline.is_some_and(|at| Instant::now() >= at) {
            info!("duration elapsed");
            break Ok(());
        }

        select! {
            recv(refresh) -> _ => {
                if let Some(frame) = pipeline.consume(&mut cursor).new_frame() {
                    sink.show(&frame);
                }
                if let Some(fault) = controller.last_fault() {
                    error!(error = %fault, "acquisition failed");
                    break Err(fault);
                }
            }
            recv(events) -> event => match event {
                Ok(AcquisitionEvent::Error(fault)) => {
                    error!(error = %fault, "acquisition failed");
                    break Err(fault);
                }
                Ok(AcquisitionEvent::StateChanged(state)) => {
                    info!(%state, "acquisition state");
                }
                Ok(AcquisitionEvent::FrameReady(_)) => {}
                Err(_) => {
                    warn!("event channel closed");
                    break Ok(());
                }
            },
        }
    };

    recorder.disarm();
    let final_state = controller.stop();
    info!(
        shown = sink.shown,
        published = pipeline.frames_published(),
        recorded = recorder.stats().saved,
        state = %final_state,
        "shutdown"
    );

    result.context("acquisition failed")?;
    if final_state == AcquisitionState::Error {
        bail!("acquisition ended in error state");
    }
    Ok(())
}
