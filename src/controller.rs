//! Acquisition controller.
//!
//! Owns the camera for the length of a run and drives the capture loop on a
//! dedicated thread. The loop re-reads exposure, delay and ROI every cycle,
//! so setters take effect on the next capture without restarting.
//!
//! At most one camera handle is open at a time: `start` refuses to open a
//! second one while a run exists, and `stop` only returns once the loop
//! thread has closed its handle and exited.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::CaptureConfig;
use crate::pipeline::FramePipeline;
use crate::roi::{legalize, DeviceGeometry, LegalRectangle, Legalization, RequestedRectangle};
use crate::traits::{CameraDevice, CameraError, CameraHandle, Frame};

/// Lifecycle of the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No run, camera closed.
    Idle,
    /// Loop is capturing.
    Running,
    /// `stop` was called; the loop will exit after the current capture.
    StoppingRequested,
    /// The loop hit a camera failure and exited. Needs `reset`.
    Error,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StoppingRequested => "stopping",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Camera failure that ended a run.
#[derive(Debug, Clone, Error)]
pub enum AcquisitionFault {
    /// The camera rejected the configuration.
    #[error("camera rejected configuration: {0}")]
    Config(#[source] Arc<CameraError>),
    /// A capture failed or timed out.
    #[error("capture failed: {0}")]
    Capture(#[source] Arc<CameraError>),
}

/// Error returned by controller commands.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The camera could not be opened.
    #[error("failed to open camera: {0}")]
    Open(#[source] CameraError),
    /// A previous run failed; `reset` must be called first.
    #[error("acquisition is in the error state; reset before starting")]
    ResetRequired,
    /// A parameter is outside its domain.
    #[error("{name} must be {expected}, got {value}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Allowed range.
        expected: &'static str,
        /// Rejected value.
        value: f64,
    },
    /// The loop thread could not be spawned.
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Command accepted by [`AcquisitionController::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open the camera and start capturing.
    Start,
    /// Stop capturing and close the camera.
    Stop,
    /// Leave the error state.
    Reset,
    /// Exposure time in seconds.
    SetExposure(f64),
    /// Delay time in seconds.
    SetDelay(f64),
    /// New ROI request.
    SetRoi(RequestedRectangle),
}

/// Notification sent to subscribers.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A frame was published to the pipeline.
    FrameReady(Arc<Frame>),
    /// The controller changed state.
    StateChanged(AcquisitionState),
    /// A run ended with a camera failure.
    Error(AcquisitionFault),
}

/// One event receiver. The channel is unbounded; only frame events are
/// limited, to `frame_capacity` undelivered events.
struct Subscriber {
    tx: Sender<AcquisitionEvent>,
    frame_capacity: usize,
}

/// State shared between the control side and the loop thread.
struct Shared {
    geometry: DeviceGeometry,
    state: Mutex<AcquisitionState>,
    exposure_s: Mutex<f64>,
    delay_s: Mutex<f64>,
    roi: Mutex<LegalRectangle>,
    fault: Mutex<Option<AcquisitionFault>>,
    subscribers: Mutex<Vec<Subscriber>>,
    pipeline: Arc<FramePipeline>,
}

impl Shared {
    fn state(&self) -> AcquisitionState {
        *self.state.lock()
    }

    fn set_state(&self, next: AcquisitionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            info!(from = %previous, to = %next, "acquisition state changed");
            self.emit(&AcquisitionEvent::StateChanged(next));
        }
    }

    /// Each field is read under its own lock; fields may come from
    /// different setter calls.
    fn snapshot(&self) -> CaptureConfig {
        CaptureConfig {
            exposure_time_s: *self.exposure_s.lock(),
            delay_time_s: *self.delay_s.lock(),
            roi: *self.roi.lock(),
        }
    }

    fn fail(&self, fault: AcquisitionFault) {
        error!(%fault, "acquisition run failed");
        *self.fault.lock() = Some(fault.clone());
        self.set_state(AcquisitionState::Error);
        self.emit(&AcquisitionEvent::Error(fault));
    }

    /// Never blocks. Lagging subscribers miss frame events but always get
    /// state and error events; closed ones are pruned.
    fn emit(&self, event: &AcquisitionEvent) {
        let is_frame = matches!(event, AcquisitionEvent::FrameReady(_));
        self.subscribers.lock().retain(|sub| {
            if is_frame && sub.tx.len() >= sub.frame_capacity {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

/// Runs the capture loop for one camera.
pub struct AcquisitionController<D: CameraDevice> {
    device: D,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: CameraDevice> AcquisitionController<D> {
    /// Create an idle controller. `initial.roi` must be legal for `geometry`.
    pub fn new(
        device: D,
        geometry: DeviceGeometry,
        initial: CaptureConfig,
        pipeline: Arc<FramePipeline>,
    ) -> Self {
        Self {
            device,
            shared: Arc::new(Shared {
                geometry,
                state: Mutex::new(AcquisitionState::Idle),
                exposure_s: Mutex::new(initial.exposure_time_s),
                delay_s: Mutex::new(initial.delay_time_s),
                roi: Mutex::new(initial.roi),
                fault: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                pipeline,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.shared.state()
    }

    /// The failure behind the `Error` state, if any.
    pub fn last_fault(&self) -> Option<AcquisitionFault> {
        self.shared.fault.lock().clone()
    }

    /// Configuration the loop will apply on its next cycle.
    pub fn config_snapshot(&self) -> CaptureConfig {
        self.shared.snapshot()
    }

    /// Sensor geometry used for ROI legalization.
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.shared.geometry
    }

    /// Pipeline frames are published to.
    pub fn pipeline(&self) -> &Arc<FramePipeline> {
        &self.shared.pipeline
    }

    /// The camera this controller drives.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Receive events. While `capacity` or more events are undelivered,
    /// `FrameReady` events are dropped for this subscriber. State changes
    /// and errors are always delivered.
    pub fn subscribe(&self, capacity: usize) -> Receiver<AcquisitionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.subscribers.lock().push(Subscriber {
            tx,
            frame_capacity: capacity.max(1),
        });
        rx
    }

    /// Subscribers still connected as of the last event.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Open the camera and launch the capture loop.
    ///
    /// Returns the current state without doing anything if a run is already
    /// in progress.
    pub fn start(&self) -> Result<AcquisitionState, ControlError> {
        let mut worker = self.worker.lock();
        match self.shared.state() {
            AcquisitionState::Idle => {}
            AcquisitionState::Error => return Err(ControlError::ResetRequired),
            state => {
                debug!(%state, "start ignored, run in progress");
                return Ok(state);
            }
        }

        let handle = self.device.open().map_err(ControlError::Open)?;
        info!(camera = %self.device.capabilities().card, "camera opened");

        self.shared.set_state(AcquisitionState::Running);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("acquisition".to_owned())
            .spawn(move || capture_loop(handle, &shared));

        match spawned {
            Ok(join) => {
                *worker = Some(join);
                Ok(AcquisitionState::Running)
            }
            Err(err) => {
                self.shared.set_state(AcquisitionState::Idle);
                Err(ControlError::Spawn(err))
            }
        }
    }

    /// Stop the loop and wait until it has closed the camera and exited.
    ///
    /// A no-op unless running. Returns `Idle`, or `Error` if the run failed
    /// before it could be stopped.
    pub fn stop(&self) -> AcquisitionState {
        let mut worker = self.worker.lock();
        let requested = {
            let mut state = self.shared.state.lock();
            if *state == AcquisitionState::Running {
                *state = AcquisitionState::StoppingRequested;
                true
            } else {
                false
            }
        };
        if requested {
            info!("stop requested");
            self.shared
                .emit(&AcquisitionEvent::StateChanged(AcquisitionState::StoppingRequested));
        }

        if let Some(join) = worker.take() {
            if join.join().is_err() {
                error!("acquisition thread panicked");
            }
        }

        if self.shared.state() == AcquisitionState::StoppingRequested {
            self.shared.set_state(AcquisitionState::Idle);
        }
        self.shared.state()
    }

    /// Leave the `Error` state so `start` is accepted again. No-op otherwise.
    pub fn reset(&self) -> AcquisitionState {
        let mut worker = self.worker.lock();
        if self.shared.state() != AcquisitionState::Error {
            return self.shared.state();
        }

        if let Some(join) = worker.take() {
            if join.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
        self.shared.fault.lock().take();
        self.shared.set_state(AcquisitionState::Idle);
        AcquisitionState::Idle
    }

    /// Set the exposure time in seconds.
    pub fn update_exposure(&self, seconds: f64) -> Result<(), ControlError> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(ControlError::InvalidParameter {
                name: "exposure",
                expected: "positive seconds",
                value: seconds,
            });
        }
        *self.shared.exposure_s.lock() = seconds;
        debug!(exposure_s = seconds, "exposure updated");
        Ok(())
    }

    /// Set the delay time in seconds.
    pub fn update_delay(&self, seconds: f64) -> Result<(), ControlError> {
        if !(seconds.is_finite() && seconds >= 0.0) {
            return Err(ControlError::InvalidParameter {
                name: "delay",
                expected: "non-negative seconds",
                value: seconds,
            });
        }
        *self.shared.delay_s.lock() = seconds;
        debug!(delay_s = seconds, "delay updated");
        Ok(())
    }

    /// Legalize `requested` against the current ROI and make it current.
    pub fn update_roi(&self, requested: &RequestedRectangle) -> Legalization {
        let result = {
            let mut roi = self.shared.roi.lock();
            let result = legalize(requested, &roi, &self.shared.geometry);
            *roi = result.rect;
            result
        };

        if result.adjusted {
            warn!(?requested, applied = %result.rect, "ROI adjusted to sensor constraints");
        } else {
            info!(roi = %result.rect, "ROI updated");
        }
        result
    }

    /// Execute a command.
    pub fn dispatch(&self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::Start => self.start().map(drop),
            Command::Stop => {
                self.stop();
                Ok(())
            }
            Command::Reset => {
                self.reset();
                Ok(())
            }
            Command::SetExposure(seconds) => self.update_exposure(seconds),
            Command::SetDelay(seconds) => self.update_delay(seconds),
            Command::SetRoi(requested) => {
                self.update_roi(&requested);
                Ok(())
            }
        }
    }
}

impl<D: CameraDevice> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<H: CameraHandle>(mut handle: H, shared: &Shared) {
    let mut published: u64 = 0;

    let fault = loop {
        let config = shared.snapshot();
        if let Err(err) = handle.apply_config(&config) {
            break Some(AcquisitionFault::Config(Arc::new(err)));
        }

        let raw = match handle.trigger_capture() {
            Ok(raw) => raw,
            Err(err) => break Some(AcquisitionFault::Capture(Arc::new(err))),
        };
        let frame = Arc::new(Frame::from_raw(raw, Local::now()));

        if shared.state() == AcquisitionState::StoppingRequested {
            debug!(sequence = frame.sequence, "stop observed, frame discarded");
            break None;
        }

        let version = shared.pipeline.publish(Arc::clone(&frame));
        trace!(
            version,
            sequence = frame.sequence,
            width = frame.width,
            height = frame.height,
            "frame published"
        );
        shared.emit(&AcquisitionEvent::FrameReady(frame));
        published += 1;
    };

    if let Err(err) = handle.close() {
        warn!(error = %err, "camera close failed");
    }
    info!(published, "acquisition loop exited");

    if let Some(fault) = fault {
        shared.fail(fault);
    }
}
