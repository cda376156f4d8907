//! Live-Cam-Capture: ROI legalization and threaded live acquisition for
//! scientific cameras.
//!
//! A single [`AcquisitionController`] owns the camera on a dedicated thread
//! and publishes normalized frames into a last-write-wins [`FramePipeline`].
//! Display and [`RecordingScheduler`] consumers read from the pipeline at
//! their own cadence. Camera access goes through the [`CameraDevice`] and
//! [`CameraHandle`] traits, so the V4L2 backend and the in-process
//! [`MockCamera`] are interchangeable.

pub mod config;
pub mod controller;
pub mod device;
pub mod mock;
pub mod persistence;
pub mod pipeline;
pub mod recorder;
pub mod roi;
pub mod traits;
pub mod validation;

pub use config::{AppConfig, CaptureConfig};
pub use controller::{AcquisitionController, AcquisitionEvent, AcquisitionState, Command};
pub use device::V4L2Device;
pub use mock::MockCamera;
pub use persistence::{ImageFileFormat, ImageFilePersistence};
pub use pipeline::{Consumed, FrameCursor, FramePipeline};
pub use recorder::{Persistence, RecordingScheduler};
pub use roi::{legalize, DeviceGeometry, LegalRectangle, Legalization, RequestedRectangle};
pub use traits::{
    CameraDevice, CameraError, CameraHandle, DeviceCapabilities, DisplaySink, Frame, RawFrame,
    RawPixels,
};
