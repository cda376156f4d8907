//! Time-driven recording of pipeline frames.
//!
//! While armed, a ticker thread wakes at a fixed interval, takes the newest
//! frame from the pipeline and hands it to a [`Persistence`] backend. The
//! cadence is independent of the acquisition rate: ticks that find nothing new
//! are skipped, never queued.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pipeline::{Consumed, FrameCursor, FramePipeline};
use crate::traits::Frame;

/// Error returned by a [`Persistence`] backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Writing the file failed.
    #[error("failed to write {}: {source}", path.display())]
    Io {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Encoding the image failed.
    #[error("failed to encode {}: {message}", path.display())]
    Encode {
        /// Target file.
        path: PathBuf,
        /// Encoder message.
        message: String,
    },
}

/// Stores frames somewhere durable.
pub trait Persistence: Send + Sync {
    /// File extension (without the dot) for saved frames.
    fn extension(&self) -> &str;

    /// Save `frame` to `path`.
    fn save(&self, path: &Path, frame: &Frame) -> Result<(), PersistenceError>;
}

/// Error returned by [`RecordingScheduler::arm`].
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The scheduler is already ticking.
    #[error("recording is already armed")]
    AlreadyArmed,
    /// A zero interval was requested.
    #[error("recording interval must be non-zero")]
    ZeroInterval,
    /// The ticker thread could not be spawned.
    #[error("failed to spawn recording thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Whether the scheduler is ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// Not recording.
    Disarmed,
    /// Ticking at a fixed interval.
    Armed,
}

/// Tick outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Ticks handled.
    pub ticks: u64,
    /// Frames written.
    pub saved: u64,
    /// Ticks with no new frame or no target.
    pub skipped: u64,
    /// Writes that failed.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    saved: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// File name for a frame captured at `at`: `Image_YYYYMMDD_HHMMSS.<ext>`.
pub fn image_file_name(at: &DateTime<Local>, extension: &str) -> String {
    format!("Image_{}.{extension}", at.format("%Y%m%d_%H%M%S"))
}

struct Ticker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Everything one tick needs; shared with the ticker thread.
struct TickContext {
    pipeline: Arc<FramePipeline>,
    persistence: Arc<dyn Persistence>,
    target: Mutex<Option<PathBuf>>,
    /// Survives re-arming, so a frame is never saved twice.
    cursor: Mutex<FrameCursor>,
    counters: Counters,
}

/// Periodically saves the newest pipeline frame while armed.
pub struct RecordingScheduler {
    context: Arc<TickContext>,
    ticker: Option<Ticker>,
}

impl RecordingScheduler {
    /// Create a disarmed scheduler with no target.
    pub fn new(pipeline: Arc<FramePipeline>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            context: Arc::new(TickContext {
                pipeline,
                persistence,
                target: Mutex::new(None),
                cursor: Mutex::new(FrameCursor::default()),
                counters: Counters::default(),
            }),
            ticker: None,
        }
    }

    /// Directory frames are saved into. `None` makes ticks skip.
    pub fn set_target(&self, directory: Option<PathBuf>) {
        match &directory {
            Some(dir) => info!(target_dir = %dir.display(), "recording target set"),
            None => info!("recording target cleared"),
        }
        *self.context.target.lock() = directory;
    }

    /// Current target directory.
    pub fn target(&self) -> Option<PathBuf> {
        self.context.target.lock().clone()
    }

    /// Whether the scheduler is ticking.
    pub const fn state(&self) -> RecordingState {
        if self.ticker.is_some() {
            RecordingState::Armed
        } else {
            RecordingState::Disarmed
        }
    }

    /// Snapshot of the tick counters.
    pub fn stats(&self) -> RecordingStats {
        let counters = &self.context.counters;
        RecordingStats {
            ticks: counters.ticks.load(Ordering::Relaxed),
            saved: counters.saved.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Start ticking every `interval`. The first tick fires one interval
    /// from now.
    pub fn arm(&mut self, interval: Duration) -> Result<(), RecordingError> {
        if self.ticker.is_some() {
            return Err(RecordingError::AlreadyArmed);
        }
        if interval.is_zero() {
            return Err(RecordingError::ZeroInterval);
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let context = Arc::clone(&self.context);
        let join = thread::Builder::new()
            .name("recording".to_owned())
            .spawn(move || run_ticker(&context, interval, &stop_rx))
            .map_err(RecordingError::Spawn)?;

        self.ticker = Some(Ticker { stop_tx, join });
        info!(interval_ms = interval.as_millis(), "recording armed");
        Ok(())
    }

    /// Stop ticking. A tick already in progress completes first.
    pub fn disarm(&mut self) {
        let Some(Ticker { stop_tx, join }) = self.ticker.take() else {
            return;
        };
        drop(stop_tx);
        if join.join().is_err() {
            error!("recording thread panicked");
        }
        info!(stats = ?self.stats(), "recording disarmed");
    }
}

impl Drop for RecordingScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn run_ticker(context: &TickContext, interval: Duration, stop_rx: &Receiver<()>) {
    let ticks = crossbeam_channel::tick(interval);

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticks) -> _ => {
                // A tick that queued up during a slow save must not outlive disarm.
                if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                    break;
                }
                record_tick(context);
            }
        }
    }
}

fn record_tick(context: &TickContext) {
    let counters = &context.counters;
    counters.ticks.fetch_add(1, Ordering::Relaxed);

    // Checked before consuming so the frame is still new once a target is set.
    let Some(directory) = context.target.lock().clone() else {
        warn!("no recording target, tick skipped");
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut cursor = context.cursor.lock();
    let frame = match context.pipeline.consume(&mut cursor) {
        Consumed::Frame {
            frame,
            is_new: true,
        } => frame,
        Consumed::Frame { is_new: false, .. } => {
            debug!(version = cursor.last_seen(), "no new frame since last tick, skipping");
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Consumed::NoData => {
            debug!("no frame published yet, skipping");
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    drop(cursor);

    let persistence = &context.persistence;
    let path = directory.join(image_file_name(&frame.captured_at, persistence.extension()));
    match persistence.save(&path, &frame) {
        Ok(()) => {
            counters.saved.fetch_add(1, Ordering::Relaxed);
            info!(path = %path.display(), sequence = frame.sequence, "frame saved");
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "failed to save frame");
        }
    }
}
