//! Single-slot, last-write-wins frame hand-off.
//!
//! The acquisition thread overwrites the slot on every cycle and never waits
//! on a reader. Each consumer keeps its own [`FrameCursor`] and sees only the
//! freshest frame; unread frames are discarded, not queued.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::traits::Frame;

#[derive(Debug)]
struct Published {
    version: u64,
    frame: Arc<Frame>,
}

/// Shared slot holding the most recent frame.
#[derive(Debug, Default)]
pub struct FramePipeline {
    slot: Mutex<Option<Published>>,
}

/// Per-consumer record of the last version seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCursor {
    last_seen: u64,
}

impl FrameCursor {
    /// Version of the last frame this cursor consumed, 0 if none.
    pub const fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

/// Result of [`FramePipeline::consume`].
#[derive(Debug, Clone)]
pub enum Consumed {
    /// Nothing has been published yet.
    NoData,
    /// The current frame.
    Frame {
        /// Shared, read-only frame.
        frame: Arc<Frame>,
        /// Whether the frame was published after this cursor last looked.
        is_new: bool,
    },
}

impl Consumed {
    /// The frame, if it is new to the caller.
    pub fn new_frame(self) -> Option<Arc<Frame>> {
        match self {
            Self::Frame {
                frame,
                is_new: true,
            } => Some(frame),
            _ => None,
        }
    }
}

impl FramePipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents. Returns the new version (starting at 1).
    pub fn publish(&self, frame: Arc<Frame>) -> u64 {
        let mut slot = self.slot.lock();
        let version = slot.as_ref().map_or(0, |published| published.version) + 1;
        *slot = Some(Published { version, frame });
        version
    }

    /// Read the current frame and advance `cursor` to it.
    pub fn consume(&self, cursor: &mut FrameCursor) -> Consumed {
        let slot = self.slot.lock();
        match slot.as_ref() {
            None => Consumed::NoData,
            Some(published) => {
                let is_new = published.version > cursor.last_seen;
                cursor.last_seen = published.version;
                Consumed::Frame {
                    frame: Arc::clone(&published.frame),
                    is_new,
                }
            }
        }
    }

    /// The current frame, without touching any cursor.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot
            .lock()
            .as_ref()
            .map(|published| Arc::clone(&published.frame))
    }

    /// Total number of frames published so far.
    pub fn frames_published(&self) -> u64 {
        self.slot
            .lock()
            .as_ref()
            .map_or(0, |published| published.version)
    }
}
