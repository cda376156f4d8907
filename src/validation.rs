//! Invariant checks for readout rectangles and captured frame streams.
//!
//! [`validate_legal_rectangle`] is the post-condition of ROI legalization;
//! the frame checks verify what a consumer of the pipeline actually sees.

use std::sync::Arc;

use thiserror::Error;

use crate::roi::{DeviceGeometry, LegalRectangle, RoiError};
use crate::traits::Frame;

/// Minimum luminance span expected across a gradient frame.
const MIN_GRADIENT_SPAN: u8 = 50;

/// Error raised by the frame checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameCheckError {
    /// No frames to check.
    #[error("cannot validate an empty frame sequence")]
    Empty,
    /// Frame dimensions do not match the readout rectangle.
    #[error("frame is {actual:?}, expected {expected:?}")]
    Dimensions {
        /// Width and height of the frame.
        actual: (u32, u32),
        /// Width and height of the ROI.
        expected: (u32, u32),
    },
    /// Sample buffer length does not match the dimensions.
    #[error("frame holds {actual} samples, expected {expected}")]
    BufferLength {
        /// Samples present.
        actual: usize,
        /// `width * height`.
        expected: usize,
    },
    /// Sequence numbers went backwards or repeated.
    #[error("sequence {current} at index {index} does not follow {previous}")]
    OutOfOrder {
        /// Index of the offending frame.
        index: usize,
        /// Previous sequence number.
        previous: u64,
        /// Offending sequence number.
        current: u64,
    },
    /// Luminance decreased along the sampled row.
    #[error("gradient decreases at x={x}: {value} < {previous}")]
    NotMonotonic {
        /// Column of the decrease.
        x: u32,
        /// Sample at `x`.
        value: u8,
        /// Sample before `x`.
        previous: u8,
    },
    /// The sampled row is nearly flat.
    #[error("gradient spans only {span} levels")]
    Flat {
        /// Difference between last and first sample.
        span: u8,
    },
}

/// Check `rect` against every readout invariant of `geometry`.
pub fn validate_legal_rectangle(
    rect: &LegalRectangle,
    geometry: &DeviceGeometry,
) -> Result<(), RoiError> {
    let (left, top, right, bottom) = (rect.left(), rect.top(), rect.right(), rect.bottom());

    if left < geometry.min_lr() {
        return Err(RoiError::LeftOutOfRange {
            left,
            min: geometry.min_lr(),
        });
    }
    if (left - 1) % geometry.step_lr() != 0 {
        return Err(RoiError::LeftMisaligned {
            left,
            step: geometry.step_lr(),
        });
    }
    let min_right = left + geometry.min_width() - 1;
    if right < min_right || right > geometry.max_lr() {
        return Err(RoiError::RightOutOfRange {
            right,
            min: min_right,
            max: geometry.max_lr(),
        });
    }

    if top < geometry.min_ud() {
        return Err(RoiError::TopOutOfRange {
            top,
            min: geometry.min_ud(),
        });
    }
    let expected = geometry.max_ud().checked_sub(top).map(|rest| rest + 1);
    if expected != Some(bottom) {
        return Err(RoiError::NotCentered {
            bottom,
            expected: expected.unwrap_or(0),
        });
    }
    if top + geometry.min_height() - 1 > bottom {
        return Err(RoiError::TooShort {
            top,
            bottom,
            min_height: geometry.min_height(),
        });
    }

    Ok(())
}

/// Check that `frame` is exactly the size of `roi`.
pub fn validate_frame_matches_roi(
    frame: &Frame,
    roi: &LegalRectangle,
) -> Result<(), FrameCheckError> {
    let actual = (frame.width, frame.height);
    let expected = (roi.width(), roi.height());
    if actual != expected {
        return Err(FrameCheckError::Dimensions { actual, expected });
    }

    let samples = u64::from(frame.width) * u64::from(frame.height);
    let samples = usize::try_from(samples).unwrap_or(usize::MAX);
    if frame.pixels.len() != samples {
        return Err(FrameCheckError::BufferLength {
            actual: frame.pixels.len(),
            expected: samples,
        });
    }

    Ok(())
}

/// Check that frames seen by one consumer have strictly increasing sequence
/// numbers. Gaps are allowed: the pipeline drops frames nobody read.
pub fn validate_frame_sequence(frames: &[Arc<Frame>]) -> Result<(), FrameCheckError> {
    if frames.is_empty() {
        return Err(FrameCheckError::Empty);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [previous, current] = pair {
            if current.sequence <= previous.sequence {
                return Err(FrameCheckError::OutOfOrder {
                    index: index + 1,
                    previous: previous.sequence,
                    current: current.sequence,
                });
            }
        }
    }

    Ok(())
}

/// Check that the middle row of `frame` brightens from left to right.
pub fn validate_gradient(frame: &Frame) -> Result<(), FrameCheckError> {
    let center_y = frame.height / 2;
    let mut first: Option<u8> = None;
    let mut previous: Option<u8> = None;

    for x in 0..frame.width {
        let Some(value) = frame.pixel_at(x, center_y) else {
            break;
        };
        if let Some(previous) = previous {
            if value < previous {
                return Err(FrameCheckError::NotMonotonic { x, value, previous });
            }
        }
        first.get_or_insert(value);
        previous = Some(value);
    }

    let span = match (first, previous) {
        (Some(first), Some(last)) => last.saturating_sub(first),
        _ => 0,
    };
    if span < MIN_GRADIENT_SPAN {
        return Err(FrameCheckError::Flat { span });
    }

    Ok(())
}
