//! Region-of-interest legalization.
//!
//! A sensor can only read out a discrete set of rectangles: horizontal edges
//! snap to a fixed step grid anchored at column 1, and the vertical band is
//! always centered on the sensor. [`legalize`] maps an arbitrary, partially
//! specified request onto the closest rectangle of that set and never fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::validate_legal_rectangle;

/// Error raised when a sensor geometry cannot host any legal rectangle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    /// A minimum or step value is zero.
    #[error("geometry field `{0}` must be at least 1")]
    Zero(&'static str),
    /// The minimum span is too small to keep the edges ordered.
    #[error("minimum {axis} span must be at least 2, got {value}")]
    SpanTooSmall {
        /// `"width"` or `"height"`.
        axis: &'static str,
        /// Offending value.
        value: u32,
    },
    /// The horizontal origin or minimum width is off the step grid.
    #[error("{field} = {value} is not aligned to step {step}")]
    Misaligned {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
        /// Horizontal alignment step.
        step: u32,
    },
    /// The minimum span does not fit on the sensor.
    #[error("minimum {axis} span does not fit between {min} and {max}")]
    DoesNotFit {
        /// `"horizontal"` or `"vertical"`.
        axis: &'static str,
        /// Lower coordinate bound.
        min: u32,
        /// Upper coordinate bound.
        max: u32,
    },
    /// A centered band of `min_height` rows cannot be placed on the sensor.
    #[error("max_ud - min_height must be even for a centered band (max_ud = {max_ud}, min_height = {min_height})")]
    OddCenter {
        /// Sensor height.
        max_ud: u32,
        /// Minimum band height.
        min_height: u32,
    },
}

/// Error raised when a concrete rectangle breaks the readout invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoiError {
    /// Left edge is before the first readable column.
    #[error("left edge {left} is below minimum {min}")]
    LeftOutOfRange {
        /// Left edge.
        left: u32,
        /// First readable column.
        min: u32,
    },
    /// Left edge is off the step grid.
    #[error("left edge {left} is not aligned to step {step}")]
    LeftMisaligned {
        /// Left edge.
        left: u32,
        /// Horizontal alignment step.
        step: u32,
    },
    /// Right edge is too close to the left edge or past the sensor.
    #[error("right edge {right} outside [{min}, {max}]")]
    RightOutOfRange {
        /// Right edge.
        right: u32,
        /// Smallest right edge allowed for the left edge.
        min: u32,
        /// Last readable column.
        max: u32,
    },
    /// Top edge is before the first readable row.
    #[error("top edge {top} is below minimum {min}")]
    TopOutOfRange {
        /// Top edge.
        top: u32,
        /// First readable row.
        min: u32,
    },
    /// The vertical band is not centered.
    #[error("bottom edge {bottom} does not mirror top edge (expected {expected})")]
    NotCentered {
        /// Bottom edge.
        bottom: u32,
        /// Bottom edge mirroring the top edge.
        expected: u32,
    },
    /// The vertical band is shorter than the minimum height.
    #[error("band {top}..={bottom} is shorter than {min_height} rows")]
    TooShort {
        /// Top edge.
        top: u32,
        /// Bottom edge.
        bottom: u32,
        /// Minimum band height.
        min_height: u32,
    },
}

/// Raw geometry values, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryParams {
    /// First readable column (1-based).
    pub min_lr: u32,
    /// First readable row (1-based).
    pub min_ud: u32,
    /// Minimum ROI width in columns.
    pub min_width: u32,
    /// Minimum ROI height in rows.
    pub min_height: u32,
    /// Last readable column.
    pub max_lr: u32,
    /// Last readable row.
    pub max_ud: u32,
    /// Horizontal alignment step.
    pub step_lr: u32,
}

/// Validated, immutable sensor geometry.
///
/// Every geometry that passes [`DeviceGeometry::new`] admits at least one
/// legal rectangle, which is what lets [`legalize`] be infallible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GeometryParams", into = "GeometryParams")]
pub struct DeviceGeometry {
    min_lr: u32,
    min_ud: u32,
    min_width: u32,
    min_height: u32,
    max_lr: u32,
    max_ud: u32,
    step_lr: u32,
}

impl DeviceGeometry {
    /// Validate raw geometry values.
    pub fn new(params: GeometryParams) -> Result<Self, GeometryError> {
        let GeometryParams {
            min_lr,
            min_ud,
            min_width,
            min_height,
            max_lr,
            max_ud,
            step_lr,
        } = params;

        for (name, value) in [
            ("min_lr", min_lr),
            ("min_ud", min_ud),
            ("step_lr", step_lr),
            ("max_lr", max_lr),
            ("max_ud", max_ud),
        ] {
            if value == 0 {
                return Err(GeometryError::Zero(name));
            }
        }
        if min_width < 2 {
            return Err(GeometryError::SpanTooSmall {
                axis: "width",
                value: min_width,
            });
        }
        if min_height < 2 {
            return Err(GeometryError::SpanTooSmall {
                axis: "height",
                value: min_height,
            });
        }
        if (min_lr - 1) % step_lr != 0 {
            return Err(GeometryError::Misaligned {
                field: "min_lr - 1",
                value: min_lr - 1,
                step: step_lr,
            });
        }
        if min_width % step_lr != 0 {
            return Err(GeometryError::Misaligned {
                field: "min_width",
                value: min_width,
                step: step_lr,
            });
        }
        if min_lr - 1 + min_width > max_lr {
            return Err(GeometryError::DoesNotFit {
                axis: "horizontal",
                min: min_lr,
                max: max_lr,
            });
        }
        if min_height > max_ud {
            return Err(GeometryError::DoesNotFit {
                axis: "vertical",
                min: min_ud,
                max: max_ud,
            });
        }
        if (max_ud - min_height) % 2 != 0 {
            return Err(GeometryError::OddCenter { max_ud, min_height });
        }
        if min_ud > (max_ud - min_height) / 2 + 1 {
            return Err(GeometryError::DoesNotFit {
                axis: "vertical",
                min: min_ud,
                max: max_ud,
            });
        }

        Ok(Self {
            min_lr,
            min_ud,
            min_width,
            min_height,
            max_lr,
            max_ud,
            step_lr,
        })
    }

    /// First readable column.
    pub const fn min_lr(&self) -> u32 {
        self.min_lr
    }

    /// First readable row.
    pub const fn min_ud(&self) -> u32 {
        self.min_ud
    }

    /// Minimum ROI width.
    pub const fn min_width(&self) -> u32 {
        self.min_width
    }

    /// Minimum ROI height.
    pub const fn min_height(&self) -> u32 {
        self.min_height
    }

    /// Last readable column.
    pub const fn max_lr(&self) -> u32 {
        self.max_lr
    }

    /// Last readable row.
    pub const fn max_ud(&self) -> u32 {
        self.max_ud
    }

    /// Horizontal alignment step.
    pub const fn step_lr(&self) -> u32 {
        self.step_lr
    }

    /// Largest top edge that still leaves `min_height` rows in a centered band.
    const fn max_top(&self) -> u32 {
        (self.max_ud - self.min_height) / 2 + 1
    }

    /// Smallest bottom edge of a centered band of `min_height` rows.
    const fn min_bottom(&self) -> u32 {
        (self.max_ud + self.min_height) / 2
    }
}

impl Default for DeviceGeometry {
    /// 2048 x 2048 sensor read out in 32-column steps.
    fn default() -> Self {
        Self {
            min_lr: 1,
            min_ud: 1,
            min_width: 192,
            min_height: 16,
            max_lr: 2048,
            max_ud: 2048,
            step_lr: 32,
        }
    }
}

impl TryFrom<GeometryParams> for DeviceGeometry {
    type Error = GeometryError;

    fn try_from(params: GeometryParams) -> Result<Self, Self::Error> {
        Self::new(params)
    }
}

impl From<DeviceGeometry> for GeometryParams {
    fn from(geometry: DeviceGeometry) -> Self {
        Self {
            min_lr: geometry.min_lr,
            min_ud: geometry.min_ud,
            min_width: geometry.min_width,
            min_height: geometry.min_height,
            max_lr: geometry.max_lr,
            max_ud: geometry.max_ud,
            step_lr: geometry.step_lr,
        }
    }
}

/// A capture rectangle as asked for by the user.
///
/// An absent edge means "leave this axis alone" unless the opposite edge on
/// the same axis is given, in which case it is derived from the current ROI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedRectangle {
    /// Left edge (1-based column).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<u32>,
    /// Top edge (1-based row).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    /// Right edge (inclusive column).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<u32>,
    /// Bottom edge (inclusive row).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<u32>,
}

impl RequestedRectangle {
    /// Request all four edges.
    pub const fn edges(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left: Some(left),
            top: Some(top),
            right: Some(right),
            bottom: Some(bottom),
        }
    }
}

/// A rectangle the sensor can read out as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LegalRectangle {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

impl LegalRectangle {
    /// Build a rectangle from explicit edges, checking it against `geometry`.
    pub fn try_new(
        left: u32,
        top: u32,
        right: u32,
        bottom: u32,
        geometry: &DeviceGeometry,
    ) -> Result<Self, RoiError> {
        let rect = Self {
            left,
            top,
            right,
            bottom,
        };
        validate_legal_rectangle(&rect, geometry)?;
        Ok(rect)
    }

    /// The widest, tallest rectangle the sensor supports.
    pub const fn full_sensor(geometry: &DeviceGeometry) -> Self {
        let origin = geometry.min_lr - 1;
        let span = geometry.max_lr - origin;
        Self {
            left: geometry.min_lr,
            top: geometry.min_ud,
            right: origin + geometry.step_lr * (span / geometry.step_lr),
            bottom: geometry.max_ud - geometry.min_ud + 1,
        }
    }

    /// Left edge.
    pub const fn left(&self) -> u32 {
        self.left
    }

    /// Top edge.
    pub const fn top(&self) -> u32 {
        self.top
    }

    /// Right edge (inclusive).
    pub const fn right(&self) -> u32 {
        self.right
    }

    /// Bottom edge (inclusive).
    pub const fn bottom(&self) -> u32 {
        self.bottom
    }

    /// Number of columns read out.
    pub const fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    /// Number of rows read out.
    pub const fn height(&self) -> u32 {
        self.bottom - self.top + 1
    }

    /// The same rectangle with every edge explicitly requested.
    pub const fn as_request(&self) -> RequestedRectangle {
        RequestedRectangle::edges(self.left, self.top, self.right, self.bottom)
    }
}

impl std::fmt::Display for LegalRectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {})-({}, {}) [{}x{}]",
            self.left,
            self.top,
            self.right,
            self.bottom,
            self.width(),
            self.height()
        )
    }
}

/// Outcome of [`legalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Legalization {
    /// The rectangle that will actually be read out.
    pub rect: LegalRectangle,
    /// Whether any requested edge had to be moved.
    pub adjusted: bool,
}

/// Map `requested` onto a rectangle the sensor supports.
///
/// `current` must itself be legal for `geometry`; it supplies edges the
/// request leaves out. On each axis the first-listed edge (`left`, `top`) is
/// the master when both are given.
pub fn legalize(
    requested: &RequestedRectangle,
    current: &LegalRectangle,
    geometry: &DeviceGeometry,
) -> Legalization {
    let (left, right) = legalize_horizontal(requested.left, requested.right, current, geometry);
    let (top, bottom) = legalize_vertical(requested.top, requested.bottom, current, geometry);
    let rect = LegalRectangle {
        left,
        top,
        right,
        bottom,
    };
    debug_assert!(
        validate_legal_rectangle(&rect, geometry).is_ok(),
        "legalize produced {rect} for {geometry:?}"
    );

    let moved = |asked: Option<u32>, got: u32| asked.is_some_and(|value| value != got);
    let adjusted = moved(requested.left, left)
        || moved(requested.top, top)
        || moved(requested.right, right)
        || moved(requested.bottom, bottom);

    Legalization { rect, adjusted }
}

fn legalize_horizontal(
    left: Option<u32>,
    right: Option<u32>,
    current: &LegalRectangle,
    geometry: &DeviceGeometry,
) -> (u32, u32) {
    let step = geometry.step_lr;
    let min_width = geometry.min_width;

    match (left, right) {
        (None, None) => (current.left, current.right),
        (Some(left), right) => {
            let left = bounded(left, geometry.min_lr, geometry.max_lr - min_width + 1);
            let left = 1 + step * ((left - 1) / step);

            let right = right.unwrap_or(current.right);
            let right = bounded(right, left + min_width - 1, geometry.max_lr);
            let right = left - 1 + step * ((right - (left - 1)) / step);
            (left, right)
        }
        (None, Some(right)) => {
            let right = bounded(right, geometry.min_lr - 1 + min_width, geometry.max_lr);
            let right = step * (right / step);

            let left = bounded(current.left, geometry.min_lr, right - min_width + 1);
            let left = right + 1 - step * ((right - (left - 1)) / step);
            (left, right)
        }
    }
}

fn legalize_vertical(
    top: Option<u32>,
    bottom: Option<u32>,
    current: &LegalRectangle,
    geometry: &DeviceGeometry,
) -> (u32, u32) {
    let max_ud = geometry.max_ud;

    match (top, bottom) {
        (None, None) => (current.top, current.bottom),
        (Some(top), _) => {
            let top = bounded(top, geometry.min_ud, geometry.max_top());
            (top, max_ud - top + 1)
        }
        (None, Some(bottom)) => {
            // Upper bound keeps the mirrored top edge at or after min_ud.
            let bottom = bounded(bottom, geometry.min_bottom(), max_ud - geometry.min_ud + 1);
            (max_ud - bottom + 1, bottom)
        }
    }
}

/// Clamp without the `lo <= hi` panic of `Ord::clamp`; `lo` wins on inversion.
fn bounded(value: u32, lo: u32, hi: u32) -> u32 {
    value.min(hi).max(lo)
}
