//! Image-file persistence for recorded frames.

use std::path::Path;

use image::{ColorType, ImageError, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::recorder::{Persistence, PersistenceError};
use crate::traits::Frame;

/// Supported output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFileFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// Uncompressed TIFF.
    Tiff,
}

impl ImageFileFormat {
    /// File extension without the dot.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Tiff => "tif",
        }
    }

    const fn encoder(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Tiff => ImageFormat::Tiff,
        }
    }
}

/// Writes 8-bit grayscale frames as image files, creating directories as
/// needed. Existing files are overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFilePersistence {
    format: ImageFileFormat,
}

impl ImageFilePersistence {
    /// Create a writer for `format`.
    pub const fn new(format: ImageFileFormat) -> Self {
        Self { format }
    }
}

impl Persistence for ImageFilePersistence {
    fn extension(&self) -> &str {
        self.format.extension()
    }

    fn save(&self, path: &Path, frame: &Frame) -> Result<(), PersistenceError> {
        // The encoders panic on a length mismatch instead of returning an error.
        let expected = u64::from(frame.width) * u64::from(frame.height);
        if u64::try_from(frame.pixels.len()).ok() != Some(expected) {
            return Err(PersistenceError::Encode {
                path: path.to_path_buf(),
                message: format!(
                    "{} samples for a {}x{} frame",
                    frame.pixels.len(),
                    frame.width,
                    frame.height
                ),
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        image::save_buffer_with_format(
            path,
            &frame.pixels,
            frame.width,
            frame.height,
            ColorType::L8,
            self.format.encoder(),
        )
        .map_err(|err| match err {
            ImageError::IoError(source) => PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => PersistenceError::Encode {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        })
    }
}
