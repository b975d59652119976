use std::path::PathBuf;
use thiserror::Error;

/// Failures that can occur while exporting a single record.
///
/// None of these cross a record boundary: the pipeline logs them, counts the
/// record as failed, and moves on. The only run-level failure is
/// [`ExportError::ArchiveNotFound`].
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unrecognized timestamp: {0:?}")]
    Parse(String),
    #[error("Source image not found: {0}")]
    NotFound(PathBuf),
    #[error("Metadata write failed: {0}")]
    MetadataWrite(String),
    #[error("Composite failed: {0}")]
    Composition(String),
    #[error("Malformed {file}: {source}")]
    Decode {
        file: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("No archive export found in {0}")]
    ArchiveNotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for ExportError {
    fn from(err: image::ImageError) -> Self {
        Self::Composition(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
