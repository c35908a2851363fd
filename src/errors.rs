use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for tile prediction.
///
/// Each variant carries the context of its failure domain (config, model
/// resolution, checkpoint, inference invariants, filesystem, imagery) so the
/// caller can match on the kind instead of parsing messages. Everything here
/// is fatal for a prediction run; nothing is retried.
#[derive(Error, Debug)]
pub enum TileSegError {
    #[error("Config error in {path:?}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Unknown model `{name}` (known models: {known})")]
    ModelNotFound { name: String, known: String },

    #[error("Checkpoint error for {path:?}: {reason}")]
    Checkpoint {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invariant violation on tile {tile}: {reason}")]
    InvariantViolation { tile: String, reason: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, TileSegError>;

impl TileSegError {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn model(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::Model {
            operation: operation.into(),
            source: reason.into(),
        }
    }
}

/// I/O errors without a known path. Code that has the path should build
/// `TileSegError::FileSystem` itself.
impl From<std::io::Error> for TileSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for TileSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<png::EncodingError> for TileSegError {
    fn from(err: png::EncodingError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "png encoding".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for TileSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor handling around the forward pass, so they
/// are reported as model errors.
impl From<ndarray::ShapeError> for TileSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
