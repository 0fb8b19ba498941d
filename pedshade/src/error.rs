use std::fmt::Display;
use std::path::Path;

/// Errors raised by both pipeline stages.
///
/// Every variant aborts the running stage; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing, unreadable or unwritable file.
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    /// Expected column, layer or feature is absent.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid or mismatched CRS.
    #[error("Projection error: {0}")]
    Projection(String),

    /// Raster and vector extent, CRS or band count do not line up.
    #[error("Raster mismatch: {0}")]
    RasterMismatch(String),

    /// Street network could not be fetched or decoded.
    #[error("Network extraction error: {0}")]
    Network(String),

    /// A geometry engine call failed.
    #[error("Geometry error: {0}")]
    Geometry(String),

    /// Configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, err: impl Display) -> Self {
        PipelineError::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<geos::Error> for PipelineError {
    fn from(err: geos::Error) -> Self {
        PipelineError::Geometry(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
