//! Error types for the event index.
//!
//! Configuration and bounds errors are caller errors and are returned as-is.
//! Backend failures are surfaced rather than treated as empty data, since
//! silently losing paged events would corrupt aggregate statistics.

use std::io;
use thiserror::Error;

/// Errors that can occur in event index operations
#[derive(Debug, Error)]
pub enum MdError {
    /// A coordinate lies outside the root extents on the strict insert path.
    #[error("Coordinate out of bounds: {coords:?}")]
    OutOfBounds { coords: Vec<f64> },

    /// A pre-flight resource check failed before any structure was built.
    #[error("Resource error: {0}")]
    Resource(String),

    /// The controller configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The file backend failed to read or write a leaf's events.
    #[error("Backend I/O error: {0}")]
    BackendIo(#[from] io::Error),

    /// A paged event block could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MdError {
    pub(crate) fn out_of_bounds(coords: &[f64]) -> Self {
        MdError::OutOfBounds {
            coords: coords.to_vec(),
        }
    }

    /// True for failures that originate in the file backend.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, MdError::BackendIo(_) | MdError::Serialization(_))
    }
}

/// Result type for event index operations
pub type MdResult<T> = Result<T, MdError>;
