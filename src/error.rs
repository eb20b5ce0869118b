//! Engine error taxonomy.

use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by administration and simulation.
#[derive(Debug, Error)]
pub enum Error {
    /// App or handler absent
    #[error("{0}")]
    NotFound(String),

    /// Duplicate id on create
    #[error("{0}")]
    Conflict(String),

    /// Rejected handler or app definition
    #[error("{0}")]
    Invalid(String),

    /// The app exists but none of its handlers accepts the request
    #[error("No matching handler found.")]
    NoMatchFound {
        app_id: String,
        method: String,
        path: String,
    },

    /// Store I/O failure
    #[error("persistence failure: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AppNotFound(_) | StoreError::HandlerNotFound { .. } => {
                Error::NotFound(err.to_string())
            }
            StoreError::AppExists(_)
            | StoreError::HandlerExists { .. }
            | StoreError::Exhausted { .. } => Error::Conflict(err.to_string()),
            StoreError::Backend(message) => Error::Persistence(message),
        }
    }
}
