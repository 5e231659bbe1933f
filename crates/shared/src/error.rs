//! Error types shared across Retouch crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetouchError {
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Unknown subscription status: {0}")]
    UnknownStatus(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
