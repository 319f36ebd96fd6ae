//! Errors.

use std::{fmt::Display, time::Duration};

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

/// An error that occurred while trying to batch a request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BatchError<E: Display> {
    /// The request was rejected before touching any batch state.
    #[error("Invalid batch request: {0}")]
    InvalidRequest(InvalidRequest),

    /// This request's body could not be combined into the pending batch.
    ///
    /// Only the offending caller sees this. The batch and its other members are unaffected.
    #[error("Unable to add request {debug_id:?} to batch {key:?}: {source}")]
    CombineFailed {
        /// The batch key.
        key: String,
        /// The debug ID of the rejected request.
        debug_id: String,
        /// The error returned by the combine function.
        #[source]
        source: E,
    },

    /// This request's combine function panicked.
    ///
    /// Only the offending caller sees this. The batch and its other members are unaffected.
    #[error("Combine function panicked while adding request {debug_id:?} to batch {key:?}")]
    CombinePanicked {
        /// The batch key.
        key: String,
        /// The debug ID of the rejected request.
        debug_id: String,
    },

    /// The downstream send for the whole batch failed.
    ///
    /// Every caller in the batch receives the same underlying error.
    #[error("Error sending batch {key:?} for request {debug_id:?}: {source}")]
    BatchFailed {
        /// The batch key.
        key: String,
        /// The debug ID of the request that received this error.
        debug_id: String,
        /// The error returned by the send function.
        #[source]
        source: E,
    },

    /// The caller gave up waiting. The batch itself still gets sent.
    #[error("Request {debug_id:?} timed out after {timeout:?} waiting for batch {key:?}")]
    TimedOut {
        /// The batch key.
        key: String,
        /// The debug ID of the request that timed out.
        debug_id: String,
        /// The timeout given by the caller.
        timeout: Duration,
    },

    /// The batcher was stopped before the batch was sent.
    ///
    /// Unrecoverable.
    #[error("Batcher stopped before batch {key:?} was sent")]
    Stopped {
        /// The batch key.
        key: String,
    },

    /// Something went wrong while waiting for the output of a batch.
    ///
    /// Unrecoverable.
    #[error("Error while waiting for batch results: channel closed. {0}")]
    Rx(#[from] RecvError),

    /// The send was cancelled before completion.
    #[error("The batch send was cancelled")]
    Cancelled,

    /// The send panicked.
    #[error("The batch send panicked")]
    Panic,
}

/// Why a request was rejected up front.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidRequest {
    /// No combine function was given.
    #[error("missing combine function")]
    MissingCombine,
    /// No send function was given.
    #[error("missing send function")]
    MissingSend,
}

/// Result type for batch operations.
pub type BatchResult<T, E> = std::result::Result<T, BatchError<E>>;

impl<E: Display> From<InvalidRequest> for BatchError<E> {
    fn from(reason: InvalidRequest) -> Self {
        BatchError::InvalidRequest(reason)
    }
}

impl<E> BatchError<E>
where
    E: Display,
{
    /// Get the caller's own error for combine and send failures, otherwise self.
    pub fn inner(self) -> BatchResult<E, E> {
        match self {
            BatchError::CombineFailed { source, .. } => Ok(source),
            BatchError::BatchFailed { source, .. } => Ok(source),
            _ => Err(self),
        }
    }

    /// The batch key this error relates to, if known.
    pub fn key(&self) -> Option<&str> {
        match self {
            BatchError::CombineFailed { key, .. }
            | BatchError::CombinePanicked { key, .. }
            | BatchError::BatchFailed { key, .. }
            | BatchError::TimedOut { key, .. }
            | BatchError::Stopped { key } => Some(key),
            _ => None,
        }
    }
}
