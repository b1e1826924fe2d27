//! Error types specific to card transport

use crate::transport::CardResponse;

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The reader could not be reached or failed while exchanging
    #[error("Reader I/O error: {0}")]
    Reader(String),

    /// The card was removed or stopped answering
    #[error("Card I/O error: {0}")]
    Card(String),

    /// The exchange did not complete in the transport's time budget
    #[error("Operation timed out")]
    Timeout,

    /// A response carried a status word outside the request's successful set
    ///
    /// The exchange stopped there; `partial` holds the responses received so
    /// far, the last one being the offending response.
    #[error("Unexpected status word, {} response(s) received", partial.apdus.len())]
    UnexpectedStatus {
        /// Responses received up to and including the unexpected one
        partial: CardResponse,
    },
}

impl TransportError {
    /// Create a new reader error
    pub fn reader<S: Into<String>>(message: S) -> Self {
        Self::Reader(message.into())
    }

    /// Create a new card error
    pub fn card<S: Into<String>>(message: S) -> Self {
        Self::Card(message.into())
    }
}
