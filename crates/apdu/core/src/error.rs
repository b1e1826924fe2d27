//! Core error type for APDU encoding, decoding and exchange

use crate::transport::TransportError;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Response shorter than a status word
    #[error("Incomplete response")]
    IncompleteResponse,

    /// Parse error when processing response
    #[error("Parse error: {0}")]
    Parse(&'static str),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Create a new parse error
    pub const fn parse(message: &'static str) -> Self {
        Self::Parse(message)
    }
}
