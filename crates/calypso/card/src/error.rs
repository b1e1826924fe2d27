//! Error types for Calypso card transactions

use calypso_apdu_core::{StatusWord, TransportError};

use crate::audit::AuditTrail;
use crate::commands::CommandKind;

/// Result type for Calypso card operations
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a status word the card answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CommandErrorKind {
    /// Access forbidden by the file access conditions
    #[display("access")]
    Access,
    /// The targeted file or record is not usable by the command
    #[display("data access")]
    DataAccess,
    /// A value computed by the card would leave its allowed range
    #[display("data out of bounds")]
    DataOutOfBounds,
    /// Incorrect parameter or length
    #[display("illegal parameter")]
    IllegalParameter,
    /// The card refused a cryptographic value (signature, MAC)
    #[display("security data")]
    SecurityData,
    /// The security context of the card does not allow the command
    #[display("security context")]
    SecurityContext,
    /// The card modification buffer is full
    #[display("session buffer overflow")]
    SessionBufferOverflow,
    /// The card or its application is terminated
    #[display("terminated")]
    Terminated,
    /// Status word not listed for the command
    #[display("unknown status")]
    UnknownStatus,
}

/// Non-success status word returned by the card to a command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{command} failed with {status} ({kind}): {message}")]
pub struct CardCommandError {
    /// Command that received the status word
    pub command: CommandKind,
    /// Status word received
    pub status: StatusWord,
    /// Description of the status word for this command
    pub message: &'static str,
    /// Category of the failure
    pub kind: CommandErrorKind,
}

impl CardCommandError {
    /// Whether the card reported a missing file or record
    pub const fn is_missing_data(&self) -> bool {
        self.status.is_file_not_found() || self.status.is_record_not_found()
    }
}

/// Failures of the secure session security context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// The card session authenticator (MAC or signature) did not verify
    #[error("Invalid card session authenticator")]
    InvalidCardAuthenticator,

    /// The crypto back-end could not attempt the verification
    #[error("Card session authenticator not verifiable: {0}")]
    AuthenticatorNotVerifiable(String),

    /// The SV MAC returned by the card did not verify
    #[error("Invalid card SV MAC")]
    InvalidSvMac,

    /// An SV operation was done in session but the card returned no SV MAC
    #[error("Missing card SV MAC in close session response")]
    MissingSvMac,

    /// The session or SV key is not authorized by the security setting
    #[error("Unauthorized key (KIF {kif:02X}h, KVC {kvc:02X}h)")]
    UnauthorizedKey {
        /// Key identifier
        kif: u8,
        /// Key version and category
        kvc: u8,
    },

    /// The open session response does not match the pre-open data
    #[error("Open session response differs from the pre-open data")]
    PreOpenMismatch,

    /// A response differs from what was anticipated to update the authenticator
    #[error("Card response to {0} differs from the anticipated response")]
    AnticipatedResponseMismatch(CommandKind),
}

/// Failures while building the certificate chain of an asymmetric session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    /// The issuer of the certificate is not in the store
    #[error("Issuer not registered: {0}")]
    IssuerNotRegistered(String),

    /// A certificate with the same key reference is already registered
    #[error("Certificate already registered: {0}")]
    DuplicateCertificate(String),

    /// The certificate signature or content is invalid
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(&'static str),
}

/// Error type for Calypso card operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The card answered a command with a non-success status word
    #[error(transparent)]
    CardCommand(#[from] CardCommandError),

    /// The length of a response does not match what the command requires
    #[error("Unexpected response length to {command}: expected {expected}, got {actual}")]
    UnexpectedResponseLength {
        /// Command that received the response
        command: CommandKind,
        /// Required length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// The number of responses does not match the number of requests
    #[error("Inconsistent exchange: {requests} requests, {responses} responses")]
    InconsistentExchangeCount {
        /// Requests sent
        requests: usize,
        /// Responses received
        responses: usize,
    },

    /// Security context failure
    #[error(transparent)]
    SecurityContext(#[from] SecurityError),

    /// The command does not fit in the card modification buffer
    #[error("Session buffer overflow: {required} required, {available} available")]
    SessionBufferOverflow {
        /// Units required by the command
        required: usize,
        /// Units left in the buffer
        available: usize,
    },

    /// Reader communication failure
    #[error("Reader I/O error: {0}")]
    ReaderIo(String),

    /// Card communication failure
    #[error("Card I/O error: {0}")]
    CardIo(String),

    /// The reader timed out
    #[error("Reader timeout")]
    ReaderTimeout,

    /// Certificate chain failure
    #[error(transparent)]
    CertificateChain(#[from] CertificateError),

    /// The crypto back-end failed outside of a verification
    #[error("Crypto back-end error: {0}")]
    Crypto(String),

    /// An operation was requested in a state that does not allow it
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// An argument is outside of its allowed range
    #[error("Illegal argument: {0}")]
    IllegalArgument(&'static str),

    /// Data received from the card is inconsistent
    #[error("Inconsistent data: {0}")]
    InconsistentData(&'static str),

    /// APDU encoding failure
    #[error(transparent)]
    Apdu(#[from] calypso_apdu_core::Error),
}

impl Error {
    /// Create an illegal state error
    pub const fn illegal_state(message: &'static str) -> Self {
        Self::IllegalState(message)
    }

    /// Create an illegal argument error
    pub const fn illegal_argument(message: &'static str) -> Self {
        Self::IllegalArgument(message)
    }

    /// Create an inconsistent data error
    pub const fn inconsistent_data(message: &'static str) -> Self {
        Self::InconsistentData(message)
    }

    /// Whether this error belongs to the security context category
    pub const fn is_security_error(&self) -> bool {
        matches!(self, Self::SecurityContext(_))
    }

    /// Whether this error is a missing file or record reported by the card
    pub const fn is_missing_data(&self) -> bool {
        match self {
            Self::CardCommand(e) => e.is_missing_data(),
            _ => false,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Reader(message) => Self::ReaderIo(message),
            TransportError::Card(message) => Self::CardIo(message),
            TransportError::Timeout => Self::ReaderTimeout,
            TransportError::UnexpectedStatus { .. } => {
                Self::CardIo("exchange interrupted by an unexpected status word".to_string())
            }
        }
    }
}

/// Error returned by a transaction, with the exchanges that led to it
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct TransactionError {
    /// Underlying error
    #[source]
    pub error: Error,
    /// APDU exchanges of the transaction up to the failure
    pub audit_trail: AuditTrail,
}

impl TransactionError {
    /// Attach the audit trail to an error
    pub const fn new(error: Error, audit_trail: AuditTrail) -> Self {
        Self { error, audit_trail }
    }

    /// Underlying error
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Consume and return the underlying error
    pub fn into_error(self) -> Error {
        self.error
    }
}
