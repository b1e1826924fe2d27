//! Terminal side of the Calypso card transaction protocol
//!
//! This crate builds the card commands of a transaction, runs them inside
//! secure sessions and keeps an image of the card content consistent with
//! what the card actually committed.
//!
//! ## Overview
//!
//! - [`TransactionManager`] prepares operations and exchanges them through a
//!   [`calypso_apdu_core::CardTransport`]
//! - Secure sessions are authenticated either by a symmetric back-end
//!   ([`crypto::SymmetricCryptoSpi`], usually a SAM) or by card signatures
//!   checked through a certificate chain ([`crypto::AsymmetricCryptoBackend`])
//! - [`CalypsoCard`] holds the file content read and written; an aborted
//!   session restores it as it was when the session opened
//! - Failures are reported as [`TransactionError`], carrying the
//!   [`AuditTrail`] of every exchange
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod card;
pub mod constants;
pub mod crypto;
pub mod settings;
pub mod status;

mod audit;
mod commands;
mod engine;
mod error;
mod session;
mod transaction;

pub use audit::{ApduExchange, AuditTrail};
pub use card::{BufferUnit, CalypsoCard, CardRuntime, FileHeader, FileType, SvData, SvOperation};
pub use commands::CommandKind;
pub use crypto::{AsymmetricCryptoBackend, CryptoBackend, CryptoError, SymmetricCryptoSpi};
pub use error::{
    CardCommandError, CertificateError, CommandErrorKind, Error, Result, SecurityError,
    TransactionError,
};
pub use session::SessionPhase;
pub use settings::{KeyReference, SecuritySetting, WriteAccessLevel};
pub use transaction::TransactionManager;
