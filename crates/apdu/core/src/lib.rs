//! Core types for APDU (Application Protocol Data Unit) exchanges
//!
//! This crate provides the foundational types for working with smart card
//! APDU commands and responses according to ISO/IEC 7816-4, and the
//! boundary through which they reach a card.
//!
//! ## Overview
//!
//! - Creating and parsing APDU commands and responses
//! - Status word interpretation
//! - Batched, synchronous exchanges through a [`CardTransport`]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod response;
pub mod transport;

mod error;
pub use error::Error;

pub use command::{Command, ExpectedLength};
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{
    ApduRequest, CardRequest, CardResponse, CardTransport, ChannelControl, TransportError,
};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        ApduRequest, Bytes, BytesMut, CardRequest, CardResponse, CardTransport, ChannelControl,
        Command, Error, Response, StatusWord, TransportError,
        response::status::common as status,
    };
}
