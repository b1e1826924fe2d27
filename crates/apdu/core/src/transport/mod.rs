//! Transport traits for APDU communication with cards
//!
//! A transport is responsible for sending and receiving raw APDU bytes.
//! It has no knowledge of command structure, secure sessions or protocol
//! details beyond the successful status words attached to each request.

pub mod error;

use std::fmt;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

use crate::response::status::{StatusWord, common};
use crate::response::utils::status_of;

/// One APDU of a batch, with the status words the sender accepts as success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduRequest {
    /// Raw request bytes
    pub apdu: Bytes,
    /// Status words that do not interrupt the batch
    pub successful_status_words: Vec<StatusWord>,
    /// Short human readable name, used in logs
    pub info: &'static str,
}

impl ApduRequest {
    /// Create a request accepting only `90 00`
    pub fn new(apdu: Bytes, info: &'static str) -> Self {
        Self {
            apdu,
            successful_status_words: vec![common::SUCCESS],
            info,
        }
    }

    /// Replace the set of successful status words
    pub fn with_successful_status_words(mut self, status_words: Vec<StatusWord>) -> Self {
        self.successful_status_words = status_words;
        self
    }

    /// Whether `status` belongs to the successful set of this request
    pub fn is_successful(&self, status: StatusWord) -> bool {
        self.successful_status_words.contains(&status)
    }
}

/// An ordered batch of APDUs sent in a single exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardRequest {
    /// Requests, transmitted in order
    pub apdus: Vec<ApduRequest>,
    /// Stop at the first response whose status word is not successful
    pub stop_on_unsuccessful_status_word: bool,
}

impl CardRequest {
    /// Create a new batch
    pub const fn new(apdus: Vec<ApduRequest>, stop_on_unsuccessful_status_word: bool) -> Self {
        Self {
            apdus,
            stop_on_unsuccessful_status_word,
        }
    }
}

/// Responses to a [`CardRequest`], positionally matched with its requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardResponse {
    /// Raw responses (`DataOut || SW1 || SW2`)
    pub apdus: Vec<Bytes>,
    /// Whether the logical channel was left open after the exchange
    pub logical_channel_open: bool,
}

/// What the transport does with the logical channel after an exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelControl {
    /// Keep the channel open for further exchanges
    #[default]
    KeepOpen,
    /// Release the channel once the batch has been processed
    CloseAfter,
}

/// Trait for card transports
///
/// Implementors provide a single raw transmit and optionally override
/// [`CardTransport::exchange`] when the underlying reader supports batching.
pub trait CardTransport: fmt::Debug + Send {
    /// Send raw APDU bytes to card and return response bytes
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = %hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = %hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transmit_raw
    /// This is the method that concrete implementations should override
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Release the logical channel
    fn release_channel(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Transmit a batch of requests synchronously, in order
    ///
    /// When the batch asks for it, the exchange stops at the first response
    /// whose status word is not in the request's successful set and the
    /// responses received so far are returned through
    /// [`TransportError::UnexpectedStatus`].
    fn exchange(
        &mut self,
        request: &CardRequest,
        channel: ChannelControl,
    ) -> Result<CardResponse, TransportError> {
        let mut apdus = Vec::with_capacity(request.apdus.len());

        for apdu_request in &request.apdus {
            trace!(info = apdu_request.info, "Exchanging APDU");
            let response = self.transmit_raw(&apdu_request.apdu)?;
            let successful = status_of(&response).is_some_and(|sw| apdu_request.is_successful(sw));
            apdus.push(response);

            if !successful && request.stop_on_unsuccessful_status_word {
                debug!(
                    info = apdu_request.info,
                    "Unexpected status word, interrupting the exchange"
                );
                return Err(TransportError::UnexpectedStatus {
                    partial: CardResponse {
                        apdus,
                        logical_channel_open: true,
                    },
                });
            }
        }

        let logical_channel_open = match channel {
            ChannelControl::KeepOpen => true,
            ChannelControl::CloseAfter => {
                self.release_channel()?;
                false
            }
        };

        Ok(CardResponse {
            apdus,
            logical_channel_open,
        })
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    /// Mock responses to return
    pub responses: Vec<Bytes>,
    /// Commands that were sent
    pub commands: Vec<Bytes>,
    /// Whether the channel was released
    pub released: bool,
}

#[cfg(test)]
impl MockTransport {
    /// Create a new mock transport with the given responses
    pub(crate) const fn new(responses: Vec<Bytes>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
            released: false,
        }
    }
}

#[cfg(test)]
impl CardTransport for MockTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.commands.push(Bytes::copy_from_slice(command));

        if self.responses.is_empty() {
            return Err(TransportError::card("no more responses"));
        }

        Ok(self.responses.remove(0))
    }

    fn release_channel(&mut self) -> Result<(), TransportError> {
        self.released = true;
        Ok(())
    }
}
