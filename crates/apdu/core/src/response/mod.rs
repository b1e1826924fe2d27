//! APDU response definitions
//!
//! This module provides the response side of an ISO/IEC 7816-4 exchange:
//! `[DataOut] SW1 SW2`.

pub mod status;
pub mod utils;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::Error;
use status::StatusWord;

/// Basic APDU response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload data
    payload: Bytes,
    /// Status word
    status: StatusWord,
}

impl Response {
    /// Create a new response with payload and status
    pub fn new(payload: impl Into<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload: payload.into(),
            status: status.into(),
        }
    }

    /// Create a success response
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, StatusWord::new(0x90, 0x00))
    }

    /// Create an error response from a status word
    pub fn error(status: impl Into<StatusWord>) -> Self {
        Self::new(Bytes::new(), status)
    }

    /// Parse response from raw bytes (including status word)
    pub fn from_bytes(data: &Bytes) -> Result<Self, Error> {
        let (status, payload_len) = {
            let (status, payload) = utils::extract_status_and_payload(data)?;
            (status, payload.len())
        };

        trace!(
            sw1 = format_args!("{:#04x}", status.sw1),
            sw2 = format_args!("{:#04x}", status.sw2),
            payload_len,
            "Parsed APDU response"
        );

        Ok(Self {
            payload: data.slice(..payload_len),
            status,
        })
    }

    /// Get the response payload data
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Check if the response indicates success
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Serialize back to `DataOut || SW1 || SW2`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 2);
        buf.put_slice(&self.payload);
        buf.put_u8(self.status.sw1);
        buf.put_u8(self.status.sw2);
        buf.freeze()
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(&Bytes::copy_from_slice(data))
    }
}

impl From<Response> for Bytes {
    fn from(response: Response) -> Self {
        response.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_creation() {
        let resp = Response::new(Bytes::from_static(&[0x01, 0x02, 0x03]), (0x90, 0x00));
        assert_eq!(resp.payload().as_ref(), &[0x01, 0x02, 0x03]);
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
        assert!(resp.is_success());
    }

    #[test]
    fn test_response_from_bytes() {
        let data = Bytes::from_static(&[0x01, 0x02, 0x03, 0x90, 0x00]);
        let resp = Response::from_bytes(&data).unwrap();
        assert_eq!(resp.payload().as_ref(), &[0x01, 0x02, 0x03]);
        assert!(resp.is_success());
        assert_eq!(resp.to_bytes(), data);

        let data = Bytes::from_static(&[0x6A, 0x82]);
        let resp = Response::from_bytes(&data).unwrap();
        assert!(resp.payload().is_empty());
        assert!(!resp.is_success());

        let data = Bytes::from_static(&[0x01]);
        assert!(Response::from_bytes(&data).is_err());
    }
}
