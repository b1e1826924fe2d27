//! Stored Value data as returned by SV Get

use bytes::Bytes;

use crate::commands::{CommandKind, check_length};
use crate::constants::{SV_GET_DEBIT_RESPONSE_LENGTH, SV_GET_RELOAD_RESPONSE_LENGTH};
use crate::error::Result;

/// Kind of SV operation an SV Get prepares
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SvOperation {
    /// Reload
    #[display("reload")]
    Reload,
    /// Debit or undebit
    #[display("debit")]
    Debit,
}

/// Last reload recorded by the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvLoadLog {
    /// Date of the operation
    pub date: u16,
    /// Free byte before the KVC
    pub free1: u8,
    /// KVC of the key used
    pub kvc: u8,
    /// Free byte after the KVC
    pub free2: u8,
    /// Balance after the operation
    pub balance: i32,
    /// Amount loaded
    pub amount: i32,
    /// Time of the operation
    pub time: u16,
    /// SAM serial number
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_transaction_number: u32,
    /// SV transaction number
    pub sv_transaction_number: u16,
}

/// Last debit recorded by the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvDebitLog {
    /// Amount debited
    pub amount: i16,
    /// Date of the operation
    pub date: u16,
    /// Time of the operation
    pub time: u16,
    /// KVC of the key used
    pub kvc: u8,
    /// SAM serial number
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_transaction_number: u32,
    /// Balance after the operation
    pub balance: i32,
    /// SV transaction number
    pub sv_transaction_number: u16,
}

/// Logs carried by an SV Get response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvLog {
    /// Preparing a reload
    Load(SvLoadLog),
    /// Preparing a debit
    Debit(SvDebitLog),
}

/// SV state of the card, after an SV Get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvData {
    /// KVC of the SV key to use
    pub kvc: u8,
    /// SV transaction number
    pub transaction_number: u16,
    /// Low part of the previous SV signature
    pub previous_signature: [u8; 3],
    /// SV challenge
    pub challenge: [u8; 2],
    /// Current balance
    pub balance: i32,
    /// Last operation log
    pub log: SvLog,
    /// Raw SV Get request, input of the SV security data
    pub get_request: Bytes,
    /// Raw SV Get response, input of the SV security data
    pub get_response: Bytes,
}

impl SvData {
    /// Parse a raw SV Get response (`DataOut || SW1 || SW2`)
    pub fn parse(operation: SvOperation, request: Bytes, response: Bytes) -> Result<Self> {
        let payload = &response[..response.len().saturating_sub(2)];
        let expected = match operation {
            SvOperation::Reload => SV_GET_RELOAD_RESPONSE_LENGTH,
            SvOperation::Debit => SV_GET_DEBIT_RESPONSE_LENGTH,
        };
        check_length(CommandKind::SvGet, expected, payload.len())?;

        let log = &payload[11..];
        let log = match operation {
            SvOperation::Reload => SvLog::Load(SvLoadLog {
                date: be_u16(&log[0..2]),
                free1: log[2],
                kvc: log[3],
                free2: log[4],
                balance: be_i24(&log[5..8]),
                amount: be_i24(&log[8..11]),
                time: be_u16(&log[11..13]),
                sam_id: [log[13], log[14], log[15], log[16]],
                sam_transaction_number: be_u24(&log[17..20]),
                sv_transaction_number: be_u16(&log[20..22]),
            }),
            SvOperation::Debit => SvLog::Debit(SvDebitLog {
                amount: i16::from_be_bytes([log[0], log[1]]),
                date: be_u16(&log[2..4]),
                time: be_u16(&log[4..6]),
                kvc: log[6],
                sam_id: [log[7], log[8], log[9], log[10]],
                sam_transaction_number: be_u24(&log[11..14]),
                balance: be_i24(&log[14..17]),
                sv_transaction_number: be_u16(&log[17..19]),
            }),
        };

        Ok(Self {
            kvc: payload[0],
            transaction_number: be_u16(&payload[1..3]),
            previous_signature: [payload[3], payload[4], payload[5]],
            challenge: [payload[6], payload[7]],
            balance: be_i24(&payload[8..11]),
            log,
            get_request: request,
            get_response: response,
        })
    }

    /// Operation the SV Get prepared
    pub const fn operation(&self) -> SvOperation {
        match self.log {
            SvLog::Load(_) => SvOperation::Reload,
            SvLog::Debit(_) => SvOperation::Debit,
        }
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Signed 24 bit big endian integer
fn be_i24(bytes: &[u8]) -> i32 {
    let sign = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    i32::from_be_bytes([sign, bytes[0], bytes[1], bytes[2]])
}

/// Encode a signed amount on 24 bits
pub(crate) fn i24_bytes(value: i32) -> [u8; 3] {
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}
