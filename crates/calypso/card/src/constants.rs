//! Constants for Calypso card commands (revision 3 command set)

/// Class byte used by revision 3 cards
pub const CLA: u8 = 0x00;

/// Instruction bytes
pub mod ins {
    /// Open Secure Session
    pub const OPEN_SECURE_SESSION: u8 = 0x8A;
    /// Close Secure Session (also used to abort)
    pub const CLOSE_SECURE_SESSION: u8 = 0x8E;
    /// Manage Secure Session
    pub const MANAGE_SECURE_SESSION: u8 = 0x82;
    /// Read Record(s), also carries the ratification command
    pub const READ_RECORDS: u8 = 0xB2;
    /// Update Record
    pub const UPDATE_RECORD: u8 = 0xDC;
    /// Write Record
    pub const WRITE_RECORD: u8 = 0xD2;
    /// Append Record
    pub const APPEND_RECORD: u8 = 0xE2;
    /// Read Binary
    pub const READ_BINARY: u8 = 0xB0;
    /// Update Binary
    pub const UPDATE_BINARY: u8 = 0xD6;
    /// Write Binary
    pub const WRITE_BINARY: u8 = 0xD0;
    /// Increase
    pub const INCREASE: u8 = 0x32;
    /// Decrease
    pub const DECREASE: u8 = 0x30;
    /// SV Get
    pub const SV_GET: u8 = 0x7C;
    /// SV Reload
    pub const SV_RELOAD: u8 = 0xB8;
    /// SV Debit
    pub const SV_DEBIT: u8 = 0xBA;
    /// SV Undebit
    pub const SV_UNDEBIT: u8 = 0xBC;
}

/// Low bits of the Open Secure Session P2 byte
pub mod open_mode {
    /// Regular (4 byte challenges and MACs)
    pub const REGULAR: u8 = 0x01;
    /// Extended mode (8 byte challenges and MACs)
    pub const EXTENDED: u8 = 0x02;
    /// Asymmetric (PKI) session
    pub const PKI: u8 = 0x03;
}

/// Close Secure Session P1 asking the card to ratify on its own
pub const CLOSE_P1_IMPLICIT_RATIFICATION: u8 = 0x80;
/// Close Secure Session P2 of an asymmetric session
pub const CLOSE_P2_PKI: u8 = 0x01;

/// Read Records P2 low bits: read one record
pub const READ_ONE_RECORD: u8 = 0x04;
/// Read Records P2 low bits: read from the record up to the end of file
pub const READ_MULTIPLE_RECORDS: u8 = 0x05;
/// Read/Update/Write Binary P1 flag selecting by SFI
pub const BINARY_SFI_FLAG: u8 = 0x80;

/// Manage Secure Session P2 with encryption requested
pub const MANAGE_P2_ENCRYPTION_ON: u8 = 0x03;
/// Manage Secure Session P2 with encryption released
pub const MANAGE_P2_ENCRYPTION_OFF: u8 = 0x01;

/// SV Get P2 preparing a reload
pub const SV_GET_P2_RELOAD: u8 = 0x07;
/// SV Get P2 preparing a debit or an undebit
pub const SV_GET_P2_DEBIT: u8 = 0x09;

/// Terminal and card challenge length, regular mode
pub const CHALLENGE_LENGTH: usize = 4;
/// Terminal and card challenge length, extended and PKI modes
pub const EXTENDED_CHALLENGE_LENGTH: usize = 8;
/// Session MAC length, regular mode
pub const MAC_LENGTH: usize = 4;
/// Session MAC length, extended mode
pub const EXTENDED_MAC_LENGTH: usize = 8;
/// Card signature length of an asymmetric session
pub const PKI_SIGNATURE_LENGTH: usize = 64;

/// Counter values are 3 byte unsigned integers
pub const COUNTER_SIZE: usize = 3;
/// Largest value a counter can hold
pub const COUNTER_MAX: u32 = 0x00FF_FFFF;

/// SV Get response length when preparing a reload
pub const SV_GET_RELOAD_RESPONSE_LENGTH: usize = 33;
/// SV Get response length when preparing a debit
pub const SV_GET_DEBIT_RESPONSE_LENGTH: usize = 30;
/// SV signature (low part) returned by the card, regular mode
pub const SV_SIGNATURE_LENGTH: usize = 3;
/// SV signature (low part) returned by the card, extended mode
pub const EXTENDED_SV_SIGNATURE_LENGTH: usize = 6;

/// Fixed overhead charged per buffered command in byte counting mode
pub const SESSION_BUFFER_COMMAND_OVERHEAD: usize = 6;

/// KIF value meaning the card did not report a key identifier
pub const KIF_UNDEFINED: u8 = 0xFF;
