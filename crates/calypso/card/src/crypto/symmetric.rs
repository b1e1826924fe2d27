//! Symmetric session authenticator interface

use std::fmt;

use bytes::Bytes;

use super::CryptoError;

/// Input of the SV security data computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvSecurityInput {
    /// Raw SV Get request
    pub sv_get_request: Bytes,
    /// Raw SV Get response, status word included
    pub sv_get_response: Bytes,
    /// SV command APDU without its security data
    pub sv_command_partial_request: Bytes,
}

/// Terminal part of an SV command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvSecurityData {
    /// Serial number of the SAM
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_transaction_number: [u8; 3],
    /// High part of the SV signature (5 bytes, 10 in extended mode)
    pub terminal_sv_mac: Bytes,
}

impl SvSecurityData {
    /// Bytes appended to the SV command data
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = Vec::with_capacity(7 + self.terminal_sv_mac.len());
        bytes.extend_from_slice(&self.sam_id);
        bytes.extend_from_slice(&self.sam_transaction_number);
        bytes.extend_from_slice(&self.terminal_sv_mac);
        bytes.into()
    }
}

/// Symmetric crypto service driving the session authenticator
///
/// Typically implemented on top of a SAM. The engine calls it in exchange
/// order; implementations keep whatever digest state they need between calls.
pub trait SymmetricCryptoSpi: fmt::Debug + Send {
    /// Start a new session context and return the terminal challenge
    ///
    /// The challenge is 4 bytes long, 8 in extended mode.
    fn init_session_context(&mut self, extended: bool) -> Result<Bytes, CryptoError>;

    /// Seed the authenticator with the Open Secure Session output and the session key
    fn init_session_authenticator(
        &mut self,
        open_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError>;

    /// Feed one APDU (request or response) to the authenticator
    ///
    /// Returns the transformed APDU while encryption is active.
    fn update_session_authenticator(&mut self, apdu: &[u8]) -> Result<Option<Bytes>, CryptoError>;

    /// Compute the terminal session MAC
    fn finalize_session_authenticator(&mut self) -> Result<Bytes, CryptoError>;

    /// Verify the card session MAC
    fn is_card_authenticator_valid(&mut self, card_authenticator: &[u8]) -> Result<bool, CryptoError>;

    /// Encrypt the following exchanges
    fn activate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Stop encrypting the following exchanges
    fn deactivate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Compute the terminal part of an SV command
    fn compute_sv_command_security_data(
        &mut self,
        input: &SvSecurityInput,
    ) -> Result<SvSecurityData, CryptoError>;

    /// Verify the SV MAC returned by the card
    fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, CryptoError>;
}
