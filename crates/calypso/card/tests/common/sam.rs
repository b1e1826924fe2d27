//! Software SAM

use bytes::Bytes;
use calypso_card::crypto::{SvSecurityData, SvSecurityInput};
use calypso_card::{CryptoError, SymmetricCryptoSpi};
use hex_literal::hex;

use super::{INS_MANAGE_SECURE_SESSION, MASTER_KEY, mac, request_data, response_data, session_key, transform};

pub const SAM_ID: [u8; 4] = hex!("AABBCCDD");

#[derive(Debug)]
struct SamSession {
    key: [u8; 16],
    digest: Vec<u8>,
    mac_length: usize,
    encrypting: bool,
    /// Instruction of the last request, `None` while a response is awaited
    pending_ins: Option<u8>,
    keystream_counter: u64,
    terminal_mac: Vec<u8>,
}

/// Symmetric back-end holding the card master key
#[derive(Debug, Default)]
pub struct SoftwareSam {
    challenge: Vec<u8>,
    extended: bool,
    session: Option<SamSession>,
    expected_sv_mac: Option<Vec<u8>>,
    transaction_number: u32,
}

impl SoftwareSam {
    pub fn boxed() -> Box<dyn SymmetricCryptoSpi> {
        Box::new(Self::default())
    }

    fn session(&mut self) -> Result<&mut SamSession, CryptoError> {
        self.session
            .as_mut()
            .ok_or_else(|| CryptoError::Failure("no session context".to_string()))
    }
}

impl SymmetricCryptoSpi for SoftwareSam {
    fn init_session_context(&mut self, extended: bool) -> Result<Bytes, CryptoError> {
        self.extended = extended;
        self.challenge = if extended {
            hex!("C0C1C2C3C4C5C6C7").to_vec()
        } else {
            hex!("C0C1C2C3").to_vec()
        };
        Ok(Bytes::copy_from_slice(&self.challenge))
    }

    fn init_session_authenticator(&mut self, open_data_out: &[u8], kif: u8, kvc: u8) -> Result<(), CryptoError> {
        self.session = Some(SamSession {
            key: session_key(kif, kvc, &self.challenge, open_data_out),
            digest: open_data_out.to_vec(),
            mac_length: if self.extended { 8 } else { 4 },
            encrypting: false,
            pending_ins: None,
            keystream_counter: 0,
            terminal_mac: Vec::new(),
        });
        Ok(())
    }

    fn update_session_authenticator(&mut self, apdu: &[u8]) -> Result<Option<Bytes>, CryptoError> {
        let session = self.session()?;
        match session.pending_ins.take() {
            None => {
                session.pending_ins = Some(apdu[1]);
                session.digest.extend_from_slice(apdu);
                if !session.encrypting || apdu[1] == INS_MANAGE_SECURE_SESSION {
                    return Ok(None);
                }
                let encrypted = transform(&session.key, session.keystream_counter, apdu, request_data(apdu));
                session.keystream_counter += 1;
                Ok(Some(encrypted.into()))
            }
            Some(ins) => {
                if !session.encrypting || ins == INS_MANAGE_SECURE_SESSION {
                    session.digest.extend_from_slice(apdu);
                    return Ok(None);
                }
                let plain = transform(&session.key, session.keystream_counter, apdu, response_data(apdu));
                session.keystream_counter += 1;
                session.digest.extend_from_slice(&plain);
                Ok(Some(plain.into()))
            }
        }
    }

    fn finalize_session_authenticator(&mut self) -> Result<Bytes, CryptoError> {
        let session = self.session()?;
        let terminal_mac = mac(&session.key, &[b"T".as_slice(), &session.digest]);
        session.terminal_mac = terminal_mac[..session.mac_length].to_vec();
        Ok(Bytes::copy_from_slice(&session.terminal_mac))
    }

    fn is_card_authenticator_valid(&mut self, card_authenticator: &[u8]) -> Result<bool, CryptoError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| CryptoError::Failure("no session context".to_string()))?;
        let expected = mac(&session.key, &[b"C".as_slice(), &session.digest, &session.terminal_mac]);
        Ok(card_authenticator == &expected[..session.mac_length])
    }

    fn activate_encryption(&mut self) -> Result<(), CryptoError> {
        self.session()?.encrypting = true;
        Ok(())
    }

    fn deactivate_encryption(&mut self) -> Result<(), CryptoError> {
        self.session()?.encrypting = false;
        Ok(())
    }

    fn compute_sv_command_security_data(
        &mut self,
        input: &SvSecurityInput,
    ) -> Result<SvSecurityData, CryptoError> {
        self.transaction_number += 1;
        let terminal_sv_mac = sv_terminal_mac(
            &input.sv_get_request,
            &input.sv_get_response,
            &input.sv_command_partial_request,
        );
        self.expected_sv_mac = Some(sv_card_mac(&terminal_sv_mac).to_vec());

        let number = self.transaction_number.to_be_bytes();
        Ok(SvSecurityData {
            sam_id: SAM_ID,
            sam_transaction_number: [number[1], number[2], number[3]],
            terminal_sv_mac: Bytes::copy_from_slice(&terminal_sv_mac),
        })
    }

    fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, CryptoError> {
        Ok(self.expected_sv_mac.take().as_deref() == Some(card_sv_mac))
    }
}

pub fn sv_terminal_mac(get_request: &[u8], get_response: &[u8], partial_request: &[u8]) -> [u8; 5] {
    let full = mac(&MASTER_KEY, &[b"V".as_slice(), get_request, get_response, partial_request]);
    let mut terminal = [0u8; 5];
    terminal.copy_from_slice(&full[..5]);
    terminal
}

pub fn sv_card_mac(terminal_sv_mac: &[u8]) -> [u8; 3] {
    let full = mac(&MASTER_KEY, &[b"S".as_slice(), terminal_sv_mac]);
    [full[0], full[1], full[2]]
}
