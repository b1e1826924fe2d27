//! Asymmetric (PKI) session authentication
//!
//! The card signs the whole session with its private key. The terminal
//! checks the signature with the card public key, which it trusts through a
//! chain of certificates: root (self-signed) → CA → card.
//!
//! Certificate layouts, all integers big endian:
//!
//! ```text
//! CA   : 90 01 | issuer key ref (29) | key ref (29)       | public key (64) | signature (64)
//! Card : 91 01 | issuer key ref (29) | serial number (8)  | public key (64) | signature (64)
//! ```
//!
//! The signature covers every byte before it.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::card::CalypsoCard;
use crate::constants::EXTENDED_CHALLENGE_LENGTH;
use crate::error::{CertificateError, Error, Result};

/// Length of a key reference
pub const KEY_REFERENCE_LENGTH: usize = 29;
const PUBLIC_KEY_LENGTH: usize = 64;
const SIGNATURE_LENGTH: usize = 64;
const SERIAL_NUMBER_LENGTH: usize = 8;

const CA_CERTIFICATE_TYPE: u8 = 0x90;
const CARD_CERTIFICATE_TYPE: u8 = 0x91;
const CERTIFICATE_VERSION: u8 = 0x01;

/// Signature verification primitive of the PKI back-end
pub trait PkiSignatureVerifier: fmt::Debug + Send {
    /// Verify `signature` over `message` with the raw (x || y) `public_key`
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> std::result::Result<bool, CryptoError>;
}

/// Certificate of a root or intermediate certification authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificate {
    /// Reference of the key that signed this certificate
    pub issuer_key_reference: Bytes,
    /// Reference of the certified key
    pub key_reference: Bytes,
    /// Certified public key
    pub public_key: Bytes,
    /// Bytes covered by the signature
    pub signed_data: Bytes,
    /// Issuer signature
    pub signature: Bytes,
}

impl CaCertificate {
    /// Parse a CA certificate
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CertificateError> {
        const KEY_REF: usize = 2 + KEY_REFERENCE_LENGTH;
        const KEY: usize = KEY_REF + KEY_REFERENCE_LENGTH;
        const SIGNATURE: usize = KEY + PUBLIC_KEY_LENGTH;

        check_header(bytes, CA_CERTIFICATE_TYPE, SIGNATURE + SIGNATURE_LENGTH)?;
        let bytes = Bytes::copy_from_slice(bytes);
        Ok(Self {
            issuer_key_reference: bytes.slice(2..KEY_REF),
            key_reference: bytes.slice(KEY_REF..KEY),
            public_key: bytes.slice(KEY..SIGNATURE),
            signed_data: bytes.slice(..SIGNATURE),
            signature: bytes.slice(SIGNATURE..),
        })
    }

    /// Whether the certificate is signed by its own key
    pub fn is_self_signed(&self) -> bool {
        self.issuer_key_reference == self.key_reference
    }
}

/// Certificate of a card key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardCertificate {
    /// Reference of the key that signed this certificate
    pub issuer_key_reference: Bytes,
    /// Card serial number
    pub serial_number: Bytes,
    /// Card public key
    pub public_key: Bytes,
    /// Bytes covered by the signature
    pub signed_data: Bytes,
    /// Issuer signature
    pub signature: Bytes,
}

impl CardCertificate {
    /// Parse a card certificate
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CertificateError> {
        const SERIAL: usize = 2 + KEY_REFERENCE_LENGTH;
        const KEY: usize = SERIAL + SERIAL_NUMBER_LENGTH;
        const SIGNATURE: usize = KEY + PUBLIC_KEY_LENGTH;

        check_header(bytes, CARD_CERTIFICATE_TYPE, SIGNATURE + SIGNATURE_LENGTH)?;
        let bytes = Bytes::copy_from_slice(bytes);
        Ok(Self {
            issuer_key_reference: bytes.slice(2..SERIAL),
            serial_number: bytes.slice(SERIAL..KEY),
            public_key: bytes.slice(KEY..SIGNATURE),
            signed_data: bytes.slice(..SIGNATURE),
            signature: bytes.slice(SIGNATURE..),
        })
    }
}

fn check_header(bytes: &[u8], certificate_type: u8, length: usize) -> std::result::Result<(), CertificateError> {
    if bytes.len() != length {
        return Err(CertificateError::InvalidCertificate("unexpected certificate length"));
    }
    if bytes[0] != certificate_type {
        return Err(CertificateError::InvalidCertificate("unexpected certificate type"));
    }
    if bytes[1] != CERTIFICATE_VERSION {
        return Err(CertificateError::InvalidCertificate("unsupported certificate version"));
    }
    Ok(())
}

/// Trusted public keys, indexed by key reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateStore {
    keys: HashMap<String, Bytes>,
}

impl CertificateStore {
    /// Whether a key is trusted
    pub fn contains(&self, key_reference: &[u8]) -> bool {
        self.keys.contains_key(&hex::encode_upper(key_reference))
    }

    /// Public key of a trusted key reference
    pub fn public_key(&self, key_reference: &[u8]) -> Option<&Bytes> {
        self.keys.get(&hex::encode_upper(key_reference))
    }

    /// Number of trusted keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is trusted
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn insert(&mut self, key_reference: &[u8], public_key: Bytes) -> std::result::Result<(), CertificateError> {
        let reference = hex::encode_upper(key_reference);
        if self.keys.contains_key(&reference) {
            return Err(CertificateError::DuplicateCertificate(reference));
        }
        debug!(key_reference = %reference, "Registering trusted key");
        self.keys.insert(reference, public_key);
        Ok(())
    }
}

#[derive(Debug, Zeroize, ZeroizeOnDrop)]
struct TerminalChallenge([u8; EXTENDED_CHALLENGE_LENGTH]);

/// Data signed by the card, wiped once the session ends
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
struct PkiSession {
    #[zeroize(skip)]
    card_public_key: Bytes,
    data: Vec<u8>,
}

/// Asymmetric session back-end: certificate store plus signature verifier
#[derive(Debug)]
pub struct AsymmetricCryptoBackend {
    store: CertificateStore,
    verifier: Box<dyn PkiSignatureVerifier>,
    terminal_challenge: Option<TerminalChallenge>,
    session: Option<PkiSession>,
}

impl AsymmetricCryptoBackend {
    /// Create a back-end with an empty store
    pub fn new(verifier: Box<dyn PkiSignatureVerifier>) -> Self {
        Self {
            store: CertificateStore::default(),
            verifier,
            terminal_challenge: None,
            session: None,
        }
    }

    /// Trusted keys
    pub const fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Trust a self-signed root certificate
    pub fn add_root_certificate(&mut self, certificate: &[u8]) -> std::result::Result<(), CertificateError> {
        let certificate = CaCertificate::from_bytes(certificate)?;
        if !certificate.is_self_signed() {
            return Err(CertificateError::InvalidCertificate("root certificate is not self-signed"));
        }
        if self.store.contains(&certificate.key_reference) {
            return Err(CertificateError::DuplicateCertificate(hex::encode_upper(
                &certificate.key_reference,
            )));
        }
        self.check_signature(&certificate.public_key, &certificate.signed_data, &certificate.signature)?;
        self.store.insert(&certificate.key_reference, certificate.public_key)
    }

    /// Trust a CA certificate signed by an already trusted key
    pub fn add_intermediate_certificate(
        &mut self,
        certificate: &[u8],
    ) -> std::result::Result<(), CertificateError> {
        let certificate = CaCertificate::from_bytes(certificate)?;
        if self.store.contains(&certificate.key_reference) {
            return Err(CertificateError::DuplicateCertificate(hex::encode_upper(
                &certificate.key_reference,
            )));
        }
        let issuer_key = self.issuer_key(&certificate.issuer_key_reference)?;
        self.check_signature(&issuer_key, &certificate.signed_data, &certificate.signature)?;
        self.store.insert(&certificate.key_reference, certificate.public_key)
    }

    /// Verify a card certificate and return the card public key
    pub fn verify_card_certificate(
        &self,
        certificate: &CardCertificate,
    ) -> std::result::Result<Bytes, CertificateError> {
        let issuer_key = self.issuer_key(&certificate.issuer_key_reference)?;
        self.check_signature(&issuer_key, &certificate.signed_data, &certificate.signature)?;
        Ok(certificate.public_key.clone())
    }

    /// Feed one APDU to the session data
    pub fn update_session(&mut self, apdu: &[u8]) {
        if let Some(session) = self.session.as_mut() {
            trace!(apdu = %hex::encode(apdu), "Updating PKI session data");
            session.data.extend_from_slice(apdu);
        }
    }

    /// Verify the card signature over the session data
    pub fn is_session_valid(&mut self, signature: &[u8]) -> std::result::Result<bool, CryptoError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| CryptoError::Failure("no PKI session in progress".to_string()))?;
        self.verifier
            .verify(&session.card_public_key, &session.data, signature)
    }

    pub(crate) fn generate_terminal_challenge(&mut self) -> Bytes {
        let challenge = TerminalChallenge(rand::random());
        let bytes = Bytes::copy_from_slice(&challenge.0);
        self.terminal_challenge = Some(challenge);
        bytes
    }

    /// Build the card key from the certificates on the card image and start the session data
    pub(crate) fn init_session(&mut self, card: &CalypsoCard, data_out: &[u8]) -> Result<()> {
        let (Some(card_certificate), Some(ca_certificate)) =
            (card.card_certificate(), card.ca_certificate())
        else {
            return Err(Error::illegal_state("card certificates are not available"));
        };

        let ca = CaCertificate::from_bytes(ca_certificate)?;
        if !self.store.contains(&ca.key_reference) {
            self.add_intermediate_certificate(ca_certificate)?;
        }

        let certificate = CardCertificate::from_bytes(card_certificate)?;
        let serial_number = &card.runtime().serial_number;
        if !serial_number.is_empty() && serial_number != &certificate.serial_number {
            return Err(CertificateError::InvalidCertificate("card serial number mismatch").into());
        }
        let card_public_key = self.verify_card_certificate(&certificate)?;

        let challenge = self
            .terminal_challenge
            .take()
            .ok_or(Error::illegal_state("no terminal challenge generated"))?;
        let mut data = challenge.0.to_vec();
        data.extend_from_slice(data_out);

        debug!("PKI session authenticator initialized");
        self.session = Some(PkiSession {
            card_public_key,
            data,
        });
        Ok(())
    }

    fn issuer_key(&self, issuer_key_reference: &[u8]) -> std::result::Result<Bytes, CertificateError> {
        self.store
            .public_key(issuer_key_reference)
            .cloned()
            .ok_or_else(|| CertificateError::IssuerNotRegistered(hex::encode_upper(issuer_key_reference)))
    }

    fn check_signature(
        &self,
        public_key: &[u8],
        signed_data: &[u8],
        signature: &[u8],
    ) -> std::result::Result<(), CertificateError> {
        match self.verifier.verify(public_key, signed_data, signature) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CertificateError::InvalidCertificate("bad signature")),
            Err(_) => Err(CertificateError::InvalidCertificate("signature not verifiable")),
        }
    }
}
