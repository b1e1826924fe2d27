//! Session authenticator back-ends
//!
//! A secure session accumulates every exchange into an authenticator the
//! card signs when the session closes. Symmetric sessions delegate the
//! accumulation to a SAM-like [`SymmetricCryptoSpi`]; asymmetric sessions
//! verify the card signature against a certificate chain.

mod asymmetric;
mod symmetric;

pub use asymmetric::{
    AsymmetricCryptoBackend, CaCertificate, CardCertificate, CertificateStore, KEY_REFERENCE_LENGTH,
    PkiSignatureVerifier,
};
pub use symmetric::{SvSecurityData, SvSecurityInput, SymmetricCryptoSpi};

use bytes::Bytes;
use tracing::debug;

use crate::card::CalypsoCard;
use crate::error::{Error, Result, SecurityError};
use crate::settings::KeyReference;

/// Failure reported by a crypto back-end
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The back-end could not be reached
    #[error("Crypto back-end I/O error: {0}")]
    Io(String),
    /// The back-end refused or failed the operation
    #[error("Crypto back-end failure: {0}")]
    Failure(String),
}

impl From<CryptoError> for Error {
    fn from(error: CryptoError) -> Self {
        Self::Crypto(error.to_string())
    }
}

/// Back-end authenticating the secure sessions of a transaction
#[derive(Debug)]
pub enum CryptoBackend {
    /// Symmetric keys held by a SAM or equivalent
    Symmetric(Box<dyn SymmetricCryptoSpi>),
    /// Card signature verified through a certificate chain
    Asymmetric(AsymmetricCryptoBackend),
}

impl From<Box<dyn SymmetricCryptoSpi>> for CryptoBackend {
    fn from(spi: Box<dyn SymmetricCryptoSpi>) -> Self {
        Self::Symmetric(spi)
    }
}

impl From<AsymmetricCryptoBackend> for CryptoBackend {
    fn from(backend: AsymmetricCryptoBackend) -> Self {
        Self::Asymmetric(backend)
    }
}

impl CryptoBackend {
    /// Whether sessions are asymmetric
    pub const fn is_pki(&self) -> bool {
        matches!(self, Self::Asymmetric(_))
    }

    /// Start a new session context and return the terminal challenge
    pub(crate) fn init_session_context(&mut self, extended: bool) -> Result<Bytes> {
        match self {
            Self::Symmetric(spi) => Ok(spi.init_session_context(extended)?),
            Self::Asymmetric(backend) => Ok(backend.generate_terminal_challenge()),
        }
    }

    /// Seed the authenticator with the Open Secure Session output
    pub(crate) fn init_session_authenticator(
        &mut self,
        card: &CalypsoCard,
        data_out: &[u8],
        key: Option<KeyReference>,
    ) -> Result<()> {
        match self {
            Self::Symmetric(spi) => {
                let key = key.ok_or(Error::illegal_state("no session key resolved"))?;
                debug!(kif = key.kif, kvc = key.kvc, "Initializing symmetric session authenticator");
                Ok(spi.init_session_authenticator(data_out, key.kif, key.kvc)?)
            }
            Self::Asymmetric(backend) => backend.init_session(card, data_out),
        }
    }

    /// Feed one APDU to the authenticator
    ///
    /// With encryption active, returns the transformed (encrypted request or
    /// decrypted response) APDU.
    pub(crate) fn update_session_authenticator(&mut self, apdu: &[u8]) -> Result<Option<Bytes>> {
        match self {
            Self::Symmetric(spi) => Ok(spi.update_session_authenticator(apdu)?),
            Self::Asymmetric(backend) => {
                backend.update_session(apdu);
                Ok(None)
            }
        }
    }

    /// Terminal part of the session authenticator, none for asymmetric sessions
    pub(crate) fn finalize_session_authenticator(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Symmetric(spi) => Ok(Some(spi.finalize_session_authenticator()?)),
            Self::Asymmetric(_) => Ok(None),
        }
    }

    /// Verify the card part of the session authenticator
    pub(crate) fn verify_card_authenticator(&mut self, authenticator: &[u8]) -> Result<()> {
        let verified = match self {
            Self::Symmetric(spi) => spi.is_card_authenticator_valid(authenticator),
            Self::Asymmetric(backend) => backend.is_session_valid(authenticator),
        };
        match verified {
            Ok(true) => Ok(()),
            Ok(false) => Err(SecurityError::InvalidCardAuthenticator.into()),
            Err(e) => Err(SecurityError::AuthenticatorNotVerifiable(e.to_string()).into()),
        }
    }

    /// Activate or release the encryption of the session exchanges
    pub(crate) fn set_encryption(&mut self, active: bool) -> Result<()> {
        match self {
            Self::Symmetric(spi) if active => Ok(spi.activate_encryption()?),
            Self::Symmetric(spi) => Ok(spi.deactivate_encryption()?),
            Self::Asymmetric(_) => Err(Error::illegal_state(
                "encryption is not available in asymmetric sessions",
            )),
        }
    }

    /// Compute the terminal part of an SV command
    pub(crate) fn compute_sv_security_data(
        &mut self,
        input: &SvSecurityInput,
    ) -> Result<SvSecurityData> {
        match self {
            Self::Symmetric(spi) => Ok(spi.compute_sv_command_security_data(input)?),
            Self::Asymmetric(_) => Err(Error::illegal_state(
                "SV operations require a symmetric back-end",
            )),
        }
    }

    /// Verify the SV MAC returned by the card
    pub(crate) fn verify_sv_mac(&mut self, mac: &[u8]) -> Result<()> {
        match self {
            Self::Symmetric(spi) => match spi.is_card_sv_mac_valid(mac) {
                Ok(true) => Ok(()),
                Ok(false) => Err(SecurityError::InvalidSvMac.into()),
                Err(e) => Err(SecurityError::AuthenticatorNotVerifiable(e.to_string()).into()),
            },
            Self::Asymmetric(_) => Err(Error::illegal_state(
                "SV operations require a symmetric back-end",
            )),
        }
    }
}
