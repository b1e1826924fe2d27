//! ECDSA P-256k1 certificate chain

use calypso_card::CryptoError;
use calypso_card::crypto::{KEY_REFERENCE_LENGTH, PkiSignatureVerifier};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};

pub const ROOT_REFERENCE: [u8; KEY_REFERENCE_LENGTH] = [0xA1; KEY_REFERENCE_LENGTH];
pub const CA_REFERENCE: [u8; KEY_REFERENCE_LENGTH] = [0xA2; KEY_REFERENCE_LENGTH];
pub const SERIAL_NUMBER: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78];

pub const ROOT_SEED: [u8; 32] = [0x11; 32];
pub const CA_SEED: [u8; 32] = [0x22; 32];
pub const CARD_SEED: [u8; 32] = [0x33; 32];

pub fn signing_key(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_slice(seed).unwrap()
}

/// Raw `x || y` public key
pub fn public_key(seed: &[u8; 32]) -> Vec<u8> {
    let point = signing_key(seed).verifying_key().to_encoded_point(false);
    point.as_bytes()[1..].to_vec()
}

pub fn sign(seed: &[u8; 32], message: &[u8]) -> Vec<u8> {
    let signature: Signature = signing_key(seed).sign(message);
    signature.to_bytes().to_vec()
}

pub fn ca_certificate(
    issuer: &[u8; KEY_REFERENCE_LENGTH],
    reference: &[u8; KEY_REFERENCE_LENGTH],
    key_seed: &[u8; 32],
    issuer_seed: &[u8; 32],
) -> Vec<u8> {
    let mut certificate = vec![0x90, 0x01];
    certificate.extend_from_slice(issuer);
    certificate.extend_from_slice(reference);
    certificate.extend_from_slice(&public_key(key_seed));
    let signature = sign(issuer_seed, &certificate);
    certificate.extend_from_slice(&signature);
    certificate
}

pub fn card_certificate(issuer: &[u8; KEY_REFERENCE_LENGTH], issuer_seed: &[u8; 32]) -> Vec<u8> {
    let mut certificate = vec![0x91, 0x01];
    certificate.extend_from_slice(issuer);
    certificate.extend_from_slice(&SERIAL_NUMBER);
    certificate.extend_from_slice(&public_key(&CARD_SEED));
    let signature = sign(issuer_seed, &certificate);
    certificate.extend_from_slice(&signature);
    certificate
}

pub fn root_certificate() -> Vec<u8> {
    ca_certificate(&ROOT_REFERENCE, &ROOT_REFERENCE, &ROOT_SEED, &ROOT_SEED)
}

pub fn intermediate_certificate() -> Vec<u8> {
    ca_certificate(&ROOT_REFERENCE, &CA_REFERENCE, &CA_SEED, &ROOT_SEED)
}

#[derive(Debug)]
pub struct EcdsaVerifier;

impl PkiSignatureVerifier for EcdsaVerifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let mut point = Vec::with_capacity(1 + public_key.len());
        point.push(0x04);
        point.extend_from_slice(public_key);
        let key = VerifyingKey::from_sec1_bytes(&point).map_err(|e| CryptoError::Failure(e.to_string()))?;
        let Ok(signature) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(key.verify(message, &signature).is_ok())
    }
}
