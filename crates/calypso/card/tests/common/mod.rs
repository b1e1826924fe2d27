//! Common test utilities
//!
//! A simulated card and the software back-ends it shares its keys with:
//! both sides derive the same session key and compute the same MACs, so a
//! transaction runs end to end without hardware.

#![allow(dead_code, unreachable_pub)]

pub mod card;
pub mod pki;
pub mod sam;

use std::ops::Range;

use aes::Aes128;
use cbc_mac::{CbcMac, Mac};
use cipher::{BlockEncrypt, KeyInit};
use hex_literal::hex;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Key shared by the card and the SAM
pub const MASTER_KEY: [u8; 16] = hex!("00112233445566778899AABBCCDDEEFF");

/// Session key identifier and version reported by the card
pub const KIF: u8 = 0x30;
pub const KVC: u8 = 0x79;

pub const INS_MANAGE_SECURE_SESSION: u8 = 0x82;

/// Install a subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session_key(kif: u8, kvc: u8, terminal_challenge: &[u8], data_out: &[u8]) -> [u8; 16] {
    let digest = Sha256::new()
        .chain_update(MASTER_KEY)
        .chain_update([kif, kvc])
        .chain_update(terminal_challenge)
        .chain_update(data_out)
        .finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// AES CBC-MAC over the concatenated parts
pub fn mac(key: &[u8; 16], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <CbcMac<Aes128> as KeyInit>::new_from_slice(key).unwrap();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// XOR `data` with an AES counter keystream
pub fn apply_keystream(key: &[u8; 16], counter: u64, data: &mut [u8]) {
    let cipher = Aes128::new_from_slice(key).unwrap();
    for (i, chunk) in data.chunks_mut(16).enumerate() {
        let mut block = aes::Block::default();
        block[..8].copy_from_slice(&counter.to_be_bytes());
        block[8..].copy_from_slice(&(i as u64).to_be_bytes());
        cipher.encrypt_block(&mut block);
        for (byte, key) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key;
        }
    }
}

/// Command data field of a request
pub fn request_data(apdu: &[u8]) -> Range<usize> {
    if apdu.len() > 5 {
        5..(5 + usize::from(apdu[4])).min(apdu.len())
    } else {
        apdu.len()..apdu.len()
    }
}

/// Response data field, status word excluded
pub fn response_data(apdu: &[u8]) -> Range<usize> {
    0..apdu.len().saturating_sub(2)
}

/// Copy of `apdu` with the `range` bytes passed through the keystream
pub fn transform(key: &[u8; 16], counter: u64, apdu: &[u8], range: Range<usize>) -> Vec<u8> {
    let mut apdu = apdu.to_vec();
    apply_keystream(key, counter, &mut apdu[range]);
    apdu
}

pub fn with_status(data: &[u8], sw: u16) -> Vec<u8> {
    let mut response = data.to_vec();
    response.extend_from_slice(&sw.to_be_bytes());
    response
}

pub fn i24(value: i32) -> [u8; 3] {
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}
