//! Simulated Calypso card
//!
//! Implements the card side of the commands the transaction manager sends,
//! with a secure session backed by the same keys as [`super::sam::SoftwareSam`]
//! and [`super::pki`].

use std::collections::BTreeMap;

use bytes::Bytes;
use calypso_apdu_core::{CardTransport, TransportError};

use super::sam::{sv_card_mac, sv_terminal_mac};
use super::{
    INS_MANAGE_SECURE_SESSION, KIF, KVC, i24, mac, pki, request_data, response_data, session_key, transform,
    with_status,
};

const RANDOM: [u8; 5] = [0x5A, 0x5B, 0x5C, 0x5D, 0x5E];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Content {
    records: BTreeMap<(u8, u8), Vec<u8>>,
    counters: BTreeMap<(u8, u8), u32>,
    sv_balance: i32,
    sv_transaction_number: u16,
}

#[derive(Debug)]
struct CardSession {
    key: [u8; 16],
    digest: Vec<u8>,
    mac_length: usize,
    pki: bool,
    encrypting: bool,
    keystream_counter: u64,
    backup: Content,
    sv_postponed: Option<[u8; 3]>,
}

/// Card answering APDUs from an in-memory file system
#[derive(Debug)]
pub struct SimulatedCard {
    content: Content,
    transaction_counter: u32,
    ratified: bool,
    extended: bool,
    session: Option<CardSession>,
    last_sv_get: Option<(Vec<u8>, Vec<u8>)>,
    /// Every command received, as sent on the wire
    pub commands: Vec<Bytes>,
    /// Whether the channel was released
    pub released: bool,
    /// Corrupt the card part of the session authenticator
    pub corrupt_authenticator: bool,
    /// Stop answering after this number of commands
    pub remove_after: Option<usize>,
}

impl Default for SimulatedCard {
    fn default() -> Self {
        Self {
            content: Content {
                sv_balance: 100,
                ..Content::default()
            },
            transaction_counter: 0x0100,
            ratified: true,
            extended: false,
            session: None,
            last_sv_get: None,
            commands: Vec::new(),
            released: false,
            corrupt_authenticator: false,
            remove_after: None,
        }
    }
}

impl SimulatedCard {
    /// Card running extended mode sessions
    pub fn extended() -> Self {
        Self {
            extended: true,
            ..Self::default()
        }
    }

    pub fn with_record(mut self, sfi: u8, record: u8, data: &[u8]) -> Self {
        self.content.records.insert((sfi, record), data.to_vec());
        self
    }

    pub fn with_counter(mut self, sfi: u8, counter: u8, value: u32) -> Self {
        self.content.counters.insert((sfi, counter), value);
        self
    }

    pub fn with_sv_balance(mut self, balance: i32) -> Self {
        self.content.sv_balance = balance;
        self
    }

    pub fn record(&self, sfi: u8, record: u8) -> Option<&[u8]> {
        self.content.records.get(&(sfi, record)).map(Vec::as_slice)
    }

    pub fn counter(&self, sfi: u8, counter: u8) -> Option<u32> {
        self.content.counters.get(&(sfi, counter)).copied()
    }

    pub const fn sv_balance(&self) -> i32 {
        self.content.sv_balance
    }

    pub const fn transaction_counter(&self) -> u32 {
        self.transaction_counter
    }

    pub const fn is_ratified(&self) -> bool {
        self.ratified
    }

    pub const fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Instruction bytes of the received commands
    pub fn instructions(&self) -> Vec<u8> {
        self.commands.iter().map(|c| c[1]).collect()
    }

    /// Output the next regular or extended Open Secure Session will return
    pub fn next_open_data_out(&self, extended: bool, read: Option<(u8, u8)>) -> Vec<u8> {
        let counter = self.transaction_counter.to_be_bytes();
        let mut data_out = counter[1..].to_vec();
        if extended {
            data_out.extend_from_slice(&RANDOM);
            data_out.push(if self.ratified { 0x02 } else { 0x03 });
        } else {
            data_out.push(RANDOM[0]);
            data_out.push(if self.ratified { 0x00 } else { 0x01 });
        }
        data_out.extend_from_slice(&[KIF, KVC]);
        let record = read
            .and_then(|(sfi, record)| self.content.records.get(&(sfi, record)))
            .cloned()
            .unwrap_or_default();
        data_out.push(record.len() as u8);
        data_out.extend_from_slice(&record);
        data_out
    }

    fn process(&mut self, command: &[u8]) -> Vec<u8> {
        match command[1] {
            0x8A => self.open_session(command),
            0x8E => self.close_session(command),
            _ => self.process_in_session(command),
        }
    }

    fn open_session(&mut self, command: &[u8]) -> Vec<u8> {
        if self.session.is_some() {
            return with_status(&[], 0x6985);
        }
        if self.transaction_counter == 0 {
            return with_status(&[], 0x6900);
        }
        let (p1, p2) = (command[2], command[3]);
        let (record, sfi, mode) = (p1 >> 3, p2 >> 3, p2 & 0x07);
        let read = (record != 0).then_some((sfi, record));
        let pki = mode == 0x03;
        let extended = mode != 0x01;
        if extended && !self.extended && !pki {
            return with_status(&[], 0x6B00);
        }

        let challenge = &command[request_data(command)];
        let data_out = self.next_open_data_out(extended, read);
        self.transaction_counter -= 1;
        let (key, digest) = if pki {
            ([0u8; 16], [challenge, &data_out[..]].concat())
        } else {
            (session_key(KIF, KVC, challenge, &data_out), data_out.clone())
        };
        self.session = Some(CardSession {
            key,
            digest,
            mac_length: if extended { 8 } else { 4 },
            pki,
            encrypting: false,
            keystream_counter: 0,
            backup: self.content.clone(),
            sv_postponed: None,
        });
        with_status(&data_out, 0x9000)
    }

    fn close_session(&mut self, command: &[u8]) -> Vec<u8> {
        let Some(session) = self.session.take() else {
            return with_status(&[], 0x6985);
        };
        let pki_close = session.pki && command[3] == 0x01;
        if !pki_close && command.len() == 5 {
            self.content = session.backup;
            return with_status(&[], 0x9000);
        }

        let mut authenticator = if pki_close {
            pki::sign(&pki::CARD_SEED, &session.digest)
        } else {
            let terminal_mac = &command[request_data(command)];
            let expected = mac(&session.key, &[b"T".as_slice(), &session.digest]);
            if terminal_mac != &expected[..session.mac_length] {
                self.content = session.backup;
                return with_status(&[], 0x6988);
            }
            mac(&session.key, &[b"C".as_slice(), &session.digest, terminal_mac])[..session.mac_length].to_vec()
        };
        if self.corrupt_authenticator {
            authenticator[0] ^= 0xFF;
        }

        self.ratified = command[2] & 0x80 != 0;
        let mut data = Vec::new();
        if let Some(sv_mac) = session.sv_postponed {
            data.push(sv_mac.len() as u8);
            data.extend_from_slice(&sv_mac);
        }
        data.extend_from_slice(&authenticator);
        with_status(&data, 0x9000)
    }

    /// Decrypt, execute, digest and encrypt a command
    fn process_in_session(&mut self, command: &[u8]) -> Vec<u8> {
        let ins = command[1];
        let encrypted = self
            .session
            .as_ref()
            .is_some_and(|s| s.encrypting && ins != INS_MANAGE_SECURE_SESSION);

        let plain = match self.session.as_mut() {
            Some(session) if encrypted => {
                let plain = transform(&session.key, session.keystream_counter, command, request_data(command));
                session.keystream_counter += 1;
                plain
            }
            _ => command.to_vec(),
        };
        let response = self.execute(&plain);

        let Some(session) = self.session.as_mut() else {
            return response;
        };
        session.digest.extend_from_slice(&plain);
        session.digest.extend_from_slice(&response);
        if ins == INS_MANAGE_SECURE_SESSION && response.ends_with(&[0x90, 0x00]) {
            session.encrypting = plain[3] == 0x03;
        }
        if encrypted {
            let encrypted = transform(&session.key, session.keystream_counter, &response, response_data(&response));
            session.keystream_counter += 1;
            return encrypted;
        }
        response
    }

    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        let (ins, p1, p2) = (command[1], command[2], command[3]);
        let data = &command[request_data(command)];
        match ins {
            0xB2 if p1 == 0 && p2 == 0 => {
                self.ratified = true;
                with_status(&[], 0x6B00)
            }
            0xB2 => self.read_records(p1, p2 >> 3, p2 & 0x07, command),
            0xDC => {
                self.content.records.insert((p2 >> 3, p1), data.to_vec());
                with_status(&[], 0x9000)
            }
            0xD2 => {
                let record = self.content.records.entry((p2 >> 3, p1)).or_default();
                merge(record, data, 0);
                with_status(&[], 0x9000)
            }
            0xE2 => {
                let sfi = p2 >> 3;
                let last = self
                    .content
                    .records
                    .keys()
                    .filter(|(s, _)| *s == sfi)
                    .map(|(_, r)| *r)
                    .max()
                    .unwrap_or(0);
                for record in (1..=last).rev() {
                    if let Some(content) = self.content.records.remove(&(sfi, record)) {
                        self.content.records.insert((sfi, record + 1), content);
                    }
                }
                self.content.records.insert((sfi, 1), data.to_vec());
                with_status(&[], 0x9000)
            }
            0xB0 => {
                let (sfi, offset) = binary_target(p1, p2);
                let length = usize::from(command[4]);
                match self.content.records.get(&(sfi, 1)) {
                    Some(content) if offset + length <= content.len() => {
                        with_status(&content[offset..offset + length], 0x9000)
                    }
                    Some(_) => with_status(&[], 0x6B00),
                    None => with_status(&[], 0x6A82),
                }
            }
            0xD6 | 0xD0 => {
                let (sfi, offset) = binary_target(p1, p2);
                let content = self.content.records.entry((sfi, 1)).or_default();
                if ins == 0xD6 {
                    if content.len() < offset + data.len() {
                        content.resize(offset + data.len(), 0);
                    }
                    content[offset..offset + data.len()].copy_from_slice(data);
                } else {
                    merge(content, data, offset);
                }
                with_status(&[], 0x9000)
            }
            0x32 | 0x30 => {
                let value = u32::from_be_bytes([0, data[0], data[1], data[2]]);
                let counter = self.content.counters.entry((p2 >> 3, p1)).or_default();
                let updated = if ins == 0x32 {
                    counter.checked_add(value).filter(|v| *v <= 0x00FF_FFFF)
                } else {
                    counter.checked_sub(value)
                };
                match updated {
                    Some(updated) => {
                        *counter = updated;
                        with_status(&updated.to_be_bytes()[1..], 0x9000)
                    }
                    None if ins == 0x32 => with_status(&[], 0x6400),
                    None => with_status(&[], 0x6A80),
                }
            }
            0x7C => self.sv_get(command),
            0xB8 | 0xBA | 0xBC => self.sv_operation(command),
            INS_MANAGE_SECURE_SESSION if self.session.is_some() => with_status(&[], 0x9000),
            INS_MANAGE_SECURE_SESSION => with_status(&[], 0x6982),
            _ => with_status(&[], 0x6D00),
        }
    }

    fn read_records(&self, first: u8, sfi: u8, mode: u8, command: &[u8]) -> Vec<u8> {
        if !self.content.records.keys().any(|(s, _)| *s == sfi) {
            return with_status(&[], 0x6A82);
        }
        if mode == 0x04 {
            return match self.content.records.get(&(sfi, first)) {
                Some(content) => with_status(content, 0x9000),
                None => with_status(&[], 0x6A83),
            };
        }

        let limit = match command[4] {
            0 => 256,
            le => usize::from(le),
        };
        let mut data = Vec::new();
        for ((_, record), content) in self.content.records.range((sfi, first)..=(sfi, u8::MAX)) {
            if data.len() + 2 + content.len() > limit {
                break;
            }
            data.push(*record);
            data.push(content.len() as u8);
            data.extend_from_slice(content);
        }
        if data.is_empty() {
            return with_status(&[], 0x6A83);
        }
        with_status(&data, 0x9000)
    }

    fn sv_get(&mut self, command: &[u8]) -> Vec<u8> {
        let reload = command[3] == 0x07;
        let mut data = vec![KVC];
        data.extend_from_slice(&self.content.sv_transaction_number.to_be_bytes());
        data.extend_from_slice(&[0x00; 3]);
        data.extend_from_slice(&[0xCA, 0xFE]);
        data.extend_from_slice(&i24(self.content.sv_balance));
        let log_length = if reload { 22 } else { 19 };
        data.resize(data.len() + log_length, 0x00);

        let response = with_status(&data, 0x9000);
        self.last_sv_get = Some((command.to_vec(), response.clone()));
        response
    }

    fn sv_operation(&mut self, command: &[u8]) -> Vec<u8> {
        let Some((get_request, get_response)) = self.last_sv_get.take() else {
            return with_status(&[], 0x6985);
        };
        let ins = command[1];
        let data = &command[request_data(command)];
        let prefix_length = if ins == 0xB8 { 10 } else { 7 };
        if data.len() != prefix_length + 12 {
            return with_status(&[], 0x6700);
        }
        let prefix = &data[..prefix_length];
        let terminal_mac = &data[prefix_length + 7..];

        let mut partial = command[..4].to_vec();
        partial.push(prefix_length as u8);
        partial.extend_from_slice(prefix);
        partial.push(0x00);
        if terminal_mac != sv_terminal_mac(&get_request, &get_response, &partial).as_slice() {
            return with_status(&[], 0x6988);
        }

        let amount = if ins == 0xB8 {
            let raw = i32::from_be_bytes([prefix[5], prefix[6], prefix[7], 0]);
            raw >> 8
        } else {
            i32::from(i16::from_be_bytes([prefix[0], prefix[1]]))
        };
        self.content.sv_balance += amount;
        self.content.sv_transaction_number += 1;

        let card_mac = sv_card_mac(terminal_mac);
        match self.session.as_mut() {
            Some(session) => {
                session.sv_postponed = Some(card_mac);
                with_status(&[], 0x6200)
            }
            None => with_status(&card_mac, 0x9000),
        }
    }
}

fn binary_target(p1: u8, p2: u8) -> (u8, usize) {
    if p1 & 0x80 != 0 {
        (p1 & 0x1F, usize::from(p2))
    } else {
        (0, usize::from(u16::from_be_bytes([p1, p2])))
    }
}

fn merge(content: &mut Vec<u8>, data: &[u8], offset: usize) {
    if content.len() < offset + data.len() {
        content.resize(offset + data.len(), 0);
    }
    for (byte, bits) in content[offset..].iter_mut().zip(data) {
        *byte |= bits;
    }
}

impl CardTransport for SimulatedCard {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if self.remove_after.is_some_and(|limit| self.commands.len() >= limit) {
            return Err(TransportError::card("card removed"));
        }
        self.commands.push(Bytes::copy_from_slice(command));
        Ok(self.process(command).into())
    }

    fn release_channel(&mut self) -> Result<(), TransportError> {
        self.released = true;
        Ok(())
    }
}
