//! Batch exchange handling outside secure sessions

mod common;

use std::collections::VecDeque;

use bytes::Bytes;
use calypso_apdu_core::{CardRequest, CardResponse, CardTransport, ChannelControl, TransportError};
use calypso_card::{CalypsoCard, CardRuntime, Error, TransactionManager};
use hex_literal::hex;

/// Answers each batch with a scripted list of responses, whatever its length
#[derive(Debug, Default)]
struct ScriptedTransport {
    batches: VecDeque<Vec<Bytes>>,
    requests: Vec<Bytes>,
}

impl ScriptedTransport {
    fn with_batch(mut self, responses: &[&'static [u8]]) -> Self {
        self.batches
            .push_back(responses.iter().map(|r| Bytes::from_static(r)).collect());
        self
    }
}

impl CardTransport for ScriptedTransport {
    fn do_transmit_raw(&mut self, _command: &[u8]) -> Result<Bytes, TransportError> {
        Err(TransportError::reader("batches only"))
    }

    fn exchange(
        &mut self,
        request: &CardRequest,
        _channel: ChannelControl,
    ) -> Result<CardResponse, TransportError> {
        self.requests
            .extend(request.apdus.iter().map(|r| r.apdu.clone()));
        let apdus = self
            .batches
            .pop_front()
            .ok_or_else(|| TransportError::card("no scripted response"))?;
        Ok(CardResponse {
            apdus,
            logical_channel_open: true,
        })
    }
}

fn manager(transport: ScriptedTransport) -> TransactionManager<ScriptedTransport> {
    common::init_tracing();
    TransactionManager::free(transport, CalypsoCard::new(CardRuntime::default()))
}

#[test]
fn test_extra_response_is_inconsistent() {
    let transport = ScriptedTransport::default().with_batch(&[&hex!("DEAD9000"), &hex!("9000")]);
    let mut transaction = manager(transport);

    transaction.prepare_read_record(0x07, 1).unwrap();
    let err = transaction.process_commands(ChannelControl::KeepOpen).unwrap_err();

    assert_eq!(
        err.error,
        Error::InconsistentExchangeCount {
            requests: 1,
            responses: 2
        }
    );
    assert_eq!(err.audit_trail.len(), 1);
    assert_eq!(
        err.audit_trail.exchanges()[0].response.as_deref(),
        Some(&hex!("DEAD9000")[..])
    );
    assert_eq!(transaction.card().record_by_sfi(0x07, 1), None);
}

#[test]
fn test_missing_response_is_inconsistent() {
    let transport = ScriptedTransport::default().with_batch(&[&hex!("AA9000")]);
    let mut transaction = manager(transport);

    transaction
        .prepare_read_record(0x07, 1)
        .unwrap()
        .prepare_read_record(0x07, 2)
        .unwrap();
    let err = transaction.process_commands(ChannelControl::KeepOpen).unwrap_err();

    assert_eq!(
        err.error,
        Error::InconsistentExchangeCount {
            requests: 2,
            responses: 1
        }
    );
    assert_eq!(transaction.transport().requests.len(), 2);
}

#[test]
fn test_missing_records_are_ignored_outside_sessions() {
    let transport = ScriptedTransport::default().with_batch(&[&hex!("6A83"), &hex!("BBBB9000")]);
    let mut transaction = manager(transport);

    transaction
        .prepare_read_record(0x07, 1)
        .unwrap()
        .prepare_read_record(0x07, 2)
        .unwrap();
    transaction.process_commands(ChannelControl::KeepOpen).unwrap();

    assert_eq!(transaction.card().record_by_sfi(0x07, 1), None);
    assert_eq!(
        transaction.card().record_by_sfi(0x07, 2).map(|r| r.to_vec()),
        Some(hex!("BBBB").to_vec())
    );
    assert_eq!(
        transaction.transport().requests,
        vec![
            Bytes::from_static(&hex!("00B2013C00")),
            Bytes::from_static(&hex!("00B2023C00")),
        ]
    );
}

#[test]
fn test_other_failures_are_reported_outside_sessions() {
    let transport = ScriptedTransport::default().with_batch(&[&hex!("6982")]);
    let mut transaction = manager(transport);

    transaction.prepare_read_record(0x07, 1).unwrap();
    let err = transaction.process_commands(ChannelControl::KeepOpen).unwrap_err();

    match err.error {
        Error::CardCommand(e) => {
            assert_eq!(e.status.to_u16(), 0x6982);
            assert!(!e.is_missing_data());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_read_records_and_binary_in_one_batch() {
    let transport = ScriptedTransport::default().with_batch(&[
        &hex!("01 02 AAAA 02 01 BB 9000"),
        &hex!("0102030405 9000"),
        &hex!("00000A 9000"),
    ]);
    let mut transaction = manager(transport);

    transaction
        .prepare_read_records(0x08, 1, 0)
        .unwrap()
        .prepare_read_binary(0x01, 0, 5)
        .unwrap()
        .prepare_increase_counter(0x19, 1, 10)
        .unwrap();
    transaction.process_commands(ChannelControl::CloseAfter).unwrap();

    let card = transaction.card();
    assert_eq!(card.record_by_sfi(0x08, 1).map(|r| r.to_vec()), Some(hex!("AAAA").to_vec()));
    assert_eq!(card.record_by_sfi(0x08, 2).map(|r| r.to_vec()), Some(hex!("BB").to_vec()));
    assert_eq!(
        card.record_by_sfi(0x01, 1).map(|r| r.to_vec()),
        Some(hex!("0102030405").to_vec())
    );
    assert_eq!(card.counter(0x19, 1), Some(10));
    assert_eq!(transaction.audit_trail().len(), 3);
}

#[test]
fn test_nothing_prepared_exchanges_nothing() {
    let mut transaction = manager(ScriptedTransport::default());
    transaction.process_commands(ChannelControl::CloseAfter).unwrap();

    assert!(transaction.transport().requests.is_empty());
    assert!(transaction.audit_trail().is_empty());
}
