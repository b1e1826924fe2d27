//! Open Secure Session
//!
//! Starts a secure session at a write access level, optionally reading one
//! record in the same exchange. The response seeds the session
//! authenticator; the exchange itself is not part of it.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::{Command, Response};
use tracing::debug;

use super::{CardCommand, CommandBase, CommandContext, CommandKind, check_record_number, check_sfi};
use crate::constants::{CHALLENGE_LENGTH, CLA, EXTENDED_CHALLENGE_LENGTH, ins, open_mode};
use crate::error::{CommandErrorKind, Error, Result, SecurityError};
use crate::session::SessionPhase;
use crate::settings::{KeyReference, WriteAccessLevel};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6900,
            StatusProperties::failure("Transaction counter is 0", CommandErrorKind::Terminated),
        ),
        (
            0x6981,
            StatusProperties::failure(
                "Command forbidden (read requested and current EF is a binary file)",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6982,
            StatusProperties::failure(
                "Security conditions not fulfilled (PIN code not presented, encryption required)",
                CommandErrorKind::SecurityContext,
            ),
        ),
        (
            0x6985,
            StatusProperties::failure(
                "Access forbidden (never access mode, session already opened)",
                CommandErrorKind::Access,
            ),
        ),
        (
            0x6986,
            StatusProperties::failure(
                "Command not allowed (read requested and no current EF)",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6A81,
            StatusProperties::failure("Wrong key index", CommandErrorKind::IllegalParameter),
        ),
        (
            0x6A82,
            StatusProperties::failure("File not found", CommandErrorKind::DataAccess),
        ),
        (
            0x6A83,
            StatusProperties::failure(
                "Record not found (record index is above NumRec)",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6B00,
            StatusProperties::failure(
                "P1 or P2 value not supported",
                CommandErrorKind::IllegalParameter,
            ),
        ),
    ])
});

/// Record read by the Open Secure Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadOnOpen {
    pub(crate) sfi: u8,
    pub(crate) record: u8,
}

/// Decoded Open Secure Session output
///
/// Regular mode: `counter(3) random(1) ratified(1) KIF KVC len data`.
/// Extended mode: `counter(3) random(5) flags(1) KIF KVC len data`, where
/// flag bit 0 set means the previous session was not ratified and bit 1 set
/// means Manage Secure Session is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenResponse {
    card_challenge: Bytes,
    transaction_counter: u32,
    previous_session_ratified: bool,
    manage_session_authorized: bool,
    kif: u8,
    kvc: u8,
    record_data: Bytes,
}

impl OpenResponse {
    fn parse(payload: &Bytes, extended: bool) -> Result<Self> {
        let header = if extended { 12 } else { 8 };
        if payload.len() < header {
            return Err(Error::UnexpectedResponseLength {
                command: CommandKind::OpenSecureSession,
                expected: header,
                actual: payload.len(),
            });
        }
        let data_length = usize::from(payload[header - 1]);
        super::check_length(
            CommandKind::OpenSecureSession,
            header + data_length,
            payload.len(),
        )?;

        let challenge_length = if extended {
            EXTENDED_CHALLENGE_LENGTH
        } else {
            CHALLENGE_LENGTH
        };
        let flags = payload[challenge_length];
        let (previous_session_ratified, manage_session_authorized) = if extended {
            (flags & 0x01 == 0, flags & 0x02 != 0)
        } else {
            (flags == 0x00, false)
        };

        Ok(Self {
            card_challenge: payload.slice(..challenge_length),
            transaction_counter: u32::from_be_bytes([0, payload[0], payload[1], payload[2]]),
            previous_session_ratified,
            manage_session_authorized,
            kif: payload[challenge_length + 1],
            kvc: payload[challenge_length + 2],
            record_data: payload.slice(header..),
        })
    }
}

#[derive(Debug)]
pub(crate) struct OpenSecureSession {
    base: CommandBase,
    level: WriteAccessLevel,
    read: Option<ReadOnOpen>,
    /// Session key chosen by the caller
    key: Option<KeyReference>,
    pre_open: Option<Bytes>,
}

impl OpenSecureSession {
    pub(crate) fn new(
        level: WriteAccessLevel,
        read: Option<ReadOnOpen>,
        extended: bool,
        pki: bool,
    ) -> Result<Self> {
        let (sfi, record) = match read {
            Some(read) => {
                check_sfi(read.sfi)?;
                check_record_number(read.record)?;
                (read.sfi, read.record)
            }
            None => (0, 0),
        };
        let mode = if pki {
            open_mode::PKI
        } else if extended {
            open_mode::EXTENDED
        } else {
            open_mode::REGULAR
        };

        let p1 = record.wrapping_mul(8).wrapping_add(level.key_index());
        let p2 = sfi * 8 + mode;
        Ok(Self {
            base: CommandBase::new(
                CommandKind::OpenSecureSession,
                Command::new_with_le(CLA, ins::OPEN_SECURE_SESSION, p1, p2, 0),
            ),
            level,
            read,
            key: None,
            pre_open: None,
        })
    }

    pub(crate) fn with_session_key(mut self, key: Option<KeyReference>) -> Self {
        self.key = key;
        self
    }

    fn resolve_key(&self, ctx: &CommandContext<'_>, kif: u8, kvc: u8) -> Result<Option<KeyReference>> {
        if ctx.crypto.as_ref().is_some_and(|c| c.is_pki()) {
            return Ok(None);
        }
        let key = ctx
            .setting
            .resolve_session_key(self.level, self.key, Some(kif), Some(kvc))?;
        Ok(Some(key))
    }

    fn init_authenticator(&self, ctx: &mut CommandContext<'_>, data_out: &Bytes) -> Result<OpenResponse> {
        let extended = ctx.session()?.extended;
        let response = OpenResponse::parse(data_out, extended)?;
        let key = self.resolve_key(ctx, response.kif, response.kvc)?;

        let CommandContext { card, crypto, .. } = ctx;
        crypto
            .as_deref_mut()
            .ok_or(Error::illegal_state("no crypto back-end available"))?
            .init_session_authenticator(&**card, data_out, key)?;
        ctx.session()?.key = key;
        Ok(response)
    }
}

impl CardCommand for OpenSecureSession {
    fn kind(&self) -> CommandKind {
        CommandKind::OpenSecureSession
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_crypto_required_to_finalize_request(&self, _ctx: &CommandContext<'_>) -> bool {
        false
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        let extended = ctx.session()?.extended;
        let challenge = ctx.crypto()?.init_session_context(extended)?;
        let expected = if extended {
            EXTENDED_CHALLENGE_LENGTH
        } else {
            CHALLENGE_LENGTH
        };
        if challenge.len() != expected {
            return Err(Error::Crypto(format!(
                "terminal challenge of {} bytes, {expected} expected",
                challenge.len()
            )));
        }
        ctx.session()?.set_terminal_challenge(&challenge);

        let command = self.base.command_mut();
        command.data = Some(challenge);
        self.pre_open = ctx.card.take_pre_open_data(self.level);
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        let Some(data_out) = self.pre_open.clone() else {
            return Ok(false);
        };
        debug!(level = %self.level, "Initializing session authenticator from pre-open data");
        self.init_authenticator(ctx, &data_out)?;
        Ok(true)
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = Response::from_bytes(&response)?;
        STATUS_TABLE.check(CommandKind::OpenSecureSession, response.status())?;
        let data_out = response.payload();

        let open = match &self.pre_open {
            Some(pre_open) if pre_open != data_out => {
                return Err(SecurityError::PreOpenMismatch.into());
            }
            Some(_) => OpenResponse::parse(data_out, ctx.session()?.extended)?,
            None => self.init_authenticator(ctx, data_out)?,
        };

        debug!(
            level = %self.level,
            transaction_counter = open.transaction_counter,
            ratified = open.previous_session_ratified,
            "Secure session opened"
        );

        let session = ctx.session()?;
        session.phase = SessionPhase::Open;
        session.challenges.card = open.card_challenge.to_vec();
        session.previous_session_ratified = Some(open.previous_session_ratified);
        session.manage_session_authorized = open.manage_session_authorized;

        ctx.card
            .set_open_session_info(open.transaction_counter, open.previous_session_ratified);
        if let Some(read) = self.read {
            if !open.record_data.is_empty() {
                ctx.card
                    .set_record(read.sfi, u16::from(read.record), open.record_data);
            }
        }
        ctx.card.take_snapshot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_open_parameters() {
        let open = OpenSecureSession::new(
            WriteAccessLevel::Debit,
            Some(ReadOnOpen { sfi: 0x07, record: 1 }),
            false,
            false,
        )
        .unwrap();
        let command = open.base().command();
        assert_eq!(command.p1(), 0x0B);
        assert_eq!(command.p2(), 0x39);

        let open = OpenSecureSession::new(WriteAccessLevel::Load, None, true, false).unwrap();
        assert_eq!(open.base().command().p1(), 0x02);
        assert_eq!(open.base().command().p2(), 0x02);

        assert!(
            OpenSecureSession::new(
                WriteAccessLevel::Load,
                Some(ReadOnOpen { sfi: 31, record: 1 }),
                false,
                false
            )
            .is_err()
        );
    }

    #[test]
    fn test_parse_regular_response() {
        let payload = Bytes::from_static(&hex!("AABBCC 01 00 10 20 04 DEADBEEF"));
        let response = OpenResponse::parse(&payload, false).unwrap();

        assert_eq!(response.transaction_counter, 0xAABBCC);
        assert_eq!(response.card_challenge.as_ref(), hex!("AABBCC01"));
        assert!(response.previous_session_ratified);
        assert!(!response.manage_session_authorized);
        assert_eq!((response.kif, response.kvc), (0x10, 0x20));
        assert_eq!(response.record_data.as_ref(), hex!("DEADBEEF"));
    }

    #[test]
    fn test_parse_extended_response() {
        let payload = Bytes::from_static(&hex!("000102 0304050607 03 21 79 00"));
        let response = OpenResponse::parse(&payload, true).unwrap();

        assert_eq!(response.transaction_counter, 0x000102);
        assert_eq!(response.card_challenge.len(), EXTENDED_CHALLENGE_LENGTH);
        assert!(!response.previous_session_ratified);
        assert!(response.manage_session_authorized);
        assert!(response.record_data.is_empty());
    }

    #[test]
    fn test_parse_rejects_inconsistent_length() {
        let payload = Bytes::from_static(&hex!("AABBCC 01 00 10 20 04 DEAD"));
        assert!(matches!(
            OpenResponse::parse(&payload, false),
            Err(Error::UnexpectedResponseLength { .. })
        ));
        let payload = Bytes::from_static(&hex!("0102030000"));
        assert!(OpenResponse::parse(&payload, false).is_err());
    }
}
