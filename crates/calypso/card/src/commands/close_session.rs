//! Close Secure Session, and its abort form
//!
//! The close carries the terminal session MAC (none in asymmetric
//! sessions) and returns the postponed data followed by the card
//! authenticator. The abort is a close without data: the card cancels every
//! modification of the session.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::{Command, Response};
use tracing::{debug, warn};

use super::{CardCommand, CommandBase, CommandContext, CommandKind};
use crate::constants::{
    CLA, CLOSE_P1_IMPLICIT_RATIFICATION, CLOSE_P2_PKI, EXTENDED_MAC_LENGTH, MAC_LENGTH,
    PKI_SIGNATURE_LENGTH, ins,
};
use crate::error::{CommandErrorKind, Error, Result, SecurityError};
use crate::session::SessionPhase;
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6700,
            StatusProperties::failure(
                "Lc value not supported (MAC length does not match the session mode)",
                CommandErrorKind::IllegalParameter,
            ),
        ),
        (
            0x6B00,
            StatusProperties::failure("P1 or P2 value not supported", CommandErrorKind::IllegalParameter),
        ),
        (
            0x6988,
            StatusProperties::failure("Incorrect terminal session MAC", CommandErrorKind::SecurityData),
        ),
        (
            0x6985,
            StatusProperties::failure("No session was opened", CommandErrorKind::Access),
        ),
    ])
});

/// Split the postponed data of a close response: `(len data)*`
fn parse_postponed_data(bytes: &Bytes) -> Result<Vec<Bytes>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let length = usize::from(bytes[offset]);
        let end = offset + 1 + length;
        if end > bytes.len() {
            return Err(Error::inconsistent_data("postponed data entry overflows the response"));
        }
        entries.push(bytes.slice(offset + 1..end));
        offset = end;
    }
    Ok(entries)
}

#[derive(Debug)]
pub(crate) struct CloseSecureSession {
    base: CommandBase,
    pki: bool,
    extended: bool,
}

impl CloseSecureSession {
    pub(crate) const fn new(implicit_ratification: bool, pki: bool, extended: bool) -> Self {
        let p1 = if implicit_ratification {
            CLOSE_P1_IMPLICIT_RATIFICATION
        } else {
            0x00
        };
        let p2 = if pki { CLOSE_P2_PKI } else { 0x00 };
        Self {
            base: CommandBase::new(
                CommandKind::CloseSecureSession,
                Command::new_with_le(CLA, ins::CLOSE_SECURE_SESSION, p1, p2, 0),
            ),
            pki,
            extended,
        }
    }

    const fn authenticator_length(&self) -> usize {
        if self.pki {
            PKI_SIGNATURE_LENGTH
        } else if self.extended {
            EXTENDED_MAC_LENGTH
        } else {
            MAC_LENGTH
        }
    }
}

impl CardCommand for CloseSecureSession {
    fn kind(&self) -> CommandKind {
        CommandKind::CloseSecureSession
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_crypto_required_to_finalize_request(&self, _ctx: &CommandContext<'_>) -> bool {
        !self.pki
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        if let Some(mac) = ctx.crypto()?.finalize_session_authenticator()? {
            self.base.command_mut().data = Some(mac);
        }
        ctx.session()?.phase = SessionPhase::Closing;
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = Response::from_bytes(&response)?;
        STATUS_TABLE.check(CommandKind::CloseSecureSession, response.status())?;

        let payload = response.payload();
        let authenticator_length = self.authenticator_length();
        if payload.len() < authenticator_length {
            return Err(Error::UnexpectedResponseLength {
                command: CommandKind::CloseSecureSession,
                expected: authenticator_length,
                actual: payload.len(),
            });
        }
        let split = payload.len() - authenticator_length;
        let postponed = parse_postponed_data(&payload.slice(..split))?;
        let authenticator = payload.slice(split..);

        let crypto = ctx.crypto()?;
        crypto.verify_card_authenticator(&authenticator)?;

        if ctx.session()?.sv_postponed {
            let sv_mac = postponed.first().ok_or(SecurityError::MissingSvMac)?.clone();
            ctx.crypto()?.verify_sv_mac(&sv_mac)?;
        }

        debug!(postponed = postponed.len(), "Secure session closed");
        ctx.session()?.phase = SessionPhase::Closed;
        ctx.card.discard_snapshot();
        Ok(())
    }
}

/// Close Secure Session without authenticator: `00 8E 00 00 00`
#[derive(Debug)]
pub(crate) struct AbortSecureSession {
    base: CommandBase,
}

impl AbortSecureSession {
    pub(crate) const fn new() -> Self {
        Self {
            base: CommandBase::new(
                CommandKind::AbortSecureSession,
                Command::new_with_le(CLA, ins::CLOSE_SECURE_SESSION, 0x00, 0x00, 0),
            ),
        }
    }
}

impl CardCommand for AbortSecureSession {
    fn kind(&self) -> CommandKind {
        CommandKind::AbortSecureSession
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_crypto_required_to_finalize_request(&self, _ctx: &CommandContext<'_>) -> bool {
        false
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        if let Some(session) = ctx.session.as_deref_mut() {
            session.phase = SessionPhase::Aborting;
        }
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        Ok(false)
    }

    /// The session is cancelled whatever the card answers
    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        match Response::from_bytes(&response) {
            Ok(response) if !response.is_success() => {
                warn!(status = %response.status(), "Card refused the session abort");
            }
            Ok(_) => debug!("Secure session aborted"),
            Err(e) => warn!(error = %e, "Malformed response to the session abort"),
        }
        if let Some(session) = ctx.session.as_deref_mut() {
            session.phase = SessionPhase::Closed;
        }
        ctx.card.rollback();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardRuntime;
    use crate::commands::testing::{Fixture, run_free};
    use hex_literal::hex;

    #[test]
    fn test_postponed_data() {
        let entries = parse_postponed_data(&Bytes::from_static(&hex!("03AABBCC 00 01DD"))).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].as_ref(), hex!("AABBCC"));
        assert!(entries[1].is_empty());
        assert_eq!(entries[2].as_ref(), hex!("DD"));

        assert!(parse_postponed_data(&Bytes::from_static(&hex!("04AABB"))).is_err());
    }

    #[test]
    fn test_close_parameters() {
        let close = CloseSecureSession::new(true, false, false);
        assert_eq!(close.base().command().p1(), 0x80);
        assert_eq!(close.authenticator_length(), 4);

        let close = CloseSecureSession::new(false, true, true);
        assert_eq!(close.base().command().p1(), 0x00);
        assert_eq!(close.base().command().p2(), CLOSE_P2_PKI);
        assert_eq!(close.authenticator_length(), PKI_SIGNATURE_LENGTH);
    }

    #[test]
    fn test_abort_rolls_back_whatever_the_status() {
        let mut fixture = Fixture::new(CardRuntime::default());
        fixture.card.take_snapshot();
        fixture.card.set_record(1, 1, Bytes::from_static(&hex!("01")));

        let mut abort = AbortSecureSession::new();
        let request = run_free(&mut fixture, &mut abort, &hex!("6985")).unwrap();

        assert_eq!(request.apdu.as_ref(), hex!("008E000000"));
        assert!(fixture.card.record_by_sfi(1, 1).is_none());
    }
}
