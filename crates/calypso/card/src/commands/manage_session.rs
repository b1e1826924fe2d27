//! Manage Secure Session: switches the encryption of the session exchanges

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;
use tracing::debug;

use super::{CardCommand, CommandBase, CommandContext, CommandKind, success_response};
use crate::constants::{CLA, MANAGE_P2_ENCRYPTION_OFF, MANAGE_P2_ENCRYPTION_ON, ins};
use crate::error::{CommandErrorKind, Error, Result};
use crate::session::SessionPhase;
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6982,
            StatusProperties::failure(
                "Security conditions not fulfilled (no session open)",
                CommandErrorKind::SecurityContext,
            ),
        ),
        (
            0x6985,
            StatusProperties::failure(
                "Preconditions not satisfied (extended mode not active)",
                CommandErrorKind::Access,
            ),
        ),
    ])
});

#[derive(Debug)]
pub(crate) struct ManageSecureSession {
    base: CommandBase,
    encryption: bool,
}

impl ManageSecureSession {
    pub(crate) const fn new(encryption: bool) -> Self {
        let p2 = if encryption {
            MANAGE_P2_ENCRYPTION_ON
        } else {
            MANAGE_P2_ENCRYPTION_OFF
        };
        Self {
            base: CommandBase::new(
                CommandKind::ManageSecureSession,
                Command::new(CLA, ins::MANAGE_SECURE_SESSION, 0x00, p2),
            ),
            encryption,
        }
    }

    fn switch_encryption(&self, ctx: &mut CommandContext<'_>) -> Result<()> {
        debug!(active = self.encryption, "Switching session encryption");
        ctx.crypto()?.set_encryption(self.encryption)
    }
}

impl CardCommand for ManageSecureSession {
    fn kind(&self) -> CommandKind {
        CommandKind::ManageSecureSession
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    /// The card flags of the open response must be known
    fn is_crypto_required_to_finalize_request(&self, ctx: &CommandContext<'_>) -> bool {
        ctx.session
            .as_ref()
            .is_some_and(|s| s.phase == SessionPhase::Opening)
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        if ctx.crypto()?.is_pki() {
            return Err(Error::illegal_state(
                "encryption is not available in asymmetric sessions",
            ));
        }
        let session = ctx.session()?;
        if !session.manage_session_authorized {
            return Err(Error::illegal_state(
                "the card does not authorize Manage Secure Session",
            ));
        }
        session.encryption_active = self.encryption;
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        if self.base.anticipate(ctx, success_response(&[]))? {
            self.switch_encryption(ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.process_response(ctx, response, &STATUS_TABLE)?;
        if !self.base.is_anticipated() {
            self.switch_encryption(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manage_parameters() {
        assert_eq!(ManageSecureSession::new(true).base().command().p2(), 0x03);
        assert_eq!(ManageSecureSession::new(false).base().command().p2(), 0x01);
    }
}
