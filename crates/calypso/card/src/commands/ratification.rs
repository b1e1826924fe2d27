//! Explicit ratification
//!
//! Any command received after a Close Secure Session ratifies the session.
//! A Read Record of record 0 is used: the card rejects it, which is expected.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::{Command, Response};
use tracing::{debug, trace};

use super::{CardCommand, CommandBase, CommandContext, CommandKind};
use crate::constants::{CLA, ins};
use crate::error::Result;
use crate::status::StatusTable;

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(StatusTable::base);

#[derive(Debug)]
pub(crate) struct Ratification {
    base: CommandBase,
}

impl Ratification {
    pub(crate) const fn new() -> Self {
        Self {
            base: CommandBase::new(
                CommandKind::Ratification,
                Command::new_with_le(CLA, ins::READ_RECORDS, 0x00, 0x00, 0),
            ),
        }
    }
}

impl CardCommand for Ratification {
    fn kind(&self) -> CommandKind {
        CommandKind::Ratification
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_crypto_required_to_finalize_request(&self, _ctx: &CommandContext<'_>) -> bool {
        false
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn parse_response(&mut self, response: Bytes, _ctx: &mut CommandContext<'_>) -> Result<()> {
        if let Ok(response) = Response::from_bytes(&response) {
            trace!(status = %response.status(), "Ratification answered");
        }
        debug!("Session ratified");
        Ok(())
    }
}
