//! Increase and Decrease
//!
//! Both carry a 3 byte unsigned value and return the new counter value.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;

use super::{CardCommand, CommandBase, CommandContext, CommandKind, check_length, check_sfi, success_response};
use crate::constants::{CLA, COUNTER_MAX, COUNTER_SIZE, ins};
use crate::error::{CommandErrorKind, Error, Result};
use crate::status::{StatusProperties, StatusTable};

fn status_table(out_of_bounds: &'static str) -> StatusTable {
    StatusTable::base().merge(&[
        (
            0x6400,
            StatusProperties::failure("Too many modifications in session", CommandErrorKind::SessionBufferOverflow),
        ),
        (
            0x6981,
            StatusProperties::failure(
                "The current EF is not a counters or simulated counter EF",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6982,
            StatusProperties::failure(
                "Security conditions not fulfilled (no session, wrong key, encryption required)",
                CommandErrorKind::SecurityContext,
            ),
        ),
        (
            0x6985,
            StatusProperties::failure(
                "Access forbidden (never access mode, DF is invalidated)",
                CommandErrorKind::Access,
            ),
        ),
        (
            0x6986,
            StatusProperties::failure("Command not allowed (no current EF)", CommandErrorKind::DataAccess),
        ),
        (
            0x6A80,
            StatusProperties::failure(out_of_bounds, CommandErrorKind::DataOutOfBounds),
        ),
        (
            0x6A82,
            StatusProperties::failure("File not found", CommandErrorKind::DataAccess),
        ),
        (
            0x6B00,
            StatusProperties::failure("P1 or P2 value not supported", CommandErrorKind::IllegalParameter),
        ),
    ])
}

static INCREASE_STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| status_table("Overflow error"));
static DECREASE_STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| status_table("Underflow error"));

/// Direction of the counter change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CounterOperation {
    Increase,
    Decrease,
}

impl CounterOperation {
    fn table(self) -> &'static StatusTable {
        match self {
            Self::Increase => &INCREASE_STATUS_TABLE,
            Self::Decrease => &DECREASE_STATUS_TABLE,
        }
    }

    /// New value, `None` when it leaves the counter range
    const fn apply(self, current: u32, value: u32) -> Option<u32> {
        let new = match self {
            Self::Increase => current.checked_add(value),
            Self::Decrease => current.checked_sub(value),
        };
        match new {
            Some(new) if new <= COUNTER_MAX => Some(new),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ModifyCounter {
    base: CommandBase,
    operation: CounterOperation,
    sfi: u8,
    counter: u8,
    value: u32,
}

impl ModifyCounter {
    pub(crate) fn new(operation: CounterOperation, sfi: u8, counter: u8, value: u32) -> Result<Self> {
        check_sfi(sfi)?;
        if counter == 0 {
            return Err(Error::illegal_argument("counter number must be in [1..255]"));
        }
        if value > COUNTER_MAX {
            return Err(Error::illegal_argument("counter value must fit on 3 bytes"));
        }
        let (kind, instruction) = match operation {
            CounterOperation::Increase => (CommandKind::Increase, ins::INCREASE),
            CounterOperation::Decrease => (CommandKind::Decrease, ins::DECREASE),
        };
        let data = value.to_be_bytes()[1..].to_vec();
        Ok(Self {
            base: CommandBase::new(
                kind,
                Command::new_with_data(CLA, instruction, counter, sfi * 8, data).with_le(0),
            ),
            operation,
            sfi,
            counter,
            value,
        })
    }
}

impl CardCommand for ModifyCounter {
    fn kind(&self) -> CommandKind {
        match self.operation {
            CounterOperation::Increase => CommandKind::Increase,
            CounterOperation::Decrease => CommandKind::Decrease,
        }
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn session_buffer_usage(&self) -> Option<usize> {
        Some(COUNTER_SIZE)
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, self.operation.table())
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        let anticipated = ctx
            .expected_counter(self.sfi, self.counter)
            .and_then(|current| self.operation.apply(current, self.value));
        let counter = self.counter;
        ctx.project(self.sfi, |data, file_type| match anticipated {
            Some(new) => data.set_counter(file_type, counter, new),
            None => data.forget_counter(file_type, counter),
        });

        if !ctx.in_session() {
            return Ok(false);
        }
        match anticipated {
            Some(new) => self.base.anticipate(ctx, success_response(&new.to_be_bytes()[1..])),
            None => Ok(false),
        }
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = self.base.process_response(ctx, response, self.operation.table())?;
        let payload = response.payload();
        check_length(self.kind(), COUNTER_SIZE, payload.len())?;
        let value = u32::from_be_bytes([0, payload[0], payload[1], payload[2]]);
        ctx.card.set_counter(self.sfi, self.counter, value);
        Ok(())
    }
}
