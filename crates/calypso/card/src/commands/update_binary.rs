//! Update Binary and Write Binary

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::{Command, command::MAX_DATA_LENGTH};

use super::read_binary::binary_parameters;
use super::{CardCommand, CommandBase, CommandContext, CommandKind, success_response};
use crate::constants::{CLA, ins};
use crate::error::{CommandErrorKind, Error, Result};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6400,
            StatusProperties::failure("Too many modifications in session", CommandErrorKind::SessionBufferOverflow),
        ),
        (
            0x6981,
            StatusProperties::failure("Incorrect EF type: not a binary EF", CommandErrorKind::DataAccess),
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
            StatusProperties::failure("Incorrect file type: the current file is not an EF", CommandErrorKind::DataAccess),
        ),
        (
            0x6A82,
            StatusProperties::failure("File not found", CommandErrorKind::DataAccess),
        ),
        (
            0x6B00,
            StatusProperties::failure("Offset not in the file", CommandErrorKind::IllegalParameter),
        ),
    ])
});

/// How the binary content is changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryWriteMode {
    /// Replace the bytes
    Update,
    /// OR the data into the bytes
    Write,
}

#[derive(Debug)]
pub(crate) struct UpdateBinary {
    base: CommandBase,
    mode: BinaryWriteMode,
    sfi: u8,
    offset: usize,
    data: Bytes,
}

impl UpdateBinary {
    pub(crate) fn new(mode: BinaryWriteMode, sfi: u8, offset: u16, data: Bytes) -> Result<Self> {
        if data.is_empty() || data.len() > MAX_DATA_LENGTH {
            return Err(Error::illegal_argument("binary data length must be in [1..255]"));
        }
        let (p1, p2) = binary_parameters(sfi, offset)?;
        let (kind, instruction) = match mode {
            BinaryWriteMode::Update => (CommandKind::UpdateBinary, ins::UPDATE_BINARY),
            BinaryWriteMode::Write => (CommandKind::WriteBinary, ins::WRITE_BINARY),
        };
        Ok(Self {
            base: CommandBase::new(kind, Command::new_with_data(CLA, instruction, p1, p2, data.clone())),
            mode,
            sfi,
            offset: usize::from(offset),
            data,
        })
    }
}

impl CardCommand for UpdateBinary {
    fn kind(&self) -> CommandKind {
        match self.mode {
            BinaryWriteMode::Update => CommandKind::UpdateBinary,
            BinaryWriteMode::Write => CommandKind::WriteBinary,
        }
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn session_buffer_usage(&self) -> Option<usize> {
        Some(self.data.len())
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        let (mode, offset, data) = (self.mode, self.offset, &self.data);
        ctx.project(self.sfi, |content, _| match mode {
            BinaryWriteMode::Update => content.set_content_at(1, data, offset),
            BinaryWriteMode::Write => content.merge_content(1, data, offset),
        });

        if !ctx.in_session() {
            return Ok(false);
        }
        self.base.anticipate(ctx, success_response(&[]))
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.process_response(ctx, response, &STATUS_TABLE)?;
        match self.mode {
            BinaryWriteMode::Update => ctx.card.set_record_at(self.sfi, 1, &self.data, self.offset),
            BinaryWriteMode::Write => ctx.card.merge_record_bits(self.sfi, 1, &self.data, self.offset),
        }
        Ok(())
    }
}
