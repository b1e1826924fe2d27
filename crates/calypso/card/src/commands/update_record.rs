//! Update Record, Write Record and Append Record
//!
//! Update replaces a record, Write ORs the data into it and Append inserts
//! a new record 1 in a cyclic file. All three consume the card modification
//! buffer and answer `90 00` without data.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::{Command, command::MAX_DATA_LENGTH};

use super::{
    CardCommand, CommandBase, CommandContext, CommandKind, check_record_number, check_sfi,
    success_response,
};
use crate::constants::{CLA, READ_ONE_RECORD, ins};
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
            StatusProperties::failure(
                "Command forbidden on binary files, or on cyclic files for records other than 1",
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
            0x6A82,
            StatusProperties::failure("File not found", CommandErrorKind::DataAccess),
        ),
        (
            0x6A83,
            StatusProperties::failure(
                "Record not found (record index is 0 or above NumRec)",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6B00,
            StatusProperties::failure("P2 value not supported", CommandErrorKind::IllegalParameter),
        ),
    ])
});

static APPEND_STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    STATUS_TABLE.clone().merge(&[(
        0x6981,
        StatusProperties::failure("The current EF is not a cyclic EF", CommandErrorKind::DataAccess),
    )])
});

fn check_data(data: &Bytes) -> Result<()> {
    if data.is_empty() || data.len() > MAX_DATA_LENGTH {
        Err(Error::illegal_argument("record data length must be in [1..255]"))
    } else {
        Ok(())
    }
}

/// How the record content is changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordWriteMode {
    /// Replace the record
    Update,
    /// OR the data into the record
    Write,
}

#[derive(Debug)]
pub(crate) struct UpdateRecord {
    base: CommandBase,
    mode: RecordWriteMode,
    sfi: u8,
    record: u8,
    data: Bytes,
}

impl UpdateRecord {
    pub(crate) fn new(mode: RecordWriteMode, sfi: u8, record: u8, data: Bytes) -> Result<Self> {
        check_sfi(sfi)?;
        check_record_number(record)?;
        check_data(&data)?;
        let (kind, instruction) = match mode {
            RecordWriteMode::Update => (CommandKind::UpdateRecord, ins::UPDATE_RECORD),
            RecordWriteMode::Write => (CommandKind::WriteRecord, ins::WRITE_RECORD),
        };
        Ok(Self {
            base: CommandBase::new(
                kind,
                Command::new_with_data(CLA, instruction, record, sfi * 8 + READ_ONE_RECORD, data.clone()),
            ),
            mode,
            sfi,
            record,
            data,
        })
    }
}

impl CardCommand for UpdateRecord {
    fn kind(&self) -> CommandKind {
        match self.mode {
            RecordWriteMode::Update => CommandKind::UpdateRecord,
            RecordWriteMode::Write => CommandKind::WriteRecord,
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
        let record = u16::from(self.record);
        let (mode, data) = (self.mode, &self.data);
        ctx.project(self.sfi, |content, _| match mode {
            RecordWriteMode::Update => content.set_content(record, data.clone()),
            RecordWriteMode::Write => content.merge_content(record, data, 0),
        });

        if !ctx.in_session() {
            return Ok(false);
        }
        self.base.anticipate(ctx, success_response(&[]))
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.process_response(ctx, response, &STATUS_TABLE)?;
        let record = u16::from(self.record);
        match self.mode {
            RecordWriteMode::Update => ctx.card.set_record(self.sfi, record, self.data.clone()),
            RecordWriteMode::Write => ctx.card.merge_record_bits(self.sfi, record, &self.data, 0),
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct AppendRecord {
    base: CommandBase,
    sfi: u8,
    data: Bytes,
}

impl AppendRecord {
    pub(crate) fn new(sfi: u8, data: Bytes) -> Result<Self> {
        check_sfi(sfi)?;
        check_data(&data)?;
        Ok(Self {
            base: CommandBase::new(
                CommandKind::AppendRecord,
                Command::new_with_data(CLA, ins::APPEND_RECORD, 0x00, sfi * 8, data.clone()),
            ),
            sfi,
            data,
        })
    }
}

impl CardCommand for AppendRecord {
    fn kind(&self) -> CommandKind {
        CommandKind::AppendRecord
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn session_buffer_usage(&self) -> Option<usize> {
        Some(self.data.len())
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, &APPEND_STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        ctx.project(self.sfi, |content, _| content.add_cyclic_content(self.data.clone()));

        if !ctx.in_session() {
            return Ok(false);
        }
        self.base.anticipate(ctx, success_response(&[]))
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.process_response(ctx, response, &APPEND_STATUS_TABLE)?;
        ctx.card.shift_cyclic_and_insert(self.sfi, self.data.clone());
        Ok(())
    }
}
