//! Read Records

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;
use tracing::trace;

use super::{
    CardCommand, CommandBase, CommandContext, CommandKind, check_length, check_record_number,
    check_sfi, success_response,
};
use crate::constants::{CLA, READ_MULTIPLE_RECORDS, READ_ONE_RECORD, ins};
use crate::error::{CommandErrorKind, Error, Result};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6981,
            StatusProperties::failure("Command forbidden on binary files", CommandErrorKind::DataAccess),
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
                "Access forbidden (never access mode, SV log read after an SV operation in session)",
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
                "Record not found (record index is 0, or above NumRec)",
                CommandErrorKind::DataAccess,
            ),
        ),
        (
            0x6B00,
            StatusProperties::failure("P2 value not supported", CommandErrorKind::IllegalParameter),
        ),
    ])
});

/// How many records a Read Records returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// The requested record only
    OneRecord,
    /// The requested record and the following ones, as many as fit
    MultipleRecords,
}

#[derive(Debug)]
pub(crate) struct ReadRecords {
    base: CommandBase,
    sfi: u8,
    record: u8,
    mode: ReadMode,
    expected_length: u8,
}

impl ReadRecords {
    /// `expected_length` of 0 reads whole records
    pub(crate) fn new(sfi: u8, record: u8, mode: ReadMode, expected_length: u8) -> Result<Self> {
        check_sfi(sfi)?;
        check_record_number(record)?;
        let p2 = sfi * 8
            + match mode {
                ReadMode::OneRecord => READ_ONE_RECORD,
                ReadMode::MultipleRecords => READ_MULTIPLE_RECORDS,
            };
        Ok(Self {
            base: CommandBase::new(
                CommandKind::ReadRecords,
                Command::new_with_le(CLA, ins::READ_RECORDS, record, p2, expected_length),
            ),
            sfi,
            record,
            mode,
            expected_length,
        })
    }

    /// Store `(record, length, data)*` entries
    fn store_records(&self, ctx: &mut CommandContext<'_>, payload: &Bytes) -> Result<()> {
        let mut offset = 0;
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err(Error::inconsistent_data("truncated record header"));
            }
            let record = payload[offset];
            let length = usize::from(payload[offset + 1]);
            let end = offset + 2 + length;
            if end > payload.len() {
                return Err(Error::inconsistent_data("record data overflows the response"));
            }
            trace!(sfi = self.sfi, record, "Record read");
            ctx.card
                .set_record(self.sfi, u16::from(record), payload.slice(offset + 2..end));
            offset = end;
        }
        Ok(())
    }
}

impl CardCommand for ReadRecords {
    fn kind(&self) -> CommandKind {
        CommandKind::ReadRecords
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_best_effort(&self) -> bool {
        true
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        if self.mode != ReadMode::OneRecord || !ctx.in_session() {
            return Ok(false);
        }
        let known = ctx
            .expected_record(self.sfi, u16::from(self.record))
            .filter(|c| self.expected_length == 0 || c.len() == usize::from(self.expected_length));
        match known {
            Some(content) => self.base.anticipate(ctx, success_response(&content)),
            None => Ok(false),
        }
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = self.base.process_response(ctx, response, &STATUS_TABLE)?;
        let payload = response.payload();

        match self.mode {
            ReadMode::OneRecord => {
                if self.expected_length != 0 {
                    check_length(
                        CommandKind::ReadRecords,
                        usize::from(self.expected_length),
                        payload.len(),
                    )?;
                }
                ctx.card
                    .set_record(self.sfi, u16::from(self.record), payload.clone());
                Ok(())
            }
            ReadMode::MultipleRecords => self.store_records(ctx, payload),
        }
    }
}
