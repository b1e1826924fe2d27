//! Read Binary

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;

use super::{CardCommand, CommandBase, CommandContext, CommandKind, check_length, check_sfi, success_response};
use crate::constants::{BINARY_SFI_FLAG, CLA, ins};
use crate::error::{CommandErrorKind, Error, Result};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6981,
            StatusProperties::failure("Incorrect EF type: not a binary EF", CommandErrorKind::DataAccess),
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
            StatusProperties::failure("Access forbidden (never access mode)", CommandErrorKind::Access),
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

/// P1 and P2 of the binary commands
pub(crate) fn binary_parameters(sfi: u8, offset: u16) -> Result<(u8, u8)> {
    check_sfi(sfi)?;
    if sfi != 0 && offset <= 0xFF {
        Ok((BINARY_SFI_FLAG | sfi, offset as u8))
    } else if sfi == 0 && offset <= 0x7FFF {
        let [high, low] = offset.to_be_bytes();
        Ok((high, low))
    } else {
        Err(Error::illegal_argument(
            "offset above 255 only reaches the current EF (SFI 0), up to 32767",
        ))
    }
}

#[derive(Debug)]
pub(crate) struct ReadBinary {
    base: CommandBase,
    sfi: u8,
    offset: usize,
    length: u8,
}

impl ReadBinary {
    pub(crate) fn new(sfi: u8, offset: u16, length: u8) -> Result<Self> {
        if length == 0 {
            return Err(Error::illegal_argument("read length must be in [1..255]"));
        }
        let (p1, p2) = binary_parameters(sfi, offset)?;
        Ok(Self {
            base: CommandBase::new(
                CommandKind::ReadBinary,
                Command::new_with_le(CLA, ins::READ_BINARY, p1, p2, length),
            ),
            sfi,
            offset: usize::from(offset),
            length,
        })
    }
}

impl CardCommand for ReadBinary {
    fn kind(&self) -> CommandKind {
        CommandKind::ReadBinary
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
        if !ctx.in_session() {
            return Ok(false);
        }
        let end = self.offset + usize::from(self.length);
        let known = ctx
            .expected_binary(self.sfi, self.offset..end)
            .map(|content| success_response(&content));
        match known {
            Some(response) => self.base.anticipate(ctx, response),
            None => Ok(false),
        }
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = self.base.process_response(ctx, response, &STATUS_TABLE)?;
        let payload = response.payload();
        check_length(CommandKind::ReadBinary, usize::from(self.length), payload.len())?;
        ctx.card.set_record_at(self.sfi, 1, payload, self.offset);
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
    fn test_binary_parameters() {
        assert_eq!(binary_parameters(0x01, 0x10).unwrap(), (0x81, 0x10));
        assert_eq!(binary_parameters(0x00, 0x0123).unwrap(), (0x01, 0x23));
        assert!(binary_parameters(0x01, 0x0100).is_err());
        assert!(binary_parameters(0x00, 0x8000).is_err());
    }

    #[test]
    fn test_read_binary_stores_at_offset() {
        let mut fixture = Fixture::new(CardRuntime::default());
        let mut read = ReadBinary::new(0x01, 2, 3).unwrap();
        let request = run_free(&mut fixture, &mut read, &hex!("AABBCC9000")).unwrap();

        assert_eq!(request.apdu.as_ref(), hex!("00B0810203"));
        assert_eq!(
            fixture.card.record_by_sfi(0x01, 1).unwrap().as_ref(),
            hex!("0000AABBCC")
        );
    }

    #[test]
    fn test_read_binary_requires_exact_length() {
        let mut fixture = Fixture::new(CardRuntime::default());
        let mut read = ReadBinary::new(0x01, 0, 4).unwrap();
        assert!(matches!(
            run_free(&mut fixture, &mut read, &hex!("AABBCC9000")),
            Err(Error::UnexpectedResponseLength { .. })
        ));
    }
}
