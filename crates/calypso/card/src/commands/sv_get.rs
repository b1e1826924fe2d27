//! SV Get
//!
//! Reads the SV state needed to prepare the next reload or debit. The raw
//! request and response are kept in the card image, the SAM signs the SV
//! operation over them.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;

use super::{CardCommand, CommandBase, CommandContext, CommandKind};
use crate::card::{SvData, SvOperation};
use crate::constants::{CLA, SV_GET_P2_DEBIT, SV_GET_P2_RELOAD, ins};
use crate::error::{CommandErrorKind, Result};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6982,
            StatusProperties::failure(
                "Security conditions not fulfilled",
                CommandErrorKind::SecurityContext,
            ),
        ),
        (
            0x6985,
            StatusProperties::failure(
                "Preconditions not satisfied (an SV operation was already done in the session)",
                CommandErrorKind::Access,
            ),
        ),
        (
            0x6A81,
            StatusProperties::failure("Incorrect P1 or P2", CommandErrorKind::IllegalParameter),
        ),
        (
            0x6A86,
            StatusProperties::failure("Le inconsistent with P2", CommandErrorKind::IllegalParameter),
        ),
    ])
});

#[derive(Debug)]
pub(crate) struct SvGet {
    base: CommandBase,
    operation: SvOperation,
}

impl SvGet {
    pub(crate) fn new(operation: SvOperation) -> Self {
        let p2 = match operation {
            SvOperation::Reload => SV_GET_P2_RELOAD,
            SvOperation::Debit => SV_GET_P2_DEBIT,
        };
        Self {
            base: CommandBase::new(CommandKind::SvGet, Command::new_with_le(CLA, ins::SV_GET, 0x00, p2, 0)),
            operation,
        }
    }
}

impl CardCommand for SvGet {
    fn kind(&self) -> CommandKind {
        CommandKind::SvGet
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    // The response carries a fresh SV challenge
    fn synchronize_crypto_before_card_processing(
        &mut self,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        self.base.process_response(ctx, response.clone(), &STATUS_TABLE)?;
        let request = self.apdu_request()?.apdu;
        let data = SvData::parse(self.operation, request, response)?;
        tracing::debug!(
            operation = %self.operation,
            balance = data.balance,
            kvc = data.kvc,
            "SV data read"
        );
        ctx.card.set_sv_data(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardRuntime;
    use crate::commands::testing::{Fixture, run_free};
    use crate::error::Error;
    use hex_literal::hex;

    const DEBIT_RESPONSE: [u8; 32] = hex!(
        "79 0012 AABBCC 1122 0003E8"
        "FFF6 1234 0800 79 11223344 000010 0003E8 0011 9000"
    );

    #[test]
    fn test_sv_get_for_debit() {
        let mut fixture = Fixture::new(CardRuntime::default());
        let mut get = SvGet::new(SvOperation::Debit);
        let request = run_free(&mut fixture, &mut get, &DEBIT_RESPONSE).unwrap();

        assert_eq!(request.apdu.as_ref(), hex!("007C000900"));
        let sv = fixture.card.sv_data().unwrap();
        assert_eq!(sv.balance, 1000);
        assert_eq!(sv.get_request.as_ref(), hex!("007C000900"));
        assert_eq!(sv.get_response.as_ref(), DEBIT_RESPONSE);
        assert_eq!(fixture.card.consume_sv_data().unwrap().kvc, 0x79);
        assert!(fixture.card.consume_sv_data().is_none());
    }

    #[test]
    fn test_sv_get_rejects_short_response() {
        let mut fixture = Fixture::new(CardRuntime::default());
        let mut get = SvGet::new(SvOperation::Reload);
        assert!(matches!(
            run_free(&mut fixture, &mut get, &DEBIT_RESPONSE),
            Err(Error::UnexpectedResponseLength { expected: 33, actual: 30, .. })
        ));
        assert!(fixture.card.sv_data().is_none());
    }
}
