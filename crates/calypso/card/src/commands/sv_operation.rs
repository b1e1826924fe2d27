//! SV Reload, SV Debit and SV Undebit
//!
//! The command data is completed at finalization with the security data
//! computed by the crypto back-end over the last SV Get exchange. Outside a
//! session the card answers with the low part of the SV signature; inside a
//! session it answers `62 00` and the signature comes with the close response.

use std::sync::LazyLock;

use bytes::Bytes;
use calypso_apdu_core::Command;
use tracing::debug;

use super::{CardCommand, CommandBase, CommandContext, CommandKind, check_length};
use crate::card::{SvOperation, i24_bytes};
use crate::constants::{CLA, EXTENDED_SV_SIGNATURE_LENGTH, SV_SIGNATURE_LENGTH, ins};
use crate::crypto::SvSecurityInput;
use crate::error::{CommandErrorKind, Error, Result};
use crate::status::{StatusProperties, StatusTable};

static STATUS_TABLE: LazyLock<StatusTable> = LazyLock::new(|| {
    StatusTable::base().merge(&[
        (
            0x6200,
            StatusProperties::success("Successful execution, response data postponed until session closing"),
        ),
        (
            0x6400,
            StatusProperties::failure("Too many modifications in session", CommandErrorKind::SessionBufferOverflow),
        ),
        (
            0x6700,
            StatusProperties::failure("Lc value not supported", CommandErrorKind::IllegalParameter),
        ),
        (
            0x6900,
            StatusProperties::failure(
                "Transaction counter is 0 or SV TNum is FFFEh or FFFFh",
                CommandErrorKind::Terminated,
            ),
        ),
        (
            0x6985,
            StatusProperties::failure("Preconditions not satisfied", CommandErrorKind::Access),
        ),
        (
            0x6988,
            StatusProperties::failure("Incorrect signatureHi", CommandErrorKind::SecurityData),
        ),
    ])
});

/// Largest amount of a reload, signed on 3 bytes
const MAX_RELOAD_AMOUNT: i32 = 0x7F_FFFF;
/// Largest amount of a debit or undebit, on 2 bytes
const MAX_DEBIT_AMOUNT: i32 = 0x7FFF;

/// SV balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SvModification {
    /// Add a possibly negative amount, with two free bytes stored in the log
    Reload { amount: i32, free: [u8; 2] },
    Debit { amount: i32 },
    /// Cancel a previous debit
    Undebit { amount: i32 },
}

impl SvModification {
    const fn kind(self) -> CommandKind {
        match self {
            Self::Reload { .. } => CommandKind::SvReload,
            Self::Debit { .. } => CommandKind::SvDebit,
            Self::Undebit { .. } => CommandKind::SvUndebit,
        }
    }

    const fn instruction(self) -> u8 {
        match self {
            Self::Reload { .. } => ins::SV_RELOAD,
            Self::Debit { .. } => ins::SV_DEBIT,
            Self::Undebit { .. } => ins::SV_UNDEBIT,
        }
    }

    /// SV Get preparation this change needs
    pub(crate) const fn operation(self) -> SvOperation {
        match self {
            Self::Reload { .. } => SvOperation::Reload,
            Self::Debit { .. } | Self::Undebit { .. } => SvOperation::Debit,
        }
    }

    /// Signed effect on the balance
    pub(crate) const fn delta(self) -> i32 {
        match self {
            Self::Reload { amount, .. } | Self::Undebit { amount } => amount,
            Self::Debit { amount } => -amount,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SvCommand {
    base: CommandBase,
    modification: SvModification,
    date: u16,
    time: u16,
}

impl SvCommand {
    pub(crate) fn new(modification: SvModification, date: u16, time: u16) -> Result<Self> {
        match modification {
            SvModification::Reload { amount, .. }
                if !(-MAX_RELOAD_AMOUNT - 1..=MAX_RELOAD_AMOUNT).contains(&amount) =>
            {
                return Err(Error::illegal_argument("reload amount must fit on 3 signed bytes"));
            }
            SvModification::Debit { amount } | SvModification::Undebit { amount }
                if !(0..=MAX_DEBIT_AMOUNT).contains(&amount) =>
            {
                return Err(Error::illegal_argument("debit amount must be in [0..32767]"));
            }
            _ => {}
        }
        Ok(Self {
            base: CommandBase::new(
                modification.kind(),
                Command::new(CLA, modification.instruction(), 0x00, 0x00).with_le(0),
            ),
            modification,
            date,
            time,
        })
    }

    /// Command data preceding the security data
    fn data_prefix(&self, kvc: u8) -> Vec<u8> {
        let date = self.date.to_be_bytes();
        let time = self.time.to_be_bytes();
        let mut data = Vec::with_capacity(10);
        match self.modification {
            SvModification::Reload { amount, free } => {
                data.extend_from_slice(&date);
                data.push(free[0]);
                data.push(kvc);
                data.push(free[1]);
                data.extend_from_slice(&i24_bytes(amount));
                data.extend_from_slice(&time);
            }
            SvModification::Debit { .. } | SvModification::Undebit { .. } => {
                // Debits carry the amount negated
                let amount = self.modification.delta() as i16;
                data.extend_from_slice(&amount.to_be_bytes());
                data.extend_from_slice(&date);
                data.extend_from_slice(&time);
                data.push(kvc);
            }
        }
        data
    }
}

impl CardCommand for SvCommand {
    fn kind(&self) -> CommandKind {
        self.modification.kind()
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn is_crypto_required_to_finalize_request(&self, _ctx: &CommandContext<'_>) -> bool {
        true
    }

    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()> {
        let sv = ctx
            .card
            .consume_sv_data()
            .ok_or(Error::illegal_state("an SV Get must precede each SV operation"))?;
        if sv.operation() != self.modification.operation() {
            return Err(Error::illegal_state("the last SV Get prepared another SV operation"));
        }
        ctx.setting.check_sv_key(sv.kvc)?;
        if matches!(self.modification, SvModification::Debit { .. })
            && !ctx.setting.sv_negative_balance
            && sv.balance + self.modification.delta() < 0
        {
            return Err(Error::illegal_state("negative SV balances are not allowed"));
        }

        let prefix = self.data_prefix(sv.kvc);
        let partial = self.base.command().clone().with_data(prefix.clone()).to_bytes()?;
        let security = ctx.crypto()?.compute_sv_security_data(&SvSecurityInput {
            sv_get_request: sv.get_request,
            sv_get_response: sv.get_response,
            sv_command_partial_request: partial,
        })?;

        let mut data = prefix;
        data.extend_from_slice(&security.to_bytes());
        self.base.command_mut().data = Some(data.into());
        self.base.finalize(ctx, &STATUS_TABLE)
    }

    // The card output is an unpredictable signature
    fn synchronize_crypto_before_card_processing(
        &mut self,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()> {
        let response = self.base.process_response(ctx, response, &STATUS_TABLE)?;

        if let Some(session) = ctx.session.as_deref_mut() {
            session.sv_postponed = true;
        } else {
            let expected = if ctx.card.runtime().extended_mode {
                EXTENDED_SV_SIGNATURE_LENGTH
            } else {
                SV_SIGNATURE_LENGTH
            };
            check_length(self.kind(), expected, response.payload().len())?;
            ctx.crypto()?.verify_sv_mac(response.payload())?;
        }

        if let Some(sv) = ctx.card.sv_data_mut() {
            sv.balance += self.modification.delta();
            debug!(command = self.kind().name(), balance = sv.balance, "SV balance updated");
        }
        Ok(())
    }
}
