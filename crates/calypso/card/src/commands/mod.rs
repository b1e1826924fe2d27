//! Calypso card commands
//!
//! Each command goes through the same lifecycle, driven by the transaction:
//!
//! 1. [`CardCommand::finalize_request`] builds the final APDU, encrypting it
//!    when the session asks for it;
//! 2. [`CardCommand::synchronize_crypto_before_card_processing`] feeds the
//!    request and its anticipated response to the session authenticator when
//!    the response is predictable, so a whole session fits in one batch;
//! 3. [`CardCommand::parse_response`] checks the status word, checks the
//!    response against the anticipated one or feeds it to the authenticator,
//!    then updates the card image.
//!
//! [`CardCommand::is_crypto_required_to_finalize_request`] tells the
//! transaction the pending batch must be exchanged first, because building
//! this command needs an up to date authenticator.

mod close_session;
mod counter;
mod manage_session;
mod open_session;
mod ratification;
mod read_binary;
mod read_records;
mod sv_get;
mod sv_operation;
mod update_binary;
mod update_record;

pub(crate) use close_session::{AbortSecureSession, CloseSecureSession};
pub(crate) use counter::{CounterOperation, ModifyCounter};
pub(crate) use manage_session::ManageSecureSession;
pub(crate) use open_session::{OpenSecureSession, ReadOnOpen};
pub(crate) use ratification::Ratification;
pub(crate) use read_binary::ReadBinary;
pub(crate) use read_records::{ReadMode, ReadRecords};
pub(crate) use sv_get::SvGet;
pub(crate) use sv_operation::{SvCommand, SvModification};
pub(crate) use update_binary::{BinaryWriteMode, UpdateBinary};
pub(crate) use update_record::{AppendRecord, RecordWriteMode, UpdateRecord};

use std::fmt;
use std::ops::Range;

use bytes::Bytes;
use calypso_apdu_core::{ApduRequest, Command, Response};
use tracing::trace;

use crate::card::{CalypsoCard, FileData, FileType, PendingContent};
use crate::crypto::CryptoBackend;
use crate::error::{Error, Result, SecurityError};
use crate::session::SessionState;
use crate::settings::SecuritySetting;
use crate::status::StatusTable;

/// Calypso command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CommandKind {
    /// Open Secure Session
    #[display("Open Secure Session")]
    OpenSecureSession,
    /// Close Secure Session
    #[display("Close Secure Session")]
    CloseSecureSession,
    /// Close Secure Session without authenticator, cancelling the session
    #[display("Abort Secure Session")]
    AbortSecureSession,
    /// Ratification
    #[display("Ratification")]
    Ratification,
    /// Manage Secure Session
    #[display("Manage Secure Session")]
    ManageSecureSession,
    /// Read Records
    #[display("Read Records")]
    ReadRecords,
    /// Read Binary
    #[display("Read Binary")]
    ReadBinary,
    /// Update Record
    #[display("Update Record")]
    UpdateRecord,
    /// Write Record
    #[display("Write Record")]
    WriteRecord,
    /// Append Record
    #[display("Append Record")]
    AppendRecord,
    /// Update Binary
    #[display("Update Binary")]
    UpdateBinary,
    /// Write Binary
    #[display("Write Binary")]
    WriteBinary,
    /// Increase
    #[display("Increase")]
    Increase,
    /// Decrease
    #[display("Decrease")]
    Decrease,
    /// SV Get
    #[display("SV Get")]
    SvGet,
    /// SV Reload
    #[display("SV Reload")]
    SvReload,
    /// SV Debit
    #[display("SV Debit")]
    SvDebit,
    /// SV Undebit
    #[display("SV Undebit")]
    SvUndebit,
}

impl CommandKind {
    /// Short name used in logs and exchange info
    pub const fn name(self) -> &'static str {
        match self {
            Self::OpenSecureSession => "open_secure_session",
            Self::CloseSecureSession => "close_secure_session",
            Self::AbortSecureSession => "abort_secure_session",
            Self::Ratification => "ratification",
            Self::ManageSecureSession => "manage_secure_session",
            Self::ReadRecords => "read_records",
            Self::ReadBinary => "read_binary",
            Self::UpdateRecord => "update_record",
            Self::WriteRecord => "write_record",
            Self::AppendRecord => "append_record",
            Self::UpdateBinary => "update_binary",
            Self::WriteBinary => "write_binary",
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::SvGet => "sv_get",
            Self::SvReload => "sv_reload",
            Self::SvDebit => "sv_debit",
            Self::SvUndebit => "sv_undebit",
        }
    }

    /// Whether the command data may be encrypted in session
    const fn is_encryptable(self) -> bool {
        !matches!(
            self,
            Self::OpenSecureSession
                | Self::CloseSecureSession
                | Self::AbortSecureSession
                | Self::Ratification
                | Self::ManageSecureSession
        )
    }
}

/// What a command sees of the transaction while it goes through its lifecycle
#[derive(Debug)]
pub(crate) struct CommandContext<'a> {
    pub(crate) card: &'a mut CalypsoCard,
    /// Present when the command belongs to a secure session
    pub(crate) session: Option<&'a mut SessionState>,
    /// Present in secure transactions
    pub(crate) crypto: Option<&'a mut CryptoBackend>,
    pub(crate) setting: &'a SecuritySetting,
    /// Effects of the commands queued before this one in the batch
    pub(crate) pending: &'a mut PendingContent,
}

impl CommandContext<'_> {
    pub(crate) const fn in_session(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn session(&mut self) -> Result<&mut SessionState> {
        self.session
            .as_deref_mut()
            .ok_or(Error::illegal_state("no secure session in progress"))
    }

    pub(crate) fn crypto(&mut self) -> Result<&mut CryptoBackend> {
        self.crypto
            .as_deref_mut()
            .ok_or(Error::illegal_state("no crypto back-end available"))
    }

    /// Whether every previous exchange of the session reached the authenticator
    pub(crate) fn is_crypto_synchronized(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.crypto_synchronized)
    }

    pub(crate) fn is_encryption_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.encryption_active)
    }

    /// Record content expected once the queued commands are processed
    pub(crate) fn expected_record(&self, sfi: u8, record: u16) -> Option<Bytes> {
        self.pending.record(&*self.card, sfi, record)
    }

    /// Binary content expected once the queued commands are processed
    pub(crate) fn expected_binary(&self, sfi: u8, range: Range<usize>) -> Option<Bytes> {
        self.pending.binary(&*self.card, sfi, range)
    }

    /// Counter value expected once the queued commands are processed
    pub(crate) fn expected_counter(&self, sfi: u8, counter: u8) -> Option<u32> {
        self.pending.counter(&*self.card, sfi, counter)
    }

    /// Record the effect of the command on the expected content
    pub(crate) fn project(&mut self, sfi: u8, effect: impl FnOnce(&mut FileData, FileType)) {
        self.pending.update(&*self.card, sfi, effect);
    }
}

/// Lifecycle of a card command within a transaction
pub(crate) trait CardCommand: fmt::Debug + Send {
    /// Command identifier
    fn kind(&self) -> CommandKind;

    /// Shared request state
    fn base(&self) -> &CommandBase;

    /// Data length charged to the card modification buffer, if any
    fn session_buffer_usage(&self) -> Option<usize> {
        None
    }

    /// Whether a missing file or record is tolerated outside a session
    fn is_best_effort(&self) -> bool {
        false
    }

    /// Whether building the request needs every previous exchange processed
    fn is_crypto_required_to_finalize_request(&self, ctx: &CommandContext<'_>) -> bool {
        ctx.is_encryption_active()
    }

    /// Build the final request
    fn finalize_request(&mut self, ctx: &mut CommandContext<'_>) -> Result<()>;

    /// Feed the authenticator ahead of the exchange when possible
    ///
    /// Returns whether the authenticator is still synchronized after this command.
    fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut CommandContext<'_>,
    ) -> Result<bool>;

    /// Process the raw response (`DataOut || SW1 || SW2`)
    fn parse_response(&mut self, response: Bytes, ctx: &mut CommandContext<'_>) -> Result<()>;

    /// Final request, once finalized
    fn apdu_request(&self) -> Result<ApduRequest> {
        self.base()
            .request
            .clone()
            .ok_or(Error::illegal_state("command request not finalized"))
    }
}

/// Request state shared by every command
#[derive(Debug)]
pub(crate) struct CommandBase {
    kind: CommandKind,
    command: Command,
    request: Option<ApduRequest>,
    anticipated_response: Option<Bytes>,
    encrypted: bool,
}

impl CommandBase {
    pub(crate) const fn new(kind: CommandKind, command: Command) -> Self {
        Self {
            kind,
            command,
            request: None,
            anticipated_response: None,
            encrypted: false,
        }
    }

    pub(crate) const fn command(&self) -> &Command {
        &self.command
    }

    pub(crate) const fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// Serialize the command, encrypting it when the session requires it
    pub(crate) fn finalize(&mut self, ctx: &mut CommandContext<'_>, table: &StatusTable) -> Result<()> {
        let mut apdu = self.command.to_bytes()?;

        if ctx.is_encryption_active() && self.kind.is_encryptable() {
            if let Some(encrypted) = ctx.crypto()?.update_session_authenticator(&apdu)? {
                apdu = encrypted;
            }
            self.encrypted = true;
        }

        trace!(command = self.kind.name(), apdu = %hex::encode(&apdu), "Request finalized");
        self.request = Some(
            ApduRequest::new(apdu, self.kind.name())
                .with_successful_status_words(table.successful_status_words()),
        );
        Ok(())
    }

    /// Feed the request and its anticipated response to the authenticator
    ///
    /// Only possible while every previous exchange has been fed and the
    /// exchange is not encrypted. Returns whether it was done.
    pub(crate) fn anticipate(&mut self, ctx: &mut CommandContext<'_>, response: Bytes) -> Result<bool> {
        if !ctx.is_crypto_synchronized() || self.encrypted {
            return Ok(false);
        }
        let request = self
            .request
            .as_ref()
            .ok_or(Error::illegal_state("command request not finalized"))?
            .apdu
            .clone();

        let crypto = ctx.crypto()?;
        crypto.update_session_authenticator(&request)?;
        crypto.update_session_authenticator(&response)?;
        trace!(command = self.kind.name(), response = %hex::encode(&response), "Anticipated response");
        self.anticipated_response = Some(response);
        Ok(true)
    }

    /// Whether the response was anticipated
    pub(crate) const fn is_anticipated(&self) -> bool {
        self.anticipated_response.is_some()
    }

    /// Authenticate, decode and check a response
    pub(crate) fn process_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        raw: Bytes,
        table: &StatusTable,
    ) -> Result<Response> {
        let raw = if self.encrypted {
            ctx.crypto()?.update_session_authenticator(&raw)?.unwrap_or(raw)
        } else if self.anticipated_response.is_some() {
            raw
        } else if ctx.in_session() {
            let request = self.apdu_bytes()?;
            let crypto = ctx.crypto()?;
            crypto.update_session_authenticator(&request)?;
            crypto.update_session_authenticator(&raw)?;
            raw
        } else {
            raw
        };

        let response = Response::from_bytes(&raw)?;
        table.check(self.kind, response.status())?;

        if let Some(anticipated) = &self.anticipated_response {
            if anticipated != &raw {
                return Err(SecurityError::AnticipatedResponseMismatch(self.kind).into());
            }
        }
        Ok(response)
    }

    fn apdu_bytes(&self) -> Result<Bytes> {
        self.request
            .as_ref()
            .map(|r| r.apdu.clone())
            .ok_or(Error::illegal_state("command request not finalized"))
    }
}

/// `DataOut || 90 00`
pub(crate) fn success_response(data: &[u8]) -> Bytes {
    let mut response = Vec::with_capacity(data.len() + 2);
    response.extend_from_slice(data);
    response.extend_from_slice(&[0x90, 0x00]);
    response.into()
}

/// Reject responses whose payload length differs from what the command requires
pub(crate) const fn check_length(kind: CommandKind, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::UnexpectedResponseLength {
            command: kind,
            expected,
            actual,
        })
    }
}

/// Validate a short file identifier
pub(crate) const fn check_sfi(sfi: u8) -> Result<()> {
    if sfi > 30 {
        Err(Error::illegal_argument("SFI must be in [0..30]"))
    } else {
        Ok(())
    }
}

/// Validate a record number
pub(crate) const fn check_record_number(record: u8) -> Result<()> {
    if record == 0 {
        Err(Error::illegal_argument("record number must be in [1..255]"))
    } else {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response() {
        assert_eq!(success_response(&[0xAB]).as_ref(), &[0xAB, 0x90, 0x00]);
    }

    #[test]
    fn test_argument_checks() {
        assert!(check_sfi(30).is_ok());
        assert!(check_sfi(31).is_err());
        assert!(check_record_number(0).is_err());
        assert!(check_length(CommandKind::Increase, 3, 3).is_ok());
        assert_eq!(
            check_length(CommandKind::Increase, 3, 2),
            Err(Error::UnexpectedResponseLength {
                command: CommandKind::Increase,
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_only_data_commands_are_encryptable() {
        assert!(CommandKind::ReadRecords.is_encryptable());
        assert!(CommandKind::SvDebit.is_encryptable());
        assert!(!CommandKind::CloseSecureSession.is_encryptable());
    }
}
