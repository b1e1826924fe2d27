//! Transaction manager
//!
//! The public sequencer of a card transaction. Operations are prepared on
//! the manager, then [`TransactionManager::process_commands`] sends them in
//! as few exchanges as the secure session allows.
//!
//! ```ignore
//! let mut transaction = TransactionManager::secure(transport, card, sam, setting);
//! transaction
//!     .prepare_open_secure_session(WriteAccessLevel::Debit, Some((0x07, 1)))?
//!     .prepare_update_record(0x07, 1, data)?
//!     .prepare_close_secure_session(true)?;
//! transaction.process_commands(ChannelControl::CloseAfter)?;
//! ```

use bytes::Bytes;
use calypso_apdu_core::{CardTransport, ChannelControl};
use tracing::debug;

use crate::audit::AuditTrail;
use crate::card::{CalypsoCard, PendingContent, SvOperation};
use crate::commands::{
    AppendRecord, BinaryWriteMode, CardCommand, CounterOperation, ManageSecureSession, ModifyCounter,
    ReadBinary, ReadMode, ReadOnOpen, ReadRecords, RecordWriteMode, SvCommand, SvGet, SvModification,
    UpdateBinary, UpdateRecord, check_record_number, check_sfi,
};
use crate::crypto::CryptoBackend;
use crate::engine::Step;
use crate::error::{Error, Result, TransactionError};
use crate::session::{SessionPhase, SessionState};
use crate::settings::{KeyReference, SecuritySetting, WriteAccessLevel};

/// Prepares card operations and drives their exchange
///
/// A free manager only exchanges plain commands. A secure manager also owns
/// a crypto back-end and runs secure sessions; a session may span several
/// calls to [`TransactionManager::process_commands`].
#[derive(Debug)]
pub struct TransactionManager<T> {
    pub(crate) transport: T,
    pub(crate) card: CalypsoCard,
    pub(crate) crypto: Option<CryptoBackend>,
    pub(crate) setting: SecuritySetting,
    pub(crate) session: Option<SessionState>,
    pub(crate) audit: AuditTrail,
    pub(crate) pending: PendingContent,
    queue: Vec<Step>,
}

impl<T: CardTransport> TransactionManager<T> {
    /// Manager without secure session support
    pub fn free(transport: T, card: CalypsoCard) -> Self {
        Self {
            transport,
            card,
            crypto: None,
            setting: SecuritySetting::default(),
            session: None,
            audit: AuditTrail::default(),
            pending: PendingContent::default(),
            queue: Vec::new(),
        }
    }

    /// Manager running secure sessions with `crypto`
    pub fn secure(
        transport: T,
        card: CalypsoCard,
        crypto: impl Into<CryptoBackend>,
        setting: SecuritySetting,
    ) -> Self {
        Self {
            crypto: Some(crypto.into()),
            setting,
            ..Self::free(transport, card)
        }
    }

    /// Card image
    pub const fn card(&self) -> &CalypsoCard {
        &self.card
    }

    /// Give the card image back
    pub fn into_card(self) -> CalypsoCard {
        self.card
    }

    /// Transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Exchanges done so far
    pub const fn audit_trail(&self) -> &AuditTrail {
        &self.audit
    }

    /// Security setting
    pub const fn setting(&self) -> &SecuritySetting {
        &self.setting
    }

    /// Phase of the session, [`SessionPhase::Closed`] when none is open
    pub fn session_phase(&self) -> SessionPhase {
        self.session.as_ref().map_or(SessionPhase::Closed, |s| s.phase)
    }

    /// Whether prepared operations are waiting for [`TransactionManager::process_commands`]
    pub fn has_pending_operations(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Open a secure session, optionally reading a record in the same exchange
    pub fn prepare_open_secure_session(
        &mut self,
        level: WriteAccessLevel,
        read: Option<(u8, u8)>,
    ) -> Result<&mut Self> {
        self.queue_open(level, read, None)
    }

    /// Open a secure session with a session key chosen by the caller
    ///
    /// The key replaces the one the card reports and the configured
    /// mappings. It must still belong to the session key allow-list.
    pub fn prepare_open_secure_session_with_key(
        &mut self,
        level: WriteAccessLevel,
        read: Option<(u8, u8)>,
        key: KeyReference,
    ) -> Result<&mut Self> {
        self.queue_open(level, read, Some(key))
    }

    fn queue_open(
        &mut self,
        level: WriteAccessLevel,
        read: Option<(u8, u8)>,
        key: Option<KeyReference>,
    ) -> Result<&mut Self> {
        self.require_crypto()?;
        if self.session_expected() {
            return Err(Error::illegal_state("a secure session is already open"));
        }
        let read = match read {
            Some((sfi, record)) => {
                check_sfi(sfi)?;
                check_record_number(record)?;
                Some(ReadOnOpen { sfi, record })
            }
            None => None,
        };
        self.queue.push(Step::OpenSession { level, read, key });
        Ok(self)
    }

    /// Close the secure session
    ///
    /// With `ratify`, the session is ratified when closing: implicitly by a
    /// contactless card when the ratification mechanism is enabled, by an
    /// explicit Ratification command otherwise.
    pub fn prepare_close_secure_session(&mut self, ratify: bool) -> Result<&mut Self> {
        self.require_session()?;
        self.queue.push(Step::CloseSession { ratify });
        Ok(self)
    }

    /// Cancel the secure session, the card discards its modifications
    pub fn prepare_cancel_secure_session(&mut self) -> Result<&mut Self> {
        self.require_session()?;
        self.queue.push(Step::CancelSession);
        Ok(self)
    }

    /// Encrypt the following exchanges of the session
    pub fn prepare_activate_encryption(&mut self) -> Result<&mut Self> {
        self.prepare_manage_session(true)
    }

    /// Stop encrypting the exchanges of the session
    pub fn prepare_deactivate_encryption(&mut self) -> Result<&mut Self> {
        self.prepare_manage_session(false)
    }

    fn prepare_manage_session(&mut self, encryption: bool) -> Result<&mut Self> {
        self.require_session()?;
        if self.crypto.as_ref().is_some_and(CryptoBackend::is_pki) {
            return Err(Error::illegal_state(
                "encryption is not available in asymmetric sessions",
            ));
        }
        self.push(ManageSecureSession::new(encryption))
    }

    /// Read one record
    pub fn prepare_read_record(&mut self, sfi: u8, record: u8) -> Result<&mut Self> {
        self.push(ReadRecords::new(sfi, record, ReadMode::OneRecord, 0)?)
    }

    /// Read records from `first_record`, as many as fit in `expected_length` bytes
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        first_record: u8,
        expected_length: u8,
    ) -> Result<&mut Self> {
        self.push(ReadRecords::new(
            sfi,
            first_record,
            ReadMode::MultipleRecords,
            expected_length,
        )?)
    }

    /// Read `length` bytes of a binary file
    pub fn prepare_read_binary(&mut self, sfi: u8, offset: u16, length: u8) -> Result<&mut Self> {
        self.push(ReadBinary::new(sfi, offset, length)?)
    }

    /// Replace a record
    pub fn prepare_update_record(&mut self, sfi: u8, record: u8, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.push(UpdateRecord::new(RecordWriteMode::Update, sfi, record, data.into())?)
    }

    /// OR data into a record
    pub fn prepare_write_record(&mut self, sfi: u8, record: u8, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.push(UpdateRecord::new(RecordWriteMode::Write, sfi, record, data.into())?)
    }

    /// Add a record to a cyclic file
    pub fn prepare_append_record(&mut self, sfi: u8, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.push(AppendRecord::new(sfi, data.into())?)
    }

    /// Replace bytes of a binary file
    pub fn prepare_update_binary(&mut self, sfi: u8, offset: u16, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.push(UpdateBinary::new(BinaryWriteMode::Update, sfi, offset, data.into())?)
    }

    /// OR data into a binary file
    pub fn prepare_write_binary(&mut self, sfi: u8, offset: u16, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.push(UpdateBinary::new(BinaryWriteMode::Write, sfi, offset, data.into())?)
    }

    /// Increase a counter
    pub fn prepare_increase_counter(&mut self, sfi: u8, counter: u8, value: u32) -> Result<&mut Self> {
        self.push(ModifyCounter::new(CounterOperation::Increase, sfi, counter, value)?)
    }

    /// Decrease a counter
    pub fn prepare_decrease_counter(&mut self, sfi: u8, counter: u8, value: u32) -> Result<&mut Self> {
        self.push(ModifyCounter::new(CounterOperation::Decrease, sfi, counter, value)?)
    }

    /// Read the SV state before a reload or a debit
    pub fn prepare_sv_get(&mut self, operation: SvOperation) -> Result<&mut Self> {
        self.require_crypto()?;
        self.push(SvGet::new(operation))
    }

    /// Reload the SV balance by `amount`, which may be negative
    pub fn prepare_sv_reload(
        &mut self,
        amount: i32,
        date: u16,
        time: u16,
        free: [u8; 2],
    ) -> Result<&mut Self> {
        self.prepare_sv(SvModification::Reload { amount, free }, date, time)
    }

    /// Debit the SV balance
    pub fn prepare_sv_debit(&mut self, amount: i32, date: u16, time: u16) -> Result<&mut Self> {
        self.prepare_sv(SvModification::Debit { amount }, date, time)
    }

    /// Cancel a previous SV debit
    pub fn prepare_sv_undebit(&mut self, amount: i32, date: u16, time: u16) -> Result<&mut Self> {
        self.prepare_sv(SvModification::Undebit { amount }, date, time)
    }

    fn prepare_sv(&mut self, modification: SvModification, date: u16, time: u16) -> Result<&mut Self> {
        self.require_crypto()?;
        let command = SvCommand::new(modification, date, time)?;
        // Checked again when the command is built, against the SV Get it follows
        if let Some(sv) = self.card.sv_data() {
            if sv.operation() == modification.operation() {
                self.setting.check_sv_key(sv.kvc)?;
            }
        }
        self.push(command)
    }

    /// Exchange every prepared operation with the card
    ///
    /// Any failure while a secure session is open aborts the session on the
    /// card and restores the card image as it was when the session opened.
    /// The returned error carries every exchange done since the manager was
    /// created.
    pub fn process_commands(&mut self, channel: ChannelControl) -> std::result::Result<(), TransactionError> {
        let steps = std::mem::take(&mut self.queue);
        debug!(steps = steps.len(), ?channel, "Processing prepared operations");
        self.run(steps, channel).map_err(|error| {
            self.abort_session();
            TransactionError::new(error, self.audit.clone())
        })
    }

    /// Drop the prepared operations and abort the secure session, if any
    pub fn cancel(&mut self) {
        debug!(dropped = self.queue.len(), "Cancelling the transaction");
        self.queue.clear();
        self.abort_session();
    }

    fn push(&mut self, command: impl CardCommand + 'static) -> Result<&mut Self> {
        self.queue.push(Step::Command(Box::new(command)));
        Ok(self)
    }

    fn require_crypto(&self) -> Result<()> {
        if self.crypto.is_none() {
            return Err(Error::illegal_state("operation needs a secure transaction manager"));
        }
        Ok(())
    }

    fn require_session(&self) -> Result<()> {
        self.require_crypto()?;
        if !self.session_expected() {
            return Err(Error::illegal_state("no secure session is open"));
        }
        Ok(())
    }

    /// Whether a session will be open once the queue is processed
    fn session_expected(&self) -> bool {
        self.queue
            .iter()
            .fold(self.session.as_ref().is_some_and(SessionState::is_active), |open, step| {
                match step {
                    Step::OpenSession { .. } => true,
                    Step::CloseSession { .. } | Step::CancelSession => false,
                    Step::Command(_) => open,
                }
            })
    }
}
