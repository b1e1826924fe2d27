//! Secure session engine
//!
//! Turns the prepared steps of a [`TransactionManager`] into batches of
//! APDUs. Commands are finalized in queue order and accumulate in a batch
//! until one of them needs the authenticator to be up to date, at which
//! point the batch is exchanged and every response parsed positionally.
//!
//! The engine adds the session control commands itself: the Open Secure
//! Session, the Close Secure Session with its optional Ratification, and in
//! multiple session mode the close and reopen needed when the card
//! modification buffer is full.

use bytes::Bytes;
use calypso_apdu_core::{ApduRequest, CardRequest, CardTransport, ChannelControl, TransportError};
use tracing::{debug, warn};

use crate::commands::{
    AbortSecureSession, CardCommand, CloseSecureSession, CommandContext, CommandKind,
    OpenSecureSession, Ratification, ReadOnOpen,
};
use crate::error::{Error, Result};
use crate::session::{SessionState, buffer_cost};
use crate::settings::{KeyReference, WriteAccessLevel};
use crate::transaction::TransactionManager;

/// Close Secure Session without authenticator
const ABORT_APDU: [u8; 5] = [0x00, 0x8E, 0x00, 0x00, 0x00];

/// One prepared operation of a transaction
#[derive(Debug)]
pub(crate) enum Step {
    Command(Box<dyn CardCommand>),
    OpenSession {
        level: WriteAccessLevel,
        read: Option<ReadOnOpen>,
        key: Option<KeyReference>,
    },
    CloseSession {
        ratify: bool,
    },
    CancelSession,
}

/// A finalized command waiting for the exchange
#[derive(Debug)]
struct BatchEntry {
    command: Box<dyn CardCommand>,
    /// Parsed with the session context
    in_session: bool,
}

type Batch = Vec<BatchEntry>;

impl<T: CardTransport> TransactionManager<T> {
    /// Run prepared steps, exchanging as many batches as needed
    pub(crate) fn run(&mut self, steps: Vec<Step>, channel: ChannelControl) -> Result<()> {
        let mut batch = Batch::new();
        self.pending.clear();
        for step in steps {
            match step {
                Step::Command(command) => self.push_command(&mut batch, command)?,
                Step::OpenSession { level, read, key } => self.open_session(&mut batch, level, read, key)?,
                Step::CloseSession { ratify } => self.close_session(&mut batch, ratify)?,
                Step::CancelSession => self.cancel_session(&mut batch)?,
            }
        }

        if batch.is_empty() {
            if channel == ChannelControl::CloseAfter {
                self.transport.release_channel()?;
            }
            return Ok(());
        }
        self.flush(&mut batch, channel)
    }

    fn context(&mut self, in_session: bool) -> CommandContext<'_> {
        CommandContext {
            card: &mut self.card,
            session: if in_session { self.session.as_mut() } else { None },
            crypto: self.crypto.as_mut(),
            setting: &self.setting,
            pending: &mut self.pending,
        }
    }

    fn is_session_active(&self) -> bool {
        self.session.as_ref().is_some_and(SessionState::is_active)
    }

    /// Finalize a command and queue it in the batch
    fn push_command(&mut self, batch: &mut Batch, mut command: Box<dyn CardCommand>) -> Result<()> {
        let in_session = self.is_session_active();
        if in_session {
            if let Some(usage) = command.session_buffer_usage() {
                self.reserve_buffer(batch, usage)?;
            }
        }

        let required = command.is_crypto_required_to_finalize_request(&self.context(in_session));
        let synchronized = if in_session {
            self.session.as_ref().is_some_and(|s| s.crypto_synchronized)
        } else {
            batch.is_empty()
        };
        if required && !synchronized && !batch.is_empty() {
            debug!(command = command.kind().name(), "Exchanging pending commands first");
            self.flush(batch, ChannelControl::KeepOpen)?;
        }

        let mut ctx = self.context(in_session);
        command.finalize_request(&mut ctx)?;
        let synchronized = command.synchronize_crypto_before_card_processing(&mut ctx)?;
        if in_session {
            if let Some(session) = self.session.as_mut() {
                session.crypto_synchronized = synchronized;
            }
        }

        batch.push(BatchEntry { command, in_session });
        Ok(())
    }

    /// Charge a command to the modification buffer of the session
    fn reserve_buffer(&mut self, batch: &mut Batch, data_length: usize) -> Result<()> {
        let runtime = self.card.runtime();
        let cost = buffer_cost(runtime, data_length);
        let capacity = runtime.buffer_capacity;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if session.buffer_used + cost <= capacity {
            session.buffer_used += cost;
            return Ok(());
        }
        if cost > capacity || !self.setting.multiple_session {
            return Err(Error::SessionBufferOverflow {
                required: cost,
                available: capacity.saturating_sub(session.buffer_used),
            });
        }

        // The next session continues with the same key
        let (level, key) = (session.write_access_level, session.key);
        debug!(used = session.buffer_used, cost, capacity, "Modification buffer full, splitting the session");
        self.close_session(batch, true)?;
        self.flush(batch, ChannelControl::KeepOpen)?;
        self.open_session(batch, level, None, key)?;
        if let Some(session) = self.session.as_mut() {
            session.buffer_used = cost;
        }
        Ok(())
    }

    fn open_session(
        &mut self,
        batch: &mut Batch,
        level: WriteAccessLevel,
        read: Option<ReadOnOpen>,
        key: Option<KeyReference>,
    ) -> Result<()> {
        if self.is_session_active() {
            return Err(Error::illegal_state("a secure session is already open"));
        }
        if self.session.is_some() {
            // The previous session ends in the pending batch
            self.flush(batch, ChannelControl::KeepOpen)?;
        }
        let pki = self
            .crypto
            .as_ref()
            .ok_or(Error::illegal_state("secure sessions need a crypto back-end"))?
            .is_pki();
        let runtime = self.card.runtime();
        if pki && !runtime.pki_mode {
            return Err(Error::illegal_state("the card does not support asymmetric sessions"));
        }

        let state = SessionState::new(level, pki, runtime.extended_mode);
        let open = OpenSecureSession::new(level, read, state.extended, pki)?.with_session_key(key);
        debug!(%level, pki, extended = state.extended, "Opening secure session");
        self.session = Some(state);
        self.push_command(batch, Box::new(open))
    }

    fn close_session(&mut self, batch: &mut Batch, ratify: bool) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.is_active())
            .ok_or(Error::illegal_state("no secure session is open"))?;
        let implicit = ratify && self.card.runtime().contactless && self.setting.ratification_mechanism;
        let close = CloseSecureSession::new(implicit, session.pki, session.extended);

        self.push_command(batch, Box::new(close))?;
        if ratify && !implicit {
            self.push_command(batch, Box::new(Ratification::new()))?;
        }
        Ok(())
    }

    fn cancel_session(&mut self, batch: &mut Batch) -> Result<()> {
        if !self.is_session_active() {
            return Err(Error::illegal_state("no secure session is open"));
        }
        self.push_command(batch, Box::new(AbortSecureSession::new()))
    }

    /// Exchange the batch and parse every response
    fn flush(&mut self, batch: &mut Batch, channel: ChannelControl) -> Result<()> {
        let entries = std::mem::take(batch);
        // Parsed responses now carry the effects the batch anticipated
        self.pending.clear();
        let requests = entries
            .iter()
            .map(|e| e.command.apdu_request())
            .collect::<Result<Vec<ApduRequest>>>()?;
        let raw_requests: Vec<Bytes> = requests.iter().map(|r| r.apdu.clone()).collect();
        let stop_on_unsuccessful = entries.iter().any(|e| e.in_session);

        debug!(apdus = requests.len(), stop_on_unsuccessful, "Exchanging command batch");
        let request = CardRequest::new(requests, stop_on_unsuccessful);
        if let Some(session) = self.session.as_mut() {
            session.exchanged = true;
        }
        let (responses, interrupted) = match self.transport.exchange(&request, channel) {
            Ok(response) => (response.apdus, false),
            Err(TransportError::UnexpectedStatus { partial }) => (partial.apdus, true),
            Err(e) => {
                self.audit.record(raw_requests, &[]);
                return Err(e.into());
            }
        };
        self.audit.record(raw_requests, &responses);
        if interrupted && channel == ChannelControl::CloseAfter {
            self.transport.release_channel()?;
        }

        let inconsistent = Error::InconsistentExchangeCount {
            requests: entries.len(),
            responses: responses.len(),
        };
        if responses.len() > entries.len() || (!interrupted && responses.len() != entries.len()) {
            return Err(inconsistent);
        }
        let complete = responses.len() == entries.len();

        for (entry, response) in entries.into_iter().zip(responses) {
            self.parse_entry(entry, response)?;
        }
        if !complete {
            // The status that interrupted the exchange was accepted
            return Err(inconsistent);
        }

        if let Some(session) = self.session.as_mut() {
            if session.is_terminated() {
                debug!("Secure session state released");
                self.session = None;
            } else {
                session.crypto_synchronized = true;
            }
        }
        Ok(())
    }

    fn parse_entry(&mut self, mut entry: BatchEntry, response: Bytes) -> Result<()> {
        let mut ctx = self.context(entry.in_session);
        match entry.command.parse_response(response, &mut ctx) {
            Err(e) if entry.command.is_best_effort() && !entry.in_session && e.is_missing_data() => {
                warn!(command = entry.command.kind().name(), error = %e, "Data not found, ignored");
                Ok(())
            }
            result => result,
        }
    }

    /// Cancel the session on the card and restore the card image
    ///
    /// Nothing is sent when the Open Secure Session never left the terminal.
    /// Failures of the abort itself are logged and ignored.
    pub(crate) fn abort_session(&mut self) {
        self.pending.clear();
        let Some(session) = self.session.take() else {
            return;
        };
        if !session.exchanged {
            debug!("Secure session never reached the card, dropped");
            self.card.rollback();
            return;
        }
        warn!("Aborting the secure session");

        let request = CardRequest::new(
            vec![ApduRequest::new(
                Bytes::from_static(&ABORT_APDU),
                CommandKind::AbortSecureSession.name(),
            )],
            false,
        );
        match self.transport.exchange(&request, ChannelControl::KeepOpen) {
            Ok(response) => self.audit.record([Bytes::from_static(&ABORT_APDU)], &response.apdus),
            Err(e) => {
                self.audit.record([Bytes::from_static(&ABORT_APDU)], &[]);
                warn!(error = %e, "Session abort failed");
            }
        }
        self.card.rollback();
    }
}
