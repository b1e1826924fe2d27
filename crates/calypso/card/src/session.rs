//! Secure session state

use bytes::Bytes;
use zeroize::Zeroize;

use crate::card::{BufferUnit, CardRuntime};
use crate::constants::SESSION_BUFFER_COMMAND_OVERHEAD;
use crate::settings::{KeyReference, WriteAccessLevel};

/// Phase of the secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SessionPhase {
    /// No session
    #[display("closed")]
    Closed,
    /// Open Secure Session queued, not yet answered
    #[display("opening")]
    Opening,
    /// Session open on the card
    #[display("open")]
    Open,
    /// Close Secure Session queued, not yet answered
    #[display("closing")]
    Closing,
    /// Abort queued, not yet answered
    #[display("aborting")]
    Aborting,
}

/// Challenges exchanged at open
#[derive(Debug, Clone, Default, Zeroize)]
#[zeroize(drop)]
pub(crate) struct Challenges {
    pub(crate) terminal: Vec<u8>,
    pub(crate) card: Vec<u8>,
}

/// State of the session in progress
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) phase: SessionPhase,
    /// The Open Secure Session was sent to the card
    pub(crate) exchanged: bool,
    pub(crate) write_access_level: WriteAccessLevel,
    pub(crate) pki: bool,
    pub(crate) extended: bool,
    pub(crate) key: Option<KeyReference>,
    pub(crate) challenges: Challenges,
    pub(crate) previous_session_ratified: Option<bool>,
    pub(crate) manage_session_authorized: bool,
    pub(crate) encryption_active: bool,
    /// Every exchange so far has been fed to the authenticator
    pub(crate) crypto_synchronized: bool,
    pub(crate) buffer_used: usize,
    /// An SV operation was done; the close response must carry its MAC
    pub(crate) sv_postponed: bool,
}

impl SessionState {
    pub(crate) fn new(write_access_level: WriteAccessLevel, pki: bool, extended: bool) -> Self {
        Self {
            phase: SessionPhase::Opening,
            exchanged: false,
            write_access_level,
            pki,
            extended: extended || pki,
            key: None,
            challenges: Challenges::default(),
            previous_session_ratified: None,
            manage_session_authorized: false,
            encryption_active: false,
            crypto_synchronized: false,
            buffer_used: 0,
            sv_postponed: false,
        }
    }

    pub(crate) fn set_terminal_challenge(&mut self, challenge: &Bytes) {
        self.challenges.terminal = challenge.to_vec();
    }

    /// Whether the session accepts card commands
    pub(crate) const fn is_active(&self) -> bool {
        matches!(self.phase, SessionPhase::Opening | SessionPhase::Open)
    }

    /// Whether the session is over on the card side
    pub(crate) const fn is_terminated(&self) -> bool {
        matches!(self.phase, SessionPhase::Closed)
    }
}

/// Units of the modification buffer a command consumes
pub(crate) const fn buffer_cost(runtime: &CardRuntime, data_length: usize) -> usize {
    match runtime.buffer_unit {
        BufferUnit::Bytes => data_length + SESSION_BUFFER_COMMAND_OVERHEAD,
        BufferUnit::Operations => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_cost() {
        let runtime = CardRuntime::default().with_session_buffer(48, BufferUnit::Bytes);
        assert_eq!(buffer_cost(&runtime, 30), 36);

        let runtime = runtime.with_session_buffer(3, BufferUnit::Operations);
        assert_eq!(buffer_cost(&runtime, 30), 1);
    }

    #[test]
    fn test_pki_sessions_use_extended_lengths() {
        let state = SessionState::new(WriteAccessLevel::Debit, true, false);
        assert!(state.extended);
        assert!(state.is_active());
        assert!(!state.is_terminated());
    }
}
