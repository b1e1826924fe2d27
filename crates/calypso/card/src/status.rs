//! Status word taxonomy of the Calypso commands
//!
//! Every command owns a table mapping status words to a description, a
//! success flag and, on failure, an error category. Tables are built from a
//! base table shared by all commands, merged with command specific entries.

use std::collections::HashMap;

use calypso_apdu_core::StatusWord;

use crate::commands::CommandKind;
use crate::error::{CardCommandError, CommandErrorKind};

/// What a status word means for a given command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusProperties {
    /// Human readable description
    pub message: &'static str,
    /// Whether the command succeeded
    pub successful: bool,
    /// Error category, `None` on success
    pub error: Option<CommandErrorKind>,
}

impl StatusProperties {
    /// Successful status word
    pub const fn success(message: &'static str) -> Self {
        Self {
            message,
            successful: true,
            error: None,
        }
    }

    /// Failing status word of the given category
    pub const fn failure(message: &'static str, kind: CommandErrorKind) -> Self {
        Self {
            message,
            successful: false,
            error: Some(kind),
        }
    }
}

/// Status word table of one command
#[derive(Debug, Clone, Default)]
pub struct StatusTable {
    entries: HashMap<u16, StatusProperties>,
}

impl StatusTable {
    /// Entries common to every Calypso command
    pub fn base() -> Self {
        Self::default().merge(&[
            (
                0x6700,
                StatusProperties::failure(
                    "Lc value not supported",
                    CommandErrorKind::IllegalParameter,
                ),
            ),
            (
                0x6B00,
                StatusProperties::failure(
                    "Incorrect P1 or P2",
                    CommandErrorKind::IllegalParameter,
                ),
            ),
            (
                0x6D00,
                StatusProperties::failure(
                    "Instruction unknown",
                    CommandErrorKind::IllegalParameter,
                ),
            ),
            (
                0x6E00,
                StatusProperties::failure(
                    "Class not supported",
                    CommandErrorKind::IllegalParameter,
                ),
            ),
            (0x9000, StatusProperties::success("Successful execution")),
        ])
    }

    /// Add or replace entries, returning the merged table
    pub fn merge(mut self, entries: &[(u16, StatusProperties)]) -> Self {
        self.entries.extend(entries.iter().copied());
        self
    }

    /// Look a status word up
    pub fn get(&self, status: StatusWord) -> Option<&StatusProperties> {
        self.entries.get(&status.to_u16())
    }

    /// Whether the status word is listed as successful
    pub fn is_successful(&self, status: StatusWord) -> bool {
        self.get(status).is_some_and(|p| p.successful)
    }

    /// Status words the transport must not stop on
    pub fn successful_status_words(&self) -> Vec<StatusWord> {
        let mut words: Vec<StatusWord> = self
            .entries
            .iter()
            .filter(|(_, p)| p.successful)
            .map(|(sw, _)| StatusWord::from_u16(*sw))
            .collect();
        words.sort();
        words
    }

    /// Map a status word to the command outcome
    pub fn check(&self, command: CommandKind, status: StatusWord) -> Result<(), CardCommandError> {
        match self.get(status) {
            Some(properties) if properties.successful => Ok(()),
            Some(properties) => Err(CardCommandError {
                command,
                status,
                message: properties.message,
                kind: properties.error.unwrap_or(CommandErrorKind::UnknownStatus),
            }),
            None => Err(CardCommandError {
                command,
                status,
                message: "Unknown status",
                kind: CommandErrorKind::UnknownStatus,
            }),
        }
    }
}
