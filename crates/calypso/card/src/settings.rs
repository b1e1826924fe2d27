//! Security settings of a secure transaction

use std::collections::HashMap;

use crate::constants::KIF_UNDEFINED;
use crate::error::SecurityError;

/// Write access level of a secure session, selecting the session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum WriteAccessLevel {
    /// Personalization key (key index 1)
    #[display("personalization")]
    Personalization,
    /// Load key (key index 2)
    #[display("load")]
    Load,
    /// Debit key (key index 3)
    #[display("debit")]
    Debit,
}

impl WriteAccessLevel {
    /// Key index sent in the Open Secure Session P1 byte
    pub const fn key_index(self) -> u8 {
        match self {
            Self::Personalization => 0x01,
            Self::Load => 0x02,
            Self::Debit => 0x03,
        }
    }
}

/// A symmetric key designated by its identifier and version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyReference {
    /// Key identifier
    pub kif: u8,
    /// Key version and category
    pub kvc: u8,
}

impl KeyReference {
    /// Create a key reference
    pub const fn new(kif: u8, kvc: u8) -> Self {
        Self { kif, kvc }
    }
}

/// Security setting of a secure transaction
///
/// Holds the key resolution tables and the behaviour of the session
/// engine (multiple sessions, ratification, SV rules).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecuritySetting {
    default_kifs: HashMap<WriteAccessLevel, u8>,
    default_kvcs: HashMap<WriteAccessLevel, u8>,
    kifs_by_kvc: HashMap<(WriteAccessLevel, u8), u8>,
    authorized_session_keys: Vec<KeyReference>,
    authorized_sv_keys: Vec<KeyReference>,
    /// Split the transaction over several sessions when the modification
    /// buffer is full, instead of failing
    pub multiple_session: bool,
    /// Let a contactless card ratify the session on its own when closing
    pub ratification_mechanism: bool,
    /// Allow SV debits leaving a negative balance
    pub sv_negative_balance: bool,
}

impl SecuritySetting {
    /// Default KIF of a level, used when neither the card nor the KVC map gives one
    pub fn with_default_kif(mut self, level: WriteAccessLevel, kif: u8) -> Self {
        self.default_kifs.insert(level, kif);
        self
    }

    /// Default KVC of a level, used when the card does not report one
    pub fn with_default_kvc(mut self, level: WriteAccessLevel, kvc: u8) -> Self {
        self.default_kvcs.insert(level, kvc);
        self
    }

    /// KIF to use at `level` when the card reports `kvc`
    pub fn with_kif(mut self, level: WriteAccessLevel, kvc: u8, kif: u8) -> Self {
        self.kifs_by_kvc.insert((level, kvc), kif);
        self
    }

    /// Restrict session keys to an allow-list
    pub fn with_authorized_session_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_session_keys.push(KeyReference::new(kif, kvc));
        self
    }

    /// Restrict SV keys to an allow-list
    pub fn with_authorized_sv_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_sv_keys.push(KeyReference::new(kif, kvc));
        self
    }

    /// Enable the multiple session mode
    pub const fn with_multiple_session(mut self, enabled: bool) -> Self {
        self.multiple_session = enabled;
        self
    }

    /// Enable the ratification mechanism
    pub const fn with_ratification_mechanism(mut self, enabled: bool) -> Self {
        self.ratification_mechanism = enabled;
        self
    }

    /// Allow negative SV balances
    pub const fn with_sv_negative_balance(mut self, enabled: bool) -> Self {
        self.sv_negative_balance = enabled;
        self
    }

    /// Resolve the session key from what the card reported at open
    ///
    /// A key given by the caller wins. Otherwise the KIF is taken, in order,
    /// from the card when it reports one, from the `(level, kvc)` map, then
    /// from the default of the level. The key must then belong to the
    /// allow-list when one is configured.
    pub fn resolve_session_key(
        &self,
        level: WriteAccessLevel,
        explicit: Option<KeyReference>,
        card_kif: Option<u8>,
        card_kvc: Option<u8>,
    ) -> Result<KeyReference, SecurityError> {
        if let Some(key) = explicit {
            return self.check_session_key(key);
        }
        let kvc = card_kvc
            .or_else(|| self.default_kvcs.get(&level).copied())
            .ok_or(SecurityError::UnauthorizedKey {
                kif: card_kif.unwrap_or(KIF_UNDEFINED),
                kvc: 0,
            })?;

        let kif = card_kif
            .filter(|kif| *kif != KIF_UNDEFINED)
            .or_else(|| self.kifs_by_kvc.get(&(level, kvc)).copied())
            .or_else(|| self.default_kifs.get(&level).copied())
            .ok_or(SecurityError::UnauthorizedKey {
                kif: KIF_UNDEFINED,
                kvc,
            })?;

        self.check_session_key(KeyReference::new(kif, kvc))
    }

    /// Whether the session key belongs to the allow-list, when one is configured
    pub fn check_session_key(&self, key: KeyReference) -> Result<KeyReference, SecurityError> {
        if !self.authorized_session_keys.is_empty() && !self.authorized_session_keys.contains(&key) {
            return Err(SecurityError::UnauthorizedKey {
                kif: key.kif,
                kvc: key.kvc,
            });
        }
        Ok(key)
    }

    /// Whether the SV key with this KVC may be used
    pub fn check_sv_key(&self, kvc: u8) -> Result<(), SecurityError> {
        if self.authorized_sv_keys.is_empty() || self.authorized_sv_keys.iter().any(|k| k.kvc == kvc) {
            Ok(())
        } else {
            Err(SecurityError::UnauthorizedKey {
                kif: KIF_UNDEFINED,
                kvc,
            })
        }
    }
}
