//! Terminal-side image of a Calypso card
//!
//! The image holds what the terminal knows about the card: runtime
//! properties taken from the selection, file descriptors and every piece of
//! file content read or written during the transaction. It is the only state
//! shared between commands; a secure session takes a snapshot of it when it
//! opens and restores that snapshot when it is aborted.

mod file;
mod pending;
mod sv;

use bytes::Bytes;
use tracing::debug;

pub use file::{DirectoryHeader, ElementaryFile, FileData, FileHeader, FileType};
pub use sv::{SvData, SvDebitLog, SvLoadLog, SvLog, SvOperation};
pub(crate) use pending::PendingContent;
pub(crate) use sv::i24_bytes;

use crate::settings::WriteAccessLevel;

/// Unit the card uses to count its modification buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUnit {
    /// Bytes, each command costs its data length plus a fixed overhead
    Bytes,
    /// Operations, each command costs one
    Operations,
}

/// Runtime properties of the card, established at selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRuntime {
    /// Card serial number
    pub serial_number: Bytes,
    /// Whether the card supports the extended mode (8 byte challenges and MACs)
    pub extended_mode: bool,
    /// Whether the card is communicating over a contactless interface
    pub contactless: bool,
    /// Whether the card accepts asymmetric (PKI) sessions
    pub pki_mode: bool,
    /// Capacity of the modification buffer
    pub buffer_capacity: usize,
    /// Unit of the modification buffer
    pub buffer_unit: BufferUnit,
}

impl Default for CardRuntime {
    fn default() -> Self {
        Self {
            serial_number: Bytes::new(),
            extended_mode: false,
            contactless: true,
            pki_mode: false,
            buffer_capacity: 215,
            buffer_unit: BufferUnit::Bytes,
        }
    }
}

impl CardRuntime {
    /// Set the serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<Bytes>) -> Self {
        self.serial_number = serial_number.into();
        self
    }

    /// Enable or disable the extended mode
    pub const fn with_extended_mode(mut self, extended_mode: bool) -> Self {
        self.extended_mode = extended_mode;
        self
    }

    /// Set the communication interface
    pub const fn with_contactless(mut self, contactless: bool) -> Self {
        self.contactless = contactless;
        self
    }

    /// Enable or disable asymmetric sessions
    pub const fn with_pki_mode(mut self, pki_mode: bool) -> Self {
        self.pki_mode = pki_mode;
        self
    }

    /// Set the modification buffer capacity and unit
    pub const fn with_session_buffer(mut self, capacity: usize, unit: BufferUnit) -> Self {
        self.buffer_capacity = capacity;
        self.buffer_unit = unit;
        self
    }
}

/// Open Secure Session output obtained before the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreOpenData {
    /// Level the data was obtained for
    pub write_access_level: WriteAccessLevel,
    /// Open Secure Session response payload
    pub data_out: Bytes,
}

/// Content restored by an abort
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CardContent {
    files: Vec<ElementaryFile>,
    sv: Option<SvData>,
    /// SV data not yet used by an SV operation
    sv_unused: bool,
}

/// What the terminal knows about the card
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalypsoCard {
    runtime: CardRuntime,
    directory: Option<DirectoryHeader>,
    content: CardContent,
    snapshot: Option<Box<CardContent>>,
    pre_open: Option<PreOpenData>,
    card_certificate: Option<Bytes>,
    ca_certificate: Option<Bytes>,
    transaction_counter: Option<u32>,
    df_ratified: Option<bool>,
}

impl CalypsoCard {
    /// Create an empty image with the given runtime properties
    pub fn new(runtime: CardRuntime) -> Self {
        Self {
            runtime,
            ..Default::default()
        }
    }

    /// Runtime properties
    pub const fn runtime(&self) -> &CardRuntime {
        &self.runtime
    }

    /// Current DF descriptor
    pub const fn directory_header(&self) -> Option<&DirectoryHeader> {
        self.directory.as_ref()
    }

    /// Set the current DF descriptor
    pub const fn set_directory_header(&mut self, header: DirectoryHeader) {
        self.directory = Some(header);
    }

    /// All known files
    pub fn files(&self) -> &[ElementaryFile] {
        &self.content.files
    }

    /// File by long identifier
    pub fn file(&self, lid: u16) -> Option<&ElementaryFile> {
        self.content.files.iter().find(|f| f.lid() == Some(lid))
    }

    /// File by short identifier
    pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.content.files.iter().find(|f| f.sfi == sfi)
    }

    /// Record of the file with the given long identifier
    pub fn record(&self, lid: u16, record: u16) -> Option<&Bytes> {
        self.file(lid)?.data.content(record)
    }

    /// Record of the file with the given short identifier
    pub fn record_by_sfi(&self, sfi: u8, record: u16) -> Option<&Bytes> {
        self.file_by_sfi(sfi)?.data.content(record)
    }

    /// Counter value of the file with the given short identifier
    pub fn counter(&self, sfi: u8, counter: u8) -> Option<u32> {
        let file = self.file_by_sfi(sfi)?;
        file.data.counter(file.file_type(), counter)
    }

    /// Register a file descriptor
    pub fn set_file_header(&mut self, sfi: u8, header: FileHeader) {
        self.file_mut(sfi).header = Some(header);
    }

    /// Replace a whole record
    pub fn set_record(&mut self, sfi: u8, record: u16, data: Bytes) {
        self.file_mut(sfi).data.set_content(record, data);
    }

    /// Overwrite part of a record starting at `offset`
    pub fn set_record_at(&mut self, sfi: u8, record: u16, data: &[u8], offset: usize) {
        self.file_mut(sfi).data.set_content_at(record, data, offset);
    }

    /// OR `data` into a record starting at `offset`
    pub fn merge_record_bits(&mut self, sfi: u8, record: u16, data: &[u8], offset: usize) {
        self.file_mut(sfi).data.merge_content(record, data, offset);
    }

    /// Insert a new most recent record in a cyclic file
    pub fn shift_cyclic_and_insert(&mut self, sfi: u8, data: Bytes) {
        self.file_mut(sfi).data.add_cyclic_content(data);
    }

    /// Store a counter value
    pub fn set_counter(&mut self, sfi: u8, counter: u8, value: u32) {
        let file = self.file_mut(sfi);
        let file_type = file.file_type();
        file.data.set_counter(file_type, counter, value);
    }

    /// SV state from the last SV Get
    pub const fn sv_data(&self) -> Option<&SvData> {
        self.content.sv.as_ref()
    }

    pub(crate) fn set_sv_data(&mut self, data: SvData) {
        self.content.sv = Some(data);
        self.content.sv_unused = true;
    }

    /// SV data for an SV operation, each SV Get serves a single one
    pub(crate) fn consume_sv_data(&mut self) -> Option<SvData> {
        if !self.content.sv_unused {
            return None;
        }
        self.content.sv_unused = false;
        self.content.sv.clone()
    }

    pub(crate) const fn sv_data_mut(&mut self) -> Option<&mut SvData> {
        self.content.sv.as_mut()
    }

    /// Provide the Open Secure Session output obtained during the selection
    ///
    /// The next session opened at `level` initializes its authenticator
    /// from this data before the card answers, and fails if the real
    /// response differs.
    pub fn set_pre_open_data(&mut self, level: WriteAccessLevel, data_out: impl Into<Bytes>) {
        self.pre_open = Some(PreOpenData {
            write_access_level: level,
            data_out: data_out.into(),
        });
    }

    /// Take the pre-open data if it was obtained for `level`
    pub(crate) fn take_pre_open_data(&mut self, level: WriteAccessLevel) -> Option<Bytes> {
        match self.pre_open.take() {
            Some(data) if data.write_access_level == level => Some(data.data_out),
            _ => None,
        }
    }

    /// Provide the certificates read from the card for asymmetric sessions
    pub fn set_certificates(&mut self, card_certificate: impl Into<Bytes>, ca_certificate: impl Into<Bytes>) {
        self.card_certificate = Some(card_certificate.into());
        self.ca_certificate = Some(ca_certificate.into());
    }

    /// Card certificate
    pub const fn card_certificate(&self) -> Option<&Bytes> {
        self.card_certificate.as_ref()
    }

    /// CA certificate
    pub const fn ca_certificate(&self) -> Option<&Bytes> {
        self.ca_certificate.as_ref()
    }

    /// Transaction counter reported by the last Open Secure Session
    pub const fn transaction_counter(&self) -> Option<u32> {
        self.transaction_counter
    }

    /// Whether the previous session was ratified, as reported by the last open
    pub const fn is_df_ratified(&self) -> Option<bool> {
        self.df_ratified
    }

    pub(crate) const fn set_open_session_info(&mut self, transaction_counter: u32, ratified: bool) {
        self.transaction_counter = Some(transaction_counter);
        self.df_ratified = Some(ratified);
    }

    /// Save the file content, restored by [`CalypsoCard::rollback`]
    pub(crate) fn take_snapshot(&mut self) {
        debug!(files = self.content.files.len(), "Taking card image snapshot");
        self.snapshot = Some(Box::new(self.content.clone()));
    }

    /// Restore the content saved when the session opened
    pub(crate) fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug!("Restoring card image snapshot");
            self.content = *snapshot;
        }
    }

    /// Forget the snapshot once the session is committed
    pub(crate) fn discard_snapshot(&mut self) {
        self.snapshot = None;
    }

    fn file_mut(&mut self, sfi: u8) -> &mut ElementaryFile {
        let index = match self.content.files.iter().position(|f| f.sfi == sfi) {
            Some(index) => index,
            None => {
                self.content.files.push(ElementaryFile::new(sfi));
                self.content.files.len() - 1
            }
        };
        &mut self.content.files[index]
    }
}
