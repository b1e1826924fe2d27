//! Card content expected once the pending batch is processed

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;

use super::{CalypsoCard, FileData, FileType};

/// Effects of the commands queued in the current batch
///
/// The card image only reflects parsed responses. Anticipated responses are
/// computed against this view instead, so a read following a write of the
/// same data in one batch predicts the written content.
#[derive(Debug, Default)]
pub(crate) struct PendingContent {
    files: BTreeMap<u8, FileData>,
}

impl PendingContent {
    /// Drop every pending effect, once the batch is parsed or abandoned
    pub(crate) fn clear(&mut self) {
        self.files.clear();
    }

    fn data<'a>(&'a self, card: &'a CalypsoCard, sfi: u8) -> Option<&'a FileData> {
        self.files
            .get(&sfi)
            .or_else(|| card.file_by_sfi(sfi).map(|f| &f.data))
    }

    /// Whole record, when every byte is known
    pub(crate) fn record(&self, card: &CalypsoCard, sfi: u8, record: u16) -> Option<Bytes> {
        self.data(card, sfi)?.known_content(record).cloned()
    }

    /// Part of a binary file, when every byte is known
    pub(crate) fn binary(&self, card: &CalypsoCard, sfi: u8, range: Range<usize>) -> Option<Bytes> {
        self.data(card, sfi)?
            .known_bytes(1, range)
            .map(Bytes::copy_from_slice)
    }

    /// Counter value, when known
    pub(crate) fn counter(&self, card: &CalypsoCard, sfi: u8, counter: u8) -> Option<u32> {
        self.data(card, sfi)?.counter(file_type(card, sfi), counter)
    }

    /// Apply the effect of a queued command to the content of a file
    pub(crate) fn update(&mut self, card: &CalypsoCard, sfi: u8, effect: impl FnOnce(&mut FileData, FileType)) {
        let data = self
            .files
            .entry(sfi)
            .or_insert_with(|| card.file_by_sfi(sfi).map(|f| f.data.clone()).unwrap_or_default());
        effect(data, file_type(card, sfi));
    }
}

fn file_type(card: &CalypsoCard, sfi: u8) -> FileType {
    card.file_by_sfi(sfi).map(|f| f.file_type()).unwrap_or_default()
}
