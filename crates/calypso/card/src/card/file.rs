//! Elementary files as known by the terminal

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::constants::{COUNTER_MAX, COUNTER_SIZE};

/// Structure of an elementary file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    /// Transparent file, content stored as record 1
    Binary,
    /// Linear record file
    #[default]
    Linear,
    /// Cyclic record file, record 1 is the most recent
    Cyclic,
    /// Counters packed in record 1, three bytes each
    Counters,
    /// One counter per record
    SimulatedCounters,
}

/// Descriptor of an elementary file, as returned by a Select File
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    /// Long identifier
    pub lid: u16,
    /// File structure
    pub file_type: FileType,
    /// Record size in bytes
    pub record_size: u8,
    /// Number of records
    pub record_count: u8,
    /// Access conditions (read, update, ...)
    pub access_conditions: [u8; 4],
    /// Key indexes associated with the access conditions
    pub key_indexes: [u8; 4],
    /// Identifier of the file sharing its data with this one
    pub shared_reference: Option<u16>,
}

impl FileHeader {
    /// Create a header
    pub const fn new(lid: u16, file_type: FileType, record_size: u8, record_count: u8) -> Self {
        Self {
            lid,
            file_type,
            record_size,
            record_count,
            access_conditions: [0; 4],
            key_indexes: [0; 4],
            shared_reference: None,
        }
    }

    /// Set the access conditions and their key indexes
    pub const fn with_access(mut self, access_conditions: [u8; 4], key_indexes: [u8; 4]) -> Self {
        self.access_conditions = access_conditions;
        self.key_indexes = key_indexes;
        self
    }
}

/// Descriptor of the current DF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryHeader {
    /// Long identifier
    pub lid: u16,
    /// Access conditions
    pub access_conditions: [u8; 4],
    /// Key indexes associated with the access conditions
    pub key_indexes: [u8; 4],
    /// KIF of the three session keys (personalization, load, debit)
    pub kifs: [u8; 3],
    /// KVC of the three session keys
    pub kvcs: [u8; 3],
    /// Whether the DF is invalidated
    pub invalidated: bool,
}

/// Content of a record and the byte ranges the terminal actually knows
///
/// Bytes outside the known ranges are zero padding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Record {
    content: Bytes,
    /// Sorted, disjoint and non adjacent
    known: Vec<Range<usize>>,
}

impl Record {
    fn fully_known(content: Bytes) -> Self {
        let known = if content.is_empty() {
            Vec::new()
        } else {
            vec![0..content.len()]
        };
        Self { content, known }
    }

    fn is_known(&self, range: &Range<usize>) -> bool {
        !range.is_empty()
            && range.end <= self.content.len()
            && self
                .known
                .iter()
                .any(|k| k.start <= range.start && range.end <= k.end)
    }

    fn mark_known(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.known.retain(|k| {
            if k.start <= merged.end && merged.start <= k.end {
                merged = merged.start.min(k.start)..merged.end.max(k.end);
                false
            } else {
                true
            }
        });
        let at = self.known.partition_point(|k| k.start < merged.start);
        self.known.insert(at, merged);
    }

    fn forget(&mut self, range: Range<usize>) {
        self.known = self
            .known
            .drain(..)
            .flat_map(|k| [k.start..k.end.min(range.start), k.start.max(range.end)..k.end])
            .filter(|k| !k.is_empty())
            .collect();
    }

    /// Copy of the content, zero extended to at least `length` bytes
    fn padded(&self, length: usize) -> BytesMut {
        let mut content = BytesMut::from(self.content.as_ref());
        if content.len() < length {
            content.resize(length, 0);
        }
        content
    }
}

/// Records of a file, numbered from 1
///
/// Record numbers are not capped: inserting in a cyclic file shifts every
/// known record up by one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileData {
    records: BTreeMap<u16, Record>,
}

impl FileData {
    /// Content of a record, unknown bytes read as zeros
    pub fn content(&self, record: u16) -> Option<&Bytes> {
        self.records.get(&record).map(|r| &r.content)
    }

    /// Content of a record when every byte of it is known
    pub fn known_content(&self, record: u16) -> Option<&Bytes> {
        self.records
            .get(&record)
            .filter(|r| r.is_known(&(0..r.content.len())))
            .map(|r| &r.content)
    }

    /// Bytes of a record when every one of them is known
    pub fn known_bytes(&self, record: u16, range: Range<usize>) -> Option<&[u8]> {
        let entry = self.records.get(&record).filter(|r| r.is_known(&range))?;
        entry.content.get(range)
    }

    /// All records, in ascending order
    pub fn records(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.records.iter().map(|(n, r)| (*n, &r.content))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is held
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace a whole record
    pub fn set_content(&mut self, record: u16, data: Bytes) {
        self.records.insert(record, Record::fully_known(data));
    }

    /// Overwrite part of a record starting at `offset`
    ///
    /// Unknown bytes before the offset are filled with zeros and stay unknown.
    pub fn set_content_at(&mut self, record: u16, data: &[u8], offset: usize) {
        let entry = self.records.entry(record).or_default();
        let end = offset + data.len();
        let mut content = entry.padded(end);
        content[offset..end].copy_from_slice(data);
        entry.content = content.freeze();
        entry.mark_known(offset..end);
    }

    /// OR `data` into a record starting at `offset`, as a Write command does
    ///
    /// A byte is known afterwards only if it was known before.
    pub fn merge_content(&mut self, record: u16, data: &[u8], offset: usize) {
        let entry = self.records.entry(record).or_default();
        let mut content = entry.padded(offset + data.len());
        for (target, byte) in content[offset..offset + data.len()].iter_mut().zip(data) {
            *target |= byte;
        }
        entry.content = content.freeze();
    }

    /// Insert a new record 1, shifting the others up by one
    pub fn add_cyclic_content(&mut self, data: Bytes) {
        let shifted = std::mem::take(&mut self.records)
            .into_iter()
            .filter_map(|(n, record)| n.checked_add(1).map(|n| (n, record)))
            .collect();
        self.records = shifted;
        self.records.insert(1, Record::fully_known(data));
    }

    /// Counter value, when known
    pub fn counter(&self, file_type: FileType, counter: u8) -> Option<u32> {
        let (record, offset) = counter_location(file_type, counter);
        let bytes = self.known_bytes(record, offset..offset + COUNTER_SIZE)?;
        Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Store a counter value
    pub fn set_counter(&mut self, file_type: FileType, counter: u8, value: u32) {
        let (record, offset) = counter_location(file_type, counter);
        let value = value.min(COUNTER_MAX).to_be_bytes();
        self.set_content_at(record, &value[1..], offset);
    }

    /// Mark a counter value as unknown
    pub(crate) fn forget_counter(&mut self, file_type: FileType, counter: u8) {
        let (record, offset) = counter_location(file_type, counter);
        if let Some(entry) = self.records.get_mut(&record) {
            entry.forget(offset..offset + COUNTER_SIZE);
        }
    }
}

fn counter_location(file_type: FileType, counter: u8) -> (u16, usize) {
    match file_type {
        FileType::SimulatedCounters => (u16::from(counter), 0),
        _ => (1, usize::from(counter.saturating_sub(1)) * COUNTER_SIZE),
    }
}

/// An elementary file: where it is, what it looks like, what it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryFile {
    /// Short file identifier, 0 when the file has none
    pub sfi: u8,
    /// Descriptor, when the file was selected
    pub header: Option<FileHeader>,
    /// Known content
    pub data: FileData,
}

impl ElementaryFile {
    pub(crate) fn new(sfi: u8) -> Self {
        Self {
            sfi,
            header: None,
            data: FileData::default(),
        }
    }

    /// Long identifier, when the header is known
    pub fn lid(&self) -> Option<u16> {
        self.header.map(|h| h.lid)
    }

    /// File structure, linear when unknown
    pub fn file_type(&self) -> FileType {
        self.header.map(|h| h.file_type).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_set_content_at_pads_with_unknown_zeros() {
        let mut data = FileData::default();
        data.set_content_at(1, &hex!("AABB"), 2);
        assert_eq!(data.content(1).unwrap().as_ref(), hex!("0000AABB"));
        assert_eq!(data.known_bytes(1, 2..4), Some(&hex!("AABB")[..]));
        assert_eq!(data.known_bytes(1, 0..2), None);
        assert_eq!(data.known_content(1), None);

        data.set_content_at(1, &hex!("CC"), 0);
        assert_eq!(data.content(1).unwrap().as_ref(), hex!("CC00AABB"));
        assert_eq!(data.known_bytes(1, 1..3), None);

        data.set_content_at(1, &hex!("DD"), 1);
        assert_eq!(data.known_content(1).unwrap().as_ref(), hex!("CCDDAABB"));
    }

    #[test]
    fn test_merge_content_ors_bits() {
        let mut data = FileData::default();
        data.set_content(1, Bytes::from_static(&hex!("0F00F0")));
        data.merge_content(1, &hex!("F0010F01"), 0);
        assert_eq!(data.content(1).unwrap().as_ref(), hex!("FF01FF01"));
        assert_eq!(data.known_bytes(1, 0..3), Some(&hex!("FF01FF")[..]));
        assert_eq!(data.known_bytes(1, 3..4), None);
    }

    #[test]
    fn test_cyclic_insert_shifts_records() {
        let mut data = FileData::default();
        data.add_cyclic_content(Bytes::from_static(b"first"));
        data.add_cyclic_content(Bytes::from_static(b"second"));
        data.add_cyclic_content(Bytes::from_static(b"third"));

        assert_eq!(data.content(1).unwrap().as_ref(), b"third");
        assert_eq!(data.content(2).unwrap().as_ref(), b"second");
        assert_eq!(data.content(3).unwrap().as_ref(), b"first");
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_counters_layouts() {
        let mut data = FileData::default();
        data.set_counter(FileType::Counters, 2, 0x000102);
        assert_eq!(data.content(1).unwrap().as_ref(), hex!("000000000102"));
        assert_eq!(data.counter(FileType::Counters, 2), Some(0x102));
        assert_eq!(data.counter(FileType::Counters, 1), None);
        assert_eq!(data.counter(FileType::Counters, 3), None);

        data.set_counter(FileType::Counters, 1, 7);
        data.forget_counter(FileType::Counters, 2);
        assert_eq!(data.counter(FileType::Counters, 1), Some(7));
        assert_eq!(data.counter(FileType::Counters, 2), None);

        let mut simulated = FileData::default();
        simulated.set_counter(FileType::SimulatedCounters, 3, 42);
        assert_eq!(simulated.content(3).unwrap().as_ref(), hex!("00002A"));
        assert_eq!(simulated.counter(FileType::SimulatedCounters, 3), Some(42));
    }
}
