use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::record::ByteOrder;

// [ LEN:u8 ][ KIND:u8 ][ TIMESTAMP:u64 ][ FILE_LENGTH:u64 ][ FILE_NUMBER:u64 ] ( [ EXTRA:u64 ] )
pub const BASE_ENTRY_LENGTH: u8 = 26;
pub const EXTENDED_ENTRY_LENGTH: u8 = 34;

const KIND_FILE_CREATION: u8 = 1;
const KIND_STORE: u8 = 2;
const KIND_TRANSFER: u8 = 3;
const KIND_FILE_TRUNCATION: u8 = 4;
const KIND_FILE_DELETION: u8 = 5;

/// Structural event of a channel's file set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEntry {
    FileCreation { timestamp: u64, file_number: u64, file_length: u64 },
    Store { timestamp: u64, file_number: u64, file_length: u64 },
    Transfer { timestamp: u64, file_number: u64, file_length: u64, source_file_number: u64 },
    FileTruncation { timestamp: u64, file_number: u64, file_length: u64, old_length: u64 },
    FileDeletion { timestamp: u64, file_number: u64, file_length: u64 },
}

impl TransactionEntry {
    pub fn timestamp(&self) -> u64 {
        match *self {
            TransactionEntry::FileCreation { timestamp, .. }
            | TransactionEntry::Store { timestamp, .. }
            | TransactionEntry::Transfer { timestamp, .. }
            | TransactionEntry::FileTruncation { timestamp, .. }
            | TransactionEntry::FileDeletion { timestamp, .. } => timestamp,
        }
    }

    pub fn file_number(&self) -> u64 {
        match *self {
            TransactionEntry::FileCreation { file_number, .. }
            | TransactionEntry::Store { file_number, .. }
            | TransactionEntry::Transfer { file_number, .. }
            | TransactionEntry::FileTruncation { file_number, .. }
            | TransactionEntry::FileDeletion { file_number, .. } => file_number,
        }
    }

    pub fn file_length(&self) -> u64 {
        match *self {
            TransactionEntry::FileCreation { file_length, .. }
            | TransactionEntry::Store { file_length, .. }
            | TransactionEntry::Transfer { file_length, .. }
            | TransactionEntry::FileTruncation { file_length, .. }
            | TransactionEntry::FileDeletion { file_length, .. } => file_length,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            TransactionEntry::FileCreation { .. } => KIND_FILE_CREATION,
            TransactionEntry::Store { .. } => KIND_STORE,
            TransactionEntry::Transfer { .. } => KIND_TRANSFER,
            TransactionEntry::FileTruncation { .. } => KIND_FILE_TRUNCATION,
            TransactionEntry::FileDeletion { .. } => KIND_FILE_DELETION,
        }
    }

    fn extra(&self) -> Option<u64> {
        match *self {
            TransactionEntry::Transfer { source_file_number, .. } => Some(source_file_number),
            TransactionEntry::FileTruncation { old_length, .. } => Some(old_length),
            _ => None,
        }
    }

    pub fn encode(&self, order: ByteOrder, out: &mut Vec<u8>) {
        let extra = self.extra();
        let length = if extra.is_some() { EXTENDED_ENTRY_LENGTH } else { BASE_ENTRY_LENGTH };
        out.push(length);
        out.push(self.kind());
        order.put_u64(out, self.timestamp());
        order.put_u64(out, self.file_length());
        order.put_u64(out, self.file_number());
        if let Some(extra) = extra {
            order.put_u64(out, extra);
        }
    }

    /// Decode one entry; returns the entry and its encoded length.
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<(Self, usize)> {
        if bytes.len() < 2 {
            return Err(Error::consistency("truncated transactions entry header"));
        }
        let length = bytes[0] as usize;
        let kind = bytes[1];
        let expected = match kind {
            KIND_TRANSFER | KIND_FILE_TRUNCATION => EXTENDED_ENTRY_LENGTH,
            KIND_FILE_CREATION | KIND_STORE | KIND_FILE_DELETION => BASE_ENTRY_LENGTH,
            other => {
                return Err(Error::consistency(format!("unknown transactions entry kind {}", other)));
            }
        } as usize;
        if length != expected {
            return Err(Error::consistency(format!(
                "transactions entry kind {} has length {}, expected {}", kind, length, expected
            )));
        }
        if bytes.len() < length {
            return Err(Error::consistency(format!(
                "truncated transactions entry: {} of {} bytes", bytes.len(), length
            )));
        }

        let timestamp = order.get_u64(bytes, 2);
        let file_length = order.get_u64(bytes, 10);
        let file_number = order.get_u64(bytes, 18);
        let entry = match kind {
            KIND_FILE_CREATION => TransactionEntry::FileCreation { timestamp, file_number, file_length },
            KIND_STORE => TransactionEntry::Store { timestamp, file_number, file_length },
            KIND_TRANSFER => TransactionEntry::Transfer {
                timestamp, file_number, file_length,
                source_file_number: order.get_u64(bytes, 26),
            },
            KIND_FILE_TRUNCATION => TransactionEntry::FileTruncation {
                timestamp, file_number, file_length,
                old_length: order.get_u64(bytes, 26),
            },
            _ => TransactionEntry::FileDeletion { timestamp, file_number, file_length },
        };
        Ok((entry, length))
    }
}

pub fn decode_entries(bytes: &[u8], order: ByteOrder) -> Result<Vec<TransactionEntry>> {
    let mut entries = Vec::new();
    let mut position = 0;
    while position < bytes.len() {
        let (entry, length) = TransactionEntry::decode(&bytes[position..], order)
            .map_err(|e| Error::new(e.kind, format!("{} (at offset {})", e.context, position)))?;
        entries.push(entry);
        position += length;
    }
    Ok(entries)
}

/// Append-only transactions log of one channel
pub struct TransactionsFile {
    pub file: File,
    pub position: u64,
    pub order: ByteOrder,
}

impl TransactionsFile {
    pub fn open(path: &Path, order: ByteOrder) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let position = file.seek(SeekFrom::End(0))?;

        Ok(TransactionsFile { file, position, order })
    }

    /// Appends entries and returns (offset, bytes) of what was written.
    pub fn append(&mut self, entries: &[TransactionEntry]) -> Result<(u64, Vec<u8>)> {
        let mut bytes = Vec::with_capacity(entries.len() * EXTENDED_ENTRY_LENGTH as usize);
        for entry in entries {
            entry.encode(self.order, &mut bytes);
        }

        let offset = self.position;
        self.file.write_all(&bytes)?;
        self.position += bytes.len() as u64;
        Ok((offset, bytes))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_entries(&mut self) -> Result<Vec<TransactionEntry>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        self.position = bytes.len() as u64;
        decode_entries(&bytes, self.order)
    }
}

/// Result of replaying a transactions log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    /// live file number -> expected length
    pub file_lengths: BTreeMap<u64, u64>,
    pub head_file_number: Option<u64>,
    /// Highest file number ever created, deleted files included
    pub highest_file_number: Option<u64>,
    pub latest_timestamp: u64,
    pub latest_store: Option<StoreMark>,
    pub previous_store: Option<StoreMark>,
}

impl ReplayState {
    pub fn latest_store_timestamp(&self) -> u64 {
        self.latest_store.map(|m| m.timestamp).unwrap_or(0)
    }

    pub fn previous_store_timestamp(&self) -> u64 {
        self.previous_store.map(|m| m.timestamp).unwrap_or(0)
    }
}

/// Position of the last store entry, used to roll it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMark {
    pub timestamp: u64,
    pub file_number: u64,
    pub length_before: u64,
    pub length_after: u64,
}

pub fn replay(entries: &[TransactionEntry]) -> Result<ReplayState> {
    let mut state = ReplayState::default();

    for entry in entries {
        if entry.timestamp() < state.latest_timestamp {
            return Err(Error::consistency(format!(
                "transactions entry timestamp {} precedes {}", entry.timestamp(), state.latest_timestamp
            )));
        }
        state.latest_timestamp = entry.timestamp();

        let number = entry.file_number();
        match *entry {
            TransactionEntry::FileCreation { file_length, .. } => {
                if state.file_lengths.insert(number, file_length).is_some() {
                    return Err(Error::consistency(format!("file {} created twice", number)));
                }
                state.head_file_number = Some(number);
                state.highest_file_number = state.highest_file_number.max(Some(number));
            }
            TransactionEntry::Store { timestamp, file_length, .. } => {
                let before = expect_file(&state, number)?;
                if file_length < before {
                    return Err(Error::consistency(format!(
                        "store shrinks file {} from {} to {}", number, before, file_length
                    )));
                }
                state.file_lengths.insert(number, file_length);
                state.previous_store = state.latest_store;
                state.latest_store = Some(StoreMark {
                    timestamp,
                    file_number: number,
                    length_before: before,
                    length_after: file_length,
                });
            }
            TransactionEntry::Transfer { file_length, source_file_number, .. } => {
                expect_file(&state, number)?;
                expect_file(&state, source_file_number)?;
                state.file_lengths.insert(number, file_length);
            }
            TransactionEntry::FileTruncation { file_length, .. } => {
                expect_file(&state, number)?;
                state.file_lengths.insert(number, file_length);
                // truncating back to the state before the latest store rolls that store back
                if let Some(mark) = state.latest_store {
                    if mark.file_number == number && mark.length_before == file_length {
                        state.latest_store = state.previous_store.take();
                    }
                }
            }
            TransactionEntry::FileDeletion { .. } => {
                expect_file(&state, number)?;
                state.file_lengths.remove(&number);
            }
        }
    }

    Ok(state)
}

fn expect_file(state: &ReplayState, number: u64) -> Result<u64> {
    state.file_lengths.get(&number).copied().ok_or_else(|| {
        Error::new(
            ErrorKind::Consistency,
            format!("transactions entry references unknown data file {}", number),
        )
    })
}
