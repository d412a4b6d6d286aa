use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{ChannelStatistics, FileStatistics};
use crate::core::types::{Entity, FileLocation, ObjectId, TypeId, TYPE_ID_BASE};
use crate::mmap::mmap_file::MmapFile;
use crate::storage::backup::{BackupSink, BackupTarget};
use crate::storage::data_file::DataFile;
use crate::storage::dissolver::FileDissolver;
use crate::storage::layout::StorageLayout;
use crate::storage::record::{decode_record, encode_record, ByteOrder, RecordIterator};
use crate::storage::transactions::{replay, ReplayState, TransactionEntry, TransactionsFile};

/// One record found while scanning a channel's files at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryRecord {
    pub object_id: ObjectId,
    pub type_id: TypeId,
    pub location: FileLocation,
}

/// Everything a channel knows about its files before initialization is decided
#[derive(Debug, Clone)]
pub struct ChannelInventory {
    pub channel: usize,
    pub transactions_exist: bool,
    pub replay: ReplayState,
    /// Records in write order: file number, then offset
    pub records: Vec<InventoryRecord>,
}

impl ChannelInventory {
    pub fn highest_object_id(&self) -> Option<ObjectId> {
        self.records
            .iter()
            .map(|r| r.object_id)
            .filter(|oid| oid.is_object_range())
            .max()
    }
}

/// Reads the transactions log and scans every logged data file of a channel.
pub fn read_storage(layout: &StorageLayout, channel: usize, order: ByteOrder) -> Result<ChannelInventory> {
    let transactions_path = layout.transactions_path(channel);
    let on_disk = layout.data_file_numbers(channel)?;

    if !transactions_path.exists() {
        if !on_disk.is_empty() {
            return Err(Error::consistency(format!(
                "channel {} has {} data files but no transactions file", channel, on_disk.len()
            )));
        }
        return Ok(ChannelInventory {
            channel,
            transactions_exist: false,
            replay: ReplayState::default(),
            records: Vec::new(),
        });
    }

    let mut transactions = TransactionsFile::open(&transactions_path, order)?;
    let state = replay(&transactions.read_entries()?)
        .map_err(|e| Error::new(e.kind, format!("channel {}: {}", channel, e.context)))?;

    if let Some(unknown) = on_disk.iter().find(|n| !state.file_lengths.contains_key(n)) {
        return Err(Error::consistency(format!(
            "channel {} data file {} is unknown to the transactions log", channel, unknown
        )));
    }

    let mut records = Vec::new();
    for (&number, &expected) in &state.file_lengths {
        let path = layout.data_file_path(channel, number);
        let actual = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                return Err(Error::consistency(format!(
                    "channel {} data file {} is logged but missing", channel, number
                )));
            }
        };
        if actual != expected {
            return Err(Error::consistency(format!(
                "channel {} data file {} has length {}, transactions log expects {}",
                channel, number, actual, expected
            )));
        }

        let mapped = MmapFile::open_read_only(&path, expected)?;
        for item in RecordIterator::new(mapped.data(), order) {
            let (offset, record) = item.map_err(|e| Error::new(
                e.kind,
                format!("channel {} data file {}: {}", channel, number, e.context),
            ))?;
            records.push(InventoryRecord {
                object_id: record.object_id,
                type_id: record.type_id,
                location: FileLocation { file_number: number, offset, length: record.length },
            });
        }
    }

    debug!(channel, files = state.file_lengths.len(), records = records.len(), "channel inventory read");
    Ok(ChannelInventory {
        channel,
        transactions_exist: true,
        replay: state,
        records,
    })
}

/// Owns the data files and the transactions log of one channel
pub struct FileManager {
    channel: usize,
    layout: StorageLayout,
    order: ByteOrder,
    files: BTreeMap<u64, DataFile>,
    head: u64,
    next_file_number: u64,
    transactions: TransactionsFile,
    dissolver: Arc<dyn FileDissolver>,
    backup: Option<BackupSink>,
    /// Housekeeping entries reuse this so store timestamps stay monotonic
    last_timestamp: u64,
    last_store_timestamp: u64,
    /// Newest store known to be written by every channel. Files are only
    /// transferred or deleted while nothing newer is pending, because a
    /// rollback of the pending store truncates the head.
    confirmed_store_timestamp: u64,
}

impl FileManager {
    /// Opens the channel's files, rolling back the latest store if it is newer
    /// than `consistent_store_timestamp`. Returns the surviving records.
    pub fn initialize(
        layout: StorageLayout,
        inventory: ChannelInventory,
        order: ByteOrder,
        consistent_store_timestamp: u64,
        initial_timestamp: u64,
        dissolver: Arc<dyn FileDissolver>,
        backup: Option<BackupSink>,
    ) -> Result<(Self, Vec<InventoryRecord>)> {
        let channel = inventory.channel;
        let transactions = TransactionsFile::open(&layout.transactions_path(channel), order)?;

        let mut files = BTreeMap::new();
        for &number in inventory.replay.file_lengths.keys() {
            files.insert(number, DataFile::open(number, layout.data_file_path(channel, number))?);
        }

        let mut manager = FileManager {
            channel,
            layout,
            order,
            files,
            head: inventory.replay.head_file_number.unwrap_or(0),
            next_file_number: inventory.replay.highest_file_number.map(|n| n + 1).unwrap_or(0),
            transactions,
            dissolver,
            backup,
            last_timestamp: inventory.replay.latest_timestamp.max(initial_timestamp),
            last_store_timestamp: inventory.replay.latest_store_timestamp().min(consistent_store_timestamp),
            confirmed_store_timestamp: consistent_store_timestamp,
        };

        let mut records = inventory.records;
        if inventory.replay.latest_store_timestamp() > consistent_store_timestamp {
            records = manager.rollback_latest_store(&inventory.replay, consistent_store_timestamp, records)?;
        }

        if !manager.files.contains_key(&manager.head) {
            manager.create_file()?;
        }

        info!(channel, files = manager.files.len(), head = manager.head, "file manager initialized");
        Ok((manager, records))
    }

    fn rollback_latest_store(
        &mut self,
        state: &ReplayState,
        consistent_store_timestamp: u64,
        records: Vec<InventoryRecord>,
    ) -> Result<Vec<InventoryRecord>> {
        let mark = state.latest_store.ok_or_else(|| {
            Error::consistency(format!("channel {} has no store to roll back", self.channel))
        })?;
        if state.previous_store_timestamp() != consistent_store_timestamp {
            return Err(Error::consistency(format!(
                "channel {} cannot roll back to timestamp {}: previous store is {}",
                self.channel, consistent_store_timestamp, state.previous_store_timestamp()
            )));
        }

        warn!(
            channel = self.channel,
            timestamp = mark.timestamp,
            file_number = mark.file_number,
            "rolling back incomplete store"
        );
        let file = self.file_mut(mark.file_number)?;
        file.truncate(mark.length_before)?;
        if let Some(sink) = &self.backup {
            sink.truncate(self.channel, BackupTarget::DataFile(mark.file_number), mark.length_before);
        }
        let timestamp = self.last_timestamp;
        self.log(&[TransactionEntry::FileTruncation {
            timestamp,
            file_number: mark.file_number,
            file_length: mark.length_before,
            old_length: mark.length_after,
        }])?;

        Ok(records
            .into_iter()
            .filter(|r| r.location.file_number != mark.file_number || r.location.offset < mark.length_before)
            .collect())
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn head_file_number(&self) -> u64 {
        self.head
    }

    pub fn file_numbers(&self) -> Vec<u64> {
        self.files.keys().copied().collect()
    }

    fn file_mut(&mut self, number: u64) -> Result<&mut DataFile> {
        let channel = self.channel;
        self.files.get_mut(&number).ok_or_else(|| {
            Error::consistency(format!("channel {} has no data file {}", channel, number))
        })
    }

    fn log(&mut self, entries: &[TransactionEntry]) -> Result<()> {
        let (offset, bytes) = self.transactions.append(entries)?;
        self.transactions.sync()?;
        if let Some(sink) = &self.backup {
            sink.write(self.channel, BackupTarget::Transactions, offset, bytes);
        }
        Ok(())
    }

    fn create_file(&mut self) -> Result<()> {
        let number = self.next_file_number;
        let file = DataFile::create(number, self.layout.data_file_path(self.channel, number))?;
        self.files.insert(number, file);
        self.head = number;
        self.next_file_number += 1;

        let timestamp = self.last_timestamp;
        self.log(&[TransactionEntry::FileCreation { timestamp, file_number: number, file_length: 0 }])?;
        if let Some(sink) = &self.backup {
            sink.truncate(self.channel, BackupTarget::DataFile(number), 0);
        }
        debug!(channel = self.channel, file_number = number, "created head data file");
        Ok(())
    }

    fn rotate_if_full(&mut self) -> Result<()> {
        let full = match self.files.get(&self.head) {
            Some(head) => self.dissolver.needs_rotation(head),
            None => true,
        };
        if full {
            self.create_file()?;
        }
        Ok(())
    }

    fn append_to_head(&mut self, bytes: &[u8]) -> Result<u64> {
        let channel = self.channel;
        let head = self.head;
        let file = self.file_mut(head)?;
        let base = file.append(bytes)?;
        file.sync()?;
        if let Some(sink) = &self.backup {
            sink.write(channel, BackupTarget::DataFile(head), base, bytes.to_vec());
        }
        Ok(base)
    }

    /// Writes one store chunk into the head file and logs it. Empty chunks
    /// are logged too, so every channel carries every store timestamp.
    pub fn write_store(&mut self, timestamp: u64, entities: &[Entity]) -> Result<Vec<FileLocation>> {
        if timestamp < self.last_timestamp {
            return Err(Error::invalid_state(format!(
                "store timestamp {} precedes channel {} timestamp {}",
                timestamp, self.channel, self.last_timestamp
            )));
        }

        let mut buffer = Vec::new();
        let mut relative = Vec::with_capacity(entities.len());
        for entity in entities {
            validate_entity(entity)?;
            let start = buffer.len() as u64;
            encode_record(entity, self.order, &mut buffer);
            relative.push((start, buffer.len() as u64 - start));
        }

        self.last_store_timestamp = timestamp;
        let base = if buffer.is_empty() {
            self.file_mut(self.head)?.length
        } else {
            self.append_to_head(&buffer)?
        };

        let head = self.head;
        let file_length = self.file_mut(head)?.length;
        self.last_timestamp = timestamp;
        self.log(&[TransactionEntry::Store { timestamp, file_number: head, file_length }])?;

        let locations = relative
            .into_iter()
            .map(|(offset, length)| FileLocation { file_number: head, offset: base + offset, length })
            .collect();

        self.rotate_if_full()?;
        Ok(locations)
    }

    /// Reads the record at `location` and checks it belongs to `object_id`.
    pub fn read_entity(&mut self, object_id: ObjectId, location: FileLocation) -> Result<Entity> {
        let order = self.order;
        let bytes = self.file_mut(location.file_number)?.read_at(location.offset, location.length)?;
        let record = decode_record(&bytes, 0, order)?;
        if record.object_id != object_id || record.length != location.length {
            return Err(Error::consistency(format!(
                "record at {}:{} holds entity {} ({} bytes), expected {} ({} bytes)",
                location.file_number, location.offset, record.object_id, record.length,
                object_id, location.length
            )));
        }
        Ok(record.to_entity())
    }

    pub fn add_live(&mut self, location: FileLocation) {
        if let Some(file) = self.files.get_mut(&location.file_number) {
            file.add_live(location.length);
        }
    }

    pub fn remove_live(&mut self, location: FileLocation) {
        if let Some(file) = self.files.get_mut(&location.file_number) {
            file.remove_live(location.length);
        }
    }

    /// Records that every store up to `timestamp` completed on all channels.
    pub fn confirm_stores_up_to(&mut self, timestamp: u64) {
        self.confirmed_store_timestamp = self.confirmed_store_timestamp.max(timestamp);
    }

    pub fn has_unconfirmed_store(&self) -> bool {
        self.last_store_timestamp > self.confirmed_store_timestamp
    }

    fn ensure_stores_confirmed(&self, operation: &str) -> Result<()> {
        if self.has_unconfirmed_store() {
            return Err(Error::invalid_state(format!(
                "channel {} cannot {} while store {} is unconfirmed",
                self.channel, operation, self.last_store_timestamp
            )));
        }
        Ok(())
    }

    /// Non-head files the dissolver wants emptied, oldest first. Empty while
    /// the latest store is unconfirmed.
    pub fn dissolve_candidates(&self) -> Vec<u64> {
        if self.has_unconfirmed_store() {
            return Vec::new();
        }
        self.files
            .values()
            .filter(|file| file.number != self.head && self.dissolver.needs_dissolve(file))
            .map(|file| file.number)
            .collect()
    }

    pub fn has_live_data(&self, number: u64) -> bool {
        self.files.get(&number).map(|f| f.has_live_data()).unwrap_or(false)
    }

    /// Copies the given live records of `source` into the head file and logs
    /// one transfer entry. Returns the new locations in input order.
    pub fn transfer(&mut self, source: u64, records: &[(ObjectId, FileLocation)]) -> Result<Vec<FileLocation>> {
        if source == self.head {
            return Err(Error::invalid_argument(format!(
                "channel {} cannot transfer out of its head file {}", self.channel, source
            )));
        }
        self.ensure_stores_confirmed("transfer records")?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut buffer = Vec::new();
        let mut relative = Vec::with_capacity(records.len());
        {
            let file = self.file_mut(source)?;
            for (_, location) in records {
                if location.file_number != source {
                    return Err(Error::invalid_argument(format!(
                        "record location in file {} passed for transfer out of {}",
                        location.file_number, source
                    )));
                }
                relative.push(buffer.len() as u64);
                buffer.extend_from_slice(&file.read_at(location.offset, location.length)?);
            }
        }

        let base = self.append_to_head(&buffer)?;
        let head = self.head;
        let file_length = self.file_mut(head)?.length;
        let timestamp = self.last_timestamp;
        self.log(&[TransactionEntry::Transfer {
            timestamp,
            file_number: head,
            file_length,
            source_file_number: source,
        }])?;

        let mut moved = Vec::with_capacity(records.len());
        for ((_, old), offset) in records.iter().zip(relative) {
            let new = FileLocation { file_number: head, offset: base + offset, length: old.length };
            self.remove_live(*old);
            self.add_live(new);
            moved.push(new);
        }

        debug!(channel = self.channel, source, head, records = records.len(), "transferred live records");
        self.rotate_if_full()?;
        Ok(moved)
    }

    /// Deletes a dissolved file. It must not hold live records anymore.
    pub fn delete_file(&mut self, number: u64) -> Result<()> {
        if number == self.head {
            return Err(Error::invalid_argument(format!("cannot delete head file {}", number)));
        }
        self.ensure_stores_confirmed("delete files")?;
        let length = {
            let file = self.file_mut(number)?;
            if file.has_live_data() {
                return Err(Error::consistency(format!(
                    "data file {} still has {} live records", number, file.live_count
                )));
            }
            file.length
        };

        let timestamp = self.last_timestamp;
        self.log(&[TransactionEntry::FileDeletion { timestamp, file_number: number, file_length: length }])?;
        if let Some(file) = self.files.remove(&number) {
            file.delete()?;
        }
        if let Some(sink) = &self.backup {
            sink.delete(self.channel, BackupTarget::DataFile(number));
        }
        info!(channel = self.channel, file_number = number, "deleted dissolved data file");
        Ok(())
    }

    pub fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            channel: self.channel,
            files: self.files
                .values()
                .map(|file| FileStatistics {
                    file_number: file.number,
                    total_length: file.length,
                    live_length: file.live_length,
                    live_count: file.live_count,
                })
                .collect(),
            entity_count: 0,
            cached_bytes: 0,
        }
    }

    /// Copies every data file and the transactions log into `target`.
    pub fn export(&mut self, target: &StorageLayout) -> Result<()> {
        target.create_channel_dirs(self.channel + 1)?;
        self.transactions.sync()?;
        for file in self.files.values_mut() {
            file.sync()?;
            fs::copy(&file.path, target.data_file_path(self.channel, file.number))?;
        }
        fs::copy(
            self.layout.transactions_path(self.channel),
            target.transactions_path(self.channel),
        )?;
        Ok(())
    }
}

pub(crate) fn validate_entity(entity: &Entity) -> Result<()> {
    let oid = entity.object_id;
    if !(oid.is_object_range() || oid == ObjectId::ROOTS) {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("object id {} outside of the object id range", oid),
        ));
    }
    if entity.type_id.0 < TYPE_ID_BASE {
        return Err(Error::invalid_argument(format!(
            "type id {} of entity {} outside of the type id range", entity.type_id, oid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OBJECT_ID_BASE;
    use crate::storage::dissolver::RatioFileDissolver;

    fn entity(n: u64, payload: &[u8]) -> Entity {
        Entity::new(ObjectId(OBJECT_ID_BASE + n), TypeId(TYPE_ID_BASE + 50), payload.to_vec())
    }

    fn dissolver(max: u64) -> Arc<dyn FileDissolver> {
        Arc::new(RatioFileDissolver { file_minimum_size: 0, file_maximum_size: max, minimum_use_ratio: 0.75 })
    }

    fn open(layout: &StorageLayout, consistent: u64, max: u64) -> (FileManager, Vec<InventoryRecord>) {
        let inventory = read_storage(layout, 0, ByteOrder::Little).unwrap();
        FileManager::initialize(layout.clone(), inventory, ByteOrder::Little, consistent, 1, dissolver(max), None)
            .unwrap()
    }

    #[test]
    fn stores_are_found_again_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        let (mut files, records) = open(&layout, 0, 1 << 20);
        assert!(records.is_empty());
        let locations = files.write_store(10, &[entity(1, b"one"), entity(2, b"two")]).unwrap();
        files.write_store(11, &[]).unwrap();
        files.write_store(12, &[entity(1, b"uno")]).unwrap();
        assert_eq!(files.read_entity(entity(2, b"").object_id, locations[1]).unwrap().payload, b"two");
        drop(files);

        let inventory = read_storage(&layout, 0, ByteOrder::Little).unwrap();
        assert_eq!(inventory.replay.latest_store_timestamp(), 12);
        assert_eq!(inventory.replay.previous_store_timestamp(), 11);
        assert_eq!(inventory.records.len(), 3);
        assert_eq!(inventory.highest_object_id(), Some(ObjectId(OBJECT_ID_BASE + 2)));
    }

    #[test]
    fn newer_store_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        let (mut files, _) = open(&layout, 0, 1 << 20);
        files.write_store(10, &[entity(1, b"kept")]).unwrap();
        files.write_store(20, &[entity(2, b"dropped")]).unwrap();
        drop(files);

        let (files, records) = open(&layout, 10, 1 << 20);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_id, ObjectId(OBJECT_ID_BASE + 1));
        drop(files);

        let inventory = read_storage(&layout, 0, ByteOrder::Little).unwrap();
        assert_eq!(inventory.replay.latest_store_timestamp(), 10);
        assert_eq!(inventory.records.len(), 1);
    }

    #[test]
    fn length_mismatch_and_unknown_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        let (mut files, _) = open(&layout, 0, 1 << 20);
        files.write_store(10, &[entity(1, b"data")]).unwrap();
        let head = files.head_file_number();
        drop(files);

        let path = layout.data_file_path(0, head);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, [bytes.as_slice(), b"garbage".as_slice()].concat()).unwrap();
        assert_eq!(read_storage(&layout, 0, ByteOrder::Little).unwrap_err().kind, ErrorKind::Consistency);

        fs::write(&path, &bytes[..4]).unwrap();
        assert_eq!(read_storage(&layout, 0, ByteOrder::Little).unwrap_err().kind, ErrorKind::Consistency);

        fs::write(&path, &bytes).unwrap();
        assert_eq!(read_storage(&layout, 0, ByteOrder::Little).unwrap().records.len(), 1);
        fs::write(layout.data_file_path(0, head + 7), b"").unwrap();
        assert_eq!(read_storage(&layout, 0, ByteOrder::Little).unwrap_err().kind, ErrorKind::Consistency);
    }

    #[test]
    fn transfer_moves_live_records_and_frees_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        // tiny maximum size: every store rotates the head
        let (mut files, _) = open(&layout, 0, 16);
        let first = files.write_store(10, &[entity(1, b"alpha"), entity(2, b"beta")]).unwrap();
        for location in &first {
            files.add_live(*location);
        }
        let source = first[0].file_number;
        assert_ne!(files.head_file_number(), source);
        assert_eq!(files.dissolve_candidates(), Vec::<u64>::new());

        // supersede entity 2, leaving file `source` half garbage
        let newer = files.write_store(11, &[entity(2, b"beta2")]).unwrap();
        files.remove_live(first[1]);
        files.add_live(newer[0]);
        assert!(files.dissolve_candidates().is_empty());
        files.confirm_stores_up_to(11);
        assert!(files.dissolve_candidates().contains(&source));

        let moved = files.transfer(source, &[(entity(1, b"").object_id, first[0])]).unwrap();
        assert_eq!(files.read_entity(entity(1, b"").object_id, moved[0]).unwrap().payload, b"alpha");
        assert!(!files.has_live_data(source));
        files.delete_file(source).unwrap();
        assert!(!layout.data_file_path(0, source).exists());
        drop(files);

        let inventory = read_storage(&layout, 0, ByteOrder::Little).unwrap();
        assert!(!inventory.replay.file_lengths.contains_key(&source));
        let last_alpha = inventory.records.iter().rev()
            .find(|r| r.object_id == entity(1, b"").object_id)
            .unwrap();
        assert_eq!(last_alpha.location, moved[0]);
    }

    #[test]
    fn rollback_keeps_records_committed_before_an_unconfirmed_store() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        let (mut files, _) = open(&layout, 0, 16);
        let first = files.write_store(10, &[entity(1, b"alpha"), entity(2, b"beta")]).unwrap();
        for location in &first {
            files.add_live(*location);
        }
        files.confirm_stores_up_to(10);
        let source = first[0].file_number;

        // store 11 lands in the next head and never completes elsewhere
        let newer = files.write_store(11, &[entity(2, b"beta2")]).unwrap();
        files.remove_live(first[1]);
        files.add_live(newer[0]);
        assert!(files.has_unconfirmed_store());
        assert!(files.dissolve_candidates().is_empty());
        let err = files.transfer(source, &[(entity(1, b"").object_id, first[0])]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        files.remove_live(first[0]);
        assert_eq!(files.delete_file(source).unwrap_err().kind, ErrorKind::InvalidState);
        drop(files);

        let (mut files, records) = open(&layout, 10, 16);
        assert!(!files.has_unconfirmed_store());
        assert_eq!(records.len(), 2);
        for (record, payload) in records.iter().zip([b"alpha".as_slice(), b"beta".as_slice()]) {
            assert_eq!(record.location.file_number, source);
            assert_eq!(files.read_entity(record.object_id, record.location).unwrap().payload, payload);
        }
    }

    #[test]
    fn rejects_entities_outside_object_range() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();

        let (mut files, _) = open(&layout, 0, 1 << 20);
        let bad = Entity::new(ObjectId(5), TypeId(TYPE_ID_BASE + 50), vec![]);
        assert_eq!(files.write_store(10, &[bad]).unwrap_err().kind, ErrorKind::InvalidArgument);
    }
}
