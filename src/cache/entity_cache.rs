use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use crate::cache::gc::MarkMonitor;
use crate::cache::type_dictionary::TypeDictionary;
use crate::cache::zombie::{is_potential_zombie, ZombieOidHandler};
use crate::core::error::Result;
use crate::core::types::{Entity, FileLocation, ObjectId, TypeId};
use crate::storage::file_manager::{FileManager, InventoryRecord};

/// Decides which cached payloads get dropped
#[derive(Debug, Clone, Copy)]
pub struct EntityCacheEvaluator {
    pub timeout: Duration,
    pub threshold: u64,
}

impl EntityCacheEvaluator {
    pub fn new(timeout: Duration, threshold: u64) -> Self {
        EntityCacheEvaluator { timeout, threshold }
    }

    pub fn should_clear(&self, cached_bytes: u64, age: Duration) -> bool {
        age >= self.timeout || cached_bytes > self.threshold
    }
}

pub struct CacheEntry {
    type_id: TypeId,
    location: FileLocation,
    payload: Option<Vec<u8>>,
    last_touched: Instant,
    mark_cycle: u64,
}

impl CacheEntry {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn location(&self) -> FileLocation {
        self.location
    }

    pub fn is_payload_cached(&self) -> bool {
        self.payload.is_some()
    }
}

/// Per-channel registry of every live entity, with an optional payload cache
pub struct EntityCache {
    channel: usize,
    entries: HashMap<ObjectId, CacheEntry>,
    cached_bytes: u64,
    evaluator: EntityCacheEvaluator,
    /// GC cycle this channel is marking for, 0 before the first cycle
    mark_cycle: u64,
}

impl EntityCache {
    pub fn new(channel: usize, evaluator: EntityCacheEvaluator) -> Self {
        EntityCache {
            channel,
            entries: HashMap::new(),
            cached_bytes: 0,
            evaluator,
            mark_cycle: 0,
        }
    }

    /// Registers startup records in write order; the last record of an id wins.
    pub fn rebuild(&mut self, records: &[InventoryRecord], files: &mut FileManager) {
        for record in records {
            if let Some(previous) = self.register(record.object_id, record.type_id, record.location, None) {
                files.remove_live(previous);
            }
            files.add_live(record.location);
        }
        debug!(channel = self.channel, entities = self.entries.len(), "entity cache rebuilt");
    }

    fn register(
        &mut self,
        object_id: ObjectId,
        type_id: TypeId,
        location: FileLocation,
        payload: Option<Vec<u8>>,
    ) -> Option<FileLocation> {
        let added = payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
        let entry = CacheEntry {
            type_id,
            location,
            payload,
            last_touched: Instant::now(),
            mark_cycle: 0,
        };
        self.cached_bytes += added;
        let previous = self.entries.insert(object_id, entry)?;
        self.cached_bytes -= previous.payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
        Some(previous.location)
    }

    /// Records a freshly stored entity. Returns the location it replaced.
    pub fn put_entity(&mut self, entity: Entity, location: FileLocation) -> Option<FileLocation> {
        self.register(entity.object_id, entity.type_id, location, Some(entity.payload))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    pub fn get_entry(&self, object_id: ObjectId) -> Option<&CacheEntry> {
        self.entries.get(&object_id)
    }

    pub fn contains(&self, object_id: ObjectId) -> bool {
        self.entries.contains_key(&object_id)
    }

    pub fn location(&self, object_id: ObjectId) -> Option<FileLocation> {
        self.entries.get(&object_id).map(|e| e.location)
    }

    pub fn is_payload_cached(&self, object_id: ObjectId) -> bool {
        self.entries.get(&object_id).map(|e| e.payload.is_some()).unwrap_or(false)
    }

    /// Returns the entity, reading its payload back from disk if it was evicted.
    pub fn load(&mut self, object_id: ObjectId, files: &mut FileManager) -> Result<Option<Entity>> {
        let entry = match self.entries.get_mut(&object_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.last_touched = Instant::now();

        if let Some(payload) = &entry.payload {
            return Ok(Some(Entity::new(object_id, entry.type_id, payload.clone())));
        }

        let entity = files.read_entity(object_id, entry.location)?;
        self.cached_bytes += entity.payload.len() as u64;
        entry.payload = Some(entity.payload.clone());
        Ok(Some(entity))
    }

    /// Live entities whose current record lies in `file_number`.
    pub fn members_of(&self, file_number: u64) -> Vec<(ObjectId, FileLocation)> {
        let mut members: Vec<_> = self.entries
            .iter()
            .filter(|(_, e)| e.location.file_number == file_number)
            .map(|(oid, e)| (*oid, e.location))
            .collect();
        members.sort_by_key(|(_, location)| location.offset);
        members
    }

    pub fn relocate(&mut self, object_id: ObjectId, location: FileLocation) {
        if let Some(entry) = self.entries.get_mut(&object_id) {
            entry.location = location;
        }
    }

    /// Evicts the payload of `object_id` if the evaluator asks for it. The
    /// entry and its location stay.
    pub fn check_for_cache_clear(&mut self, object_id: ObjectId, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&object_id) else {
            return false;
        };
        let Some(length) = entry.payload.as_ref().map(|p| p.len() as u64) else {
            return false;
        };
        if !self.evaluator.should_clear(self.cached_bytes, now.saturating_duration_since(entry.last_touched)) {
            return false;
        }
        entry.payload = None;
        self.cached_bytes -= length;
        true
    }

    /// Drops payloads the evaluator selects, oldest first. Returns the number cleared.
    pub fn clear_cache(&mut self, deadline: Option<Instant>) -> usize {
        let now = Instant::now();
        let mut candidates: Vec<(Instant, ObjectId)> = self.entries
            .iter()
            .filter(|(_, e)| e.payload.is_some())
            .map(|(oid, e)| (e.last_touched, *oid))
            .collect();
        candidates.sort();

        let mut cleared = 0;
        for (i, (_, oid)) in candidates.into_iter().enumerate() {
            if i % 128 == 127 && deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                break;
            }
            if !self.check_for_cache_clear(oid, now) {
                // everything after this entry is younger
                break;
            }
            cleared += 1;
        }
        if cleared > 0 {
            debug!(channel = self.channel, cleared, cached_bytes = self.cached_bytes, "entity cache cleared");
        }
        cleared
    }

    pub fn begin_mark_cycle(&mut self, cycle: u64) {
        self.mark_cycle = cycle;
    }

    pub fn mark_cycle(&self) -> u64 {
        self.mark_cycle
    }

    /// Drains this channel's mark queue until it is empty or the deadline
    /// passes. Returns true if the queue was drained.
    pub fn mark(
        &mut self,
        monitor: &MarkMonitor,
        dictionary: &TypeDictionary,
        files: &mut FileManager,
        zombies: &dyn ZombieOidHandler,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        loop {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Ok(false);
            }
            let object_id = match monitor.poll(self.channel) {
                Some(object_id) => object_id,
                None => return Ok(true),
            };
            let result = self.mark_one(object_id, monitor, dictionary, files, zombies);
            monitor.processed();
            result?;
        }
    }

    fn mark_one(
        &mut self,
        object_id: ObjectId,
        monitor: &MarkMonitor,
        dictionary: &TypeDictionary,
        files: &mut FileManager,
        zombies: &dyn ZombieOidHandler,
    ) -> Result<()> {
        let cycle = self.mark_cycle;
        let type_id = match self.entries.get_mut(&object_id) {
            Some(entry) if entry.mark_cycle == cycle => return Ok(()),
            Some(entry) => {
                entry.mark_cycle = cycle;
                entry.type_id
            }
            None => {
                if is_potential_zombie(object_id) {
                    zombies.handle_zombie_oid(object_id)?;
                }
                return Ok(());
            }
        };

        if dictionary.layout(type_id).map(|l| l.has_references()).unwrap_or(false) {
            if let Some(entity) = self.load(object_id, files)? {
                dictionary.iterate_references(type_id, &entity.payload, &mut |reference| {
                    monitor.enqueue(reference)
                })?;
            }
        }
        Ok(())
    }

    /// Removes every entity not marked in the current cycle and releases its
    /// record. Returns the number of entities removed.
    pub fn sweep(&mut self, files: &mut FileManager) -> usize {
        let cycle = self.mark_cycle;
        let mut released = Vec::new();
        let mut freed_bytes = 0;
        self.entries.retain(|_, entry| {
            if entry.mark_cycle == cycle {
                return true;
            }
            released.push(entry.location);
            freed_bytes += entry.payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
            false
        });
        self.cached_bytes -= freed_bytes;
        for location in &released {
            files.remove_live(*location);
        }
        if !released.is_empty() {
            debug!(channel = self.channel, cycle, swept = released.len(), "swept unreachable entities");
        }
        released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::cache::type_dictionary::PayloadBuilder;
    use crate::cache::zombie::IgnoreZombieOids;
    use crate::core::types::{OBJECT_ID_BASE, TYPE_ID_BASE};
    use crate::storage::dissolver::RatioFileDissolver;
    use crate::storage::file_manager::read_storage;
    use crate::storage::layout::StorageLayout;
    use crate::storage::record::ByteOrder;

    const LEAF: TypeId = TypeId(TYPE_ID_BASE + 200);

    fn oid(n: u64) -> ObjectId {
        ObjectId(OBJECT_ID_BASE + n)
    }

    fn file_manager(dir: &std::path::Path) -> FileManager {
        let layout = StorageLayout::new(dir.to_path_buf()).unwrap();
        layout.create_channel_dirs(1).unwrap();
        let inventory = read_storage(&layout, 0, ByteOrder::Little).unwrap();
        FileManager::initialize(
            layout, inventory, ByteOrder::Little, 0, 1,
            Arc::new(RatioFileDissolver::default()), None,
        ).unwrap().0
    }

    fn store(cache: &mut EntityCache, files: &mut FileManager, timestamp: u64, entities: Vec<Entity>) {
        let locations = files.write_store(timestamp, &entities).unwrap();
        for (entity, location) in entities.into_iter().zip(locations) {
            if let Some(previous) = cache.put_entity(entity, location) {
                files.remove_live(previous);
            }
            files.add_live(location);
        }
    }

    #[test]
    fn evicted_payload_is_reloaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_manager(dir.path());
        let mut cache = EntityCache::new(0, EntityCacheEvaluator::new(Duration::ZERO, u64::MAX));

        store(&mut cache, &mut files, 5, vec![Entity::new(oid(1), LEAF, b"payload".to_vec())]);
        assert_eq!(cache.cached_bytes(), 7);

        assert_eq!(cache.clear_cache(None), 1);
        assert_eq!(cache.cached_bytes(), 0);
        assert!(!cache.is_payload_cached(oid(1)));
        let entry = cache.get_entry(oid(1)).unwrap();
        assert_eq!(entry.type_id(), LEAF);
        assert!(!entry.is_payload_cached());

        let entity = cache.load(oid(1), &mut files).unwrap().unwrap();
        assert_eq!(entity.payload, b"payload");
        assert!(cache.is_payload_cached(oid(1)));
        assert!(cache.load(oid(2), &mut files).unwrap().is_none());
    }

    #[test]
    fn threshold_evicts_until_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_manager(dir.path());
        let mut cache = EntityCache::new(0, EntityCacheEvaluator::new(Duration::from_secs(3600), 10));

        store(&mut cache, &mut files, 5, vec![
            Entity::new(oid(1), LEAF, vec![1; 8]),
            Entity::new(oid(2), LEAF, vec![2; 8]),
        ]);
        assert_eq!(cache.clear_cache(None), 1);
        assert_eq!(cache.cached_bytes(), 8);

        // under the threshold and young: nothing more to evict
        let kept = if cache.is_payload_cached(oid(1)) { oid(1) } else { oid(2) };
        assert!(!cache.check_for_cache_clear(kept, Instant::now()));
        assert!(!cache.check_for_cache_clear(oid(9), Instant::now()));
    }

    #[test]
    fn mark_and_sweep_keeps_only_reachable_entities() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_manager(dir.path());
        let mut cache = EntityCache::new(0, EntityCacheEvaluator::new(Duration::from_secs(3600), u64::MAX));
        let dictionary = TypeDictionary::new();
        let monitor = MarkMonitor::new(1);

        let roots = Entity::new(ObjectId::ROOTS, TypeId::ROOTS, PayloadBuilder::new().references(&[oid(1)]).finish());
        store(&mut cache, &mut files, 5, vec![
            roots,
            Entity::new(oid(1), LEAF, b"live".to_vec()),
            Entity::new(oid(2), LEAF, b"garbage".to_vec()),
        ]);
        let before = files.statistics().live_data_length();

        let cycle = monitor.join(0).unwrap();
        cache.begin_mark_cycle(cycle);
        assert!(cache.mark(&monitor, &dictionary, &mut files, &IgnoreZombieOids, None).unwrap());
        assert!(monitor.may_sweep(0));
        assert_eq!(cache.sweep(&mut files), 1);
        monitor.swept(0);

        assert!(cache.contains(oid(1)));
        assert!(!cache.contains(oid(2)));
        assert_eq!(files.statistics().live_data_length(), before - (24 + 7));
        assert_eq!(monitor.completed_cycles(), 1);
    }
}
