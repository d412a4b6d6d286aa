use std::collections::{BTreeMap, HashMap};
use crc32fast::Hasher;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use crate::cache::type_dictionary::{FieldKind, PayloadBuilder, PayloadReader, TypeDictionary, TypeLayout};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Entity, ObjectId, TypeId, TYPE_ID_BASE};
use crate::gigamap::map::{Binding, GigaMap, MapState, SEGMENT_SIZE};
use crate::index::bitmap::BitmapIndex;
use crate::system::manager::StorageManager;

pub const ROOT_TYPE: TypeId = TypeId(TYPE_ID_BASE + 100);
pub const SEGMENT_TYPE: TypeId = TypeId(TYPE_ID_BASE + 101);
pub const INDEX_TYPE: TypeId = TypeId(TYPE_ID_BASE + 102);

/// Registers the layouts of the map entities so that garbage collection can
/// follow a map root to its segments and indices.
pub fn register_types(dictionary: &TypeDictionary) {
    dictionary.register(
        ROOT_TYPE,
        TypeLayout::new(
            "gigamap",
            vec![FieldKind::Primitive(8), FieldKind::ReferenceList, FieldKind::ReferenceList, FieldKind::Bytes],
        ),
    );
    dictionary.register(SEGMENT_TYPE, TypeLayout::new("gigamap_segment", vec![FieldKind::Bytes]));
    dictionary.register(INDEX_TYPE, TypeLayout::new("gigamap_index", vec![FieldKind::Bytes]));
}

/// Segment numbers and index names, parallel to the root's reference lists
#[derive(Debug, Serialize, Deserialize)]
struct RootMeta {
    segments: Vec<u64>,
    indices: Vec<String>,
}

/// `[crc32][lz4 size-prepended bincode]`
fn encode_segment<E: Serialize>(entries: &[(u64, &E)]) -> Result<Vec<u8>> {
    let raw = bincode::serialize(entries)?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    let mut hasher = Hasher::new();
    hasher.update(&compressed);

    let mut bytes = Vec::with_capacity(4 + compressed.len());
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    bytes.extend_from_slice(&compressed);
    Ok(bytes)
}

fn decode_segment<E: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<(u64, E)>> {
    if bytes.len() < 4 {
        return Err(Error::new(ErrorKind::InvalidEntityLength, format!("segment of {} bytes", bytes.len())));
    }
    let (checksum, compressed) = bytes.split_at(4);
    let mut hasher = Hasher::new();
    hasher.update(compressed);
    if hasher.finalize().to_le_bytes() != checksum {
        return Err(Error::consistency("segment checksum mismatch"));
    }
    let raw = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| Error::new(ErrorKind::Parse, format!("segment decompression failed: {}", e)))?;
    Ok(bincode::deserialize(&raw)?)
}

fn bytes_of(entity: &Entity) -> Result<&[u8]> {
    PayloadReader::new(&entity.payload).bytes()
}

impl<E> GigaMap<E>
where
    E: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Object id of the map root, once the map has been stored or loaded
    pub fn root_object_id(&self) -> Option<ObjectId> {
        self.state.read().binding.as_ref().map(|b| b.root)
    }

    /// Writes changed segments and indices plus the map root in one store.
    ///
    /// The first store also registers the root in the storage's root
    /// registry. Mutations wait while a store is in progress; a failed
    /// store keeps everything marked as changed.
    pub fn store(&self, storage: &StorageManager) -> Result<ObjectId> {
        let mut state = self.state.write();
        let fresh = state.binding.is_none();
        let mut binding = state.binding.clone().unwrap_or_else(|| Binding {
            root: ObjectId(0),
            segments: BTreeMap::new(),
            indices: BTreeMap::new(),
        });

        // the segment holding the highest position stays even when empty, so
        // a load can check the position count against the segment list
        let tail = state.next_id().checked_sub(1).map(|last| last / SEGMENT_SIZE);
        let mut segments = Vec::with_capacity(state.dirty_segments.len());
        for &number in &state.dirty_segments {
            let start = number * SEGMENT_SIZE;
            let end = (start + SEGMENT_SIZE).min(state.next_id());
            let entries: Vec<(u64, &E)> = (start..end)
                .filter_map(|p| state.entities[p as usize].as_ref().map(|e| (p, e)))
                .collect();
            let payload = if entries.is_empty() && tail != Some(number) {
                None
            } else {
                Some(encode_segment(&entries)?)
            };
            segments.push((number, payload));
        }

        let mut indices = Vec::with_capacity(state.dirty_indices.len());
        for name in &state.dirty_indices {
            if let Some(index) = state.indices.get(name) {
                indices.push((name.clone(), index.encode()?));
            }
        }

        let needed = usize::from(fresh)
            + segments.iter().filter(|(n, p)| p.is_some() && !binding.segments.contains_key(n)).count()
            + indices.iter().filter(|(n, _)| !binding.indices.contains_key(n)).count();
        let mut fresh_ids = storage.new_object_ids(needed)?.into_iter();
        let mut next_oid = move || {
            fresh_ids.next().ok_or_else(|| Error::new(ErrorKind::Internal, "object id reservation too small".to_string()))
        };
        if fresh {
            binding.root = next_oid()?;
        }

        let mut entities = Vec::with_capacity(segments.len() + indices.len() + 2);
        for (number, payload) in segments {
            match payload {
                Some(payload) => {
                    let oid = match binding.segments.get(&number) {
                        Some(oid) => *oid,
                        None => {
                            let oid = next_oid()?;
                            binding.segments.insert(number, oid);
                            oid
                        }
                    };
                    entities.push(Entity::new(oid, SEGMENT_TYPE, PayloadBuilder::new().bytes(&payload).finish()));
                }
                None => {
                    binding.segments.remove(&number);
                }
            }
        }
        for (name, payload) in indices {
            let oid = match binding.indices.get(&name) {
                Some(oid) => *oid,
                None => {
                    let oid = next_oid()?;
                    binding.indices.insert(name, oid);
                    oid
                }
            };
            entities.push(Entity::new(oid, INDEX_TYPE, PayloadBuilder::new().bytes(&payload).finish()));
        }

        let meta = RootMeta {
            segments: binding.segments.keys().copied().collect(),
            indices: binding.indices.keys().cloned().collect(),
        };
        let segment_oids: Vec<ObjectId> = binding.segments.values().copied().collect();
        let index_oids: Vec<ObjectId> = binding.indices.values().copied().collect();
        let root_payload = PayloadBuilder::new()
            .u64(state.next_id())
            .references(&segment_oids)
            .references(&index_oids)
            .bytes(&bincode::serialize(&meta)?)
            .finish();
        entities.push(Entity::new(binding.root, ROOT_TYPE, root_payload));

        if fresh {
            let mut roots = storage.roots()?;
            if !roots.contains(&binding.root) {
                roots.push(binding.root);
                entities.push(Entity::new(
                    ObjectId::ROOTS,
                    TypeId::ROOTS,
                    PayloadBuilder::new().references(&roots).finish(),
                ));
            }
        }

        let written = entities.len();
        storage.store(entities)?;

        let root = binding.root;
        state.binding = Some(binding);
        state.dirty_segments.clear();
        state.dirty_indices.clear();
        debug!(root = %root, entities = written, "gigamap stored");
        Ok(root)
    }

    /// Loads a stored map. Its indices come back detached: queries and
    /// mutations need [`GigaMap::attach_index`] for each of them first.
    pub fn load(storage: &StorageManager, root: ObjectId) -> Result<Self> {
        let root_entity = storage
            .load(root)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no gigamap root {}", root)))?;
        if root_entity.type_id != ROOT_TYPE {
            return Err(Error::invalid_argument(format!(
                "entity {} has type {}, not a gigamap root", root, root_entity.type_id
            )));
        }

        let mut reader = PayloadReader::new(&root_entity.payload);
        let next_id = reader.u64()?;
        let segment_oids = reader.references()?;
        let index_oids = reader.references()?;
        let meta: RootMeta = bincode::deserialize(reader.bytes()?)?;
        if meta.segments.len() != segment_oids.len() || meta.indices.len() != index_oids.len() {
            return Err(Error::consistency(format!("gigamap root {} metadata does not match its references", root)));
        }

        let mut wanted = segment_oids.clone();
        wanted.extend_from_slice(&index_oids);
        let loaded: HashMap<ObjectId, Entity> = storage
            .load_many(&wanted)?
            .into_iter()
            .map(|e| (e.object_id, e))
            .collect();
        let part = |oid: &ObjectId| {
            loaded
                .get(oid)
                .ok_or_else(|| Error::consistency(format!("gigamap {} misses entity {}", root, oid)))
        };

        let ascending = meta.segments.windows(2).all(|pair| pair[0] < pair[1]);
        let tail = next_id.checked_sub(1).map(|last| last / SEGMENT_SIZE);
        if !ascending || meta.segments.last().copied() != tail {
            return Err(Error::consistency(format!(
                "gigamap root {} claims {} positions but lists segments {:?}",
                root, next_id, meta.segments
            )));
        }

        let mut state = MapState::new();
        let length = usize::try_from(next_id)
            .map_err(|_| Error::consistency(format!("gigamap root {} claims {} positions", root, next_id)))?;
        state.entities.try_reserve_exact(length).map_err(|e| {
            Error::consistency(format!("gigamap root {} claims {} positions: {}", root, next_id, e))
        })?;
        state.entities.resize_with(length, || None);
        for (&number, oid) in meta.segments.iter().zip(&segment_oids) {
            for (position, entity) in decode_segment::<E>(bytes_of(part(oid)?)?)? {
                if position >= next_id || position / SEGMENT_SIZE != number {
                    return Err(Error::consistency(format!(
                        "position {} does not belong to segment {}", position, number
                    )));
                }
                state.entities[position as usize] = Some(entity);
                state.live.insert(position);
            }
        }
        for (name, oid) in meta.indices.iter().zip(&index_oids) {
            let index = BitmapIndex::decode(bytes_of(part(oid)?)?)?;
            if index.name() != name {
                return Err(Error::consistency(format!("index entity {} holds {}, expected {}", oid, index.name(), name)));
            }
            state.indices.insert(name.clone(), index);
        }

        state.binding = Some(Binding {
            root,
            segments: meta.segments.into_iter().zip(segment_oids).collect(),
            indices: meta.indices.into_iter().zip(index_oids).collect(),
        });
        info!(root = %root, entities = state.live.len(), indices = state.indices.len(), "gigamap loaded");
        Ok(GigaMap::from_state(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_checksum_detects_corruption() {
        let a = "first".to_string();
        let b = "second".to_string();
        let mut bytes = encode_segment(&[(0, &a), (5, &b)]).unwrap();
        let decoded: Vec<(u64, String)> = decode_segment(&bytes).unwrap();
        assert_eq!(decoded, vec![(0, a), (5, b)]);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode_segment::<String>(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Consistency);
    }

    #[test]
    fn load_rejects_a_position_count_the_segments_cannot_hold() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::core::config::Config::new(dir.path())
            .with_channel_count(1)
            .with_garbage_collection(false);
        let storage = StorageManager::start(config).unwrap();
        let root = storage.new_object_ids(1).unwrap()[0];
        let none: [ObjectId; 0] = [];
        let meta = bincode::serialize(&RootMeta { segments: Vec::new(), indices: Vec::new() }).unwrap();

        for next_id in [1, 5000, u64::MAX] {
            let payload = PayloadBuilder::new().u64(next_id).references(&none).references(&none).bytes(&meta).finish();
            storage.store(vec![Entity::new(root, ROOT_TYPE, payload)]).unwrap();
            let err = GigaMap::<String>::load(&storage, root).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Consistency);
        }
        storage.shutdown().unwrap();
    }

    #[test]
    fn root_layout_exposes_references() {
        let dictionary = TypeDictionary::new();
        register_types(&dictionary);
        let payload = PayloadBuilder::new()
            .u64(3)
            .references(&[ObjectId(11), ObjectId(12)])
            .references(&[ObjectId(13)])
            .bytes(b"meta")
            .finish();
        let references = dictionary.references_of(ROOT_TYPE, &payload).unwrap();
        assert_eq!(references, vec![ObjectId(11), ObjectId(12), ObjectId(13)]);
    }
}
