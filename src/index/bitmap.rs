use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use roaring::RoaringTreemap;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::indexer::Indexer;
use crate::index::key::{IndexKey, KeyType};
use crate::query::condition::Predicate;

/// Persistent description of an index, kept when the indexer is not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub key_type: KeyType,
    pub unique: bool,
}

#[derive(Serialize, Deserialize)]
struct IndexImage {
    meta: IndexMeta,
    entries: Vec<(IndexKey, Vec<u8>)>,
    nulls: Vec<u8>,
}

/// Maps index keys to the bitmap of positions holding them.
///
/// Positions without any key are kept in a separate null bitmap so that
/// `IsNull` and `NotNull` need no full scan. A reloaded index has its bitmaps
/// but no indexer until one is attached again.
pub struct BitmapIndex<E> {
    meta: IndexMeta,
    entries: BTreeMap<IndexKey, RoaringTreemap>,
    nulls: RoaringTreemap,
    indexer: Option<Arc<dyn Indexer<E>>>,
}

impl<E> BitmapIndex<E> {
    pub fn new(indexer: Arc<dyn Indexer<E>>, unique: bool) -> Self {
        BitmapIndex {
            meta: IndexMeta {
                name: indexer.name().to_string(),
                key_type: indexer.key_type(),
                unique,
            },
            entries: BTreeMap::new(),
            nulls: RoaringTreemap::new(),
            indexer: Some(indexer),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn key_type(&self) -> KeyType {
        self.meta.key_type
    }

    pub fn is_unique(&self) -> bool {
        self.meta.unique
    }

    pub fn is_attached(&self) -> bool {
        self.indexer.is_some()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Re-attaches the key extraction of a reloaded index.
    pub fn attach(&mut self, indexer: Arc<dyn Indexer<E>>) -> Result<()> {
        if indexer.name() != self.meta.name || indexer.key_type() != self.meta.key_type {
            return Err(Error::invalid_argument(format!(
                "indexer {} ({:?}) does not match index {} ({:?})",
                indexer.name(), indexer.key_type(), self.meta.name, self.meta.key_type
            )));
        }
        self.indexer = Some(indexer);
        Ok(())
    }

    pub fn keys_of(&self, entity: &E) -> Result<Vec<IndexKey>> {
        let indexer = self.indexer.as_ref().ok_or_else(|| {
            Error::invalid_state(format!("index {} has no indexer attached", self.meta.name))
        })?;
        let keys = indexer.index(entity);
        if let Some(wrong) = keys.iter().find(|k| k.key_type() != self.meta.key_type) {
            return Err(Error::invalid_argument(format!(
                "index {} expects {:?} keys, got {}", self.meta.name, self.meta.key_type, wrong
            )));
        }
        Ok(keys)
    }

    /// Fails if a unique index already holds one of `keys` at another position.
    pub fn check_unique(&self, position: u64, keys: &[IndexKey]) -> Result<()> {
        if !self.meta.unique {
            return Ok(());
        }
        for key in keys {
            if let Some(holders) = self.entries.get(key) {
                if holders.iter().any(|p| p != position) {
                    return Err(Error::constraint(format!(
                        "unique index {} already contains {}", self.meta.name, key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn insert_keys(&mut self, position: u64, keys: &[IndexKey]) {
        if keys.is_empty() {
            self.nulls.insert(position);
            return;
        }
        for key in keys {
            self.entries.entry(key.clone()).or_default().insert(position);
        }
    }

    pub fn remove_keys(&mut self, position: u64, keys: &[IndexKey]) {
        if keys.is_empty() {
            self.nulls.remove(position);
            return;
        }
        for key in keys {
            if let Some(bitmap) = self.entries.get_mut(key) {
                bitmap.remove(position);
                if bitmap.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
    }

    pub fn internal_add(&mut self, position: u64, entity: &E) -> Result<()> {
        let keys = self.keys_of(entity)?;
        self.check_unique(position, &keys)?;
        self.insert_keys(position, &keys);
        Ok(())
    }

    pub fn internal_remove(&mut self, position: u64, entity: &E) -> Result<()> {
        let keys = self.keys_of(entity)?;
        self.remove_keys(position, &keys);
        Ok(())
    }

    pub fn internal_update(&mut self, position: u64, old: &E, new: &E) -> Result<()> {
        let old_keys = self.keys_of(old)?;
        let new_keys = self.keys_of(new)?;
        self.check_unique(position, &new_keys)?;
        if old_keys != new_keys {
            self.remove_keys(position, &old_keys);
            self.insert_keys(position, &new_keys);
        }
        Ok(())
    }

    pub fn positions(&self, key: &IndexKey) -> RoaringTreemap {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Position holding `key` in a unique index
    pub fn find_by_key(&self, key: &IndexKey) -> Result<Option<u64>> {
        if !self.meta.unique {
            return Err(Error::invalid_argument(format!("index {} is not unique", self.meta.name)));
        }
        Ok(self.entries.get(key).and_then(|bitmap| bitmap.min()))
    }

    pub fn lookup(&self, predicate: &Predicate) -> RoaringTreemap {
        match predicate {
            Predicate::Equals(key) => self.positions(key),
            Predicate::In(keys) => {
                let mut result = RoaringTreemap::new();
                for key in keys {
                    if let Some(bitmap) = self.entries.get(key) {
                        result |= bitmap;
                    }
                }
                result
            }
            Predicate::Range { lower, upper } => {
                let mut result = RoaringTreemap::new();
                if range_is_empty(lower, upper) {
                    return result;
                }
                for (_, bitmap) in self.entries.range((lower.clone(), upper.clone())) {
                    result |= bitmap;
                }
                result
            }
            Predicate::StartsWith(prefix) => {
                let mut result = RoaringTreemap::new();
                let start = IndexKey::String(prefix.clone());
                for (key, bitmap) in self.entries.range(start..) {
                    match key.as_str() {
                        Some(s) if s.starts_with(prefix.as_str()) => result |= bitmap,
                        _ => break,
                    }
                }
                result
            }
            Predicate::EndsWith(suffix) => self.scan_strings(|s| s.ends_with(suffix.as_str())),
            Predicate::Contains(infix) => self.scan_strings(|s| s.contains(infix.as_str())),
            Predicate::IsNull => self.nulls.clone(),
            Predicate::NotNull => {
                let mut result = RoaringTreemap::new();
                for bitmap in self.entries.values() {
                    result |= bitmap;
                }
                result
            }
        }
    }

    /// Upper bound of the result size, used to order AND operands.
    pub fn estimate(&self, predicate: &Predicate) -> u64 {
        match predicate {
            Predicate::Equals(key) => self.entries.get(key).map_or(0, |b| b.len()),
            Predicate::In(keys) => keys
                .iter()
                .map(|k| self.entries.get(k).map_or(0, |b| b.len()))
                .sum(),
            Predicate::IsNull => self.nulls.len(),
            _ => self.entries.values().map(|b| b.len()).sum(),
        }
    }

    fn scan_strings(&self, matches: impl Fn(&str) -> bool) -> RoaringTreemap {
        let mut result = RoaringTreemap::new();
        for (key, bitmap) in &self.entries {
            if key.as_str().is_some_and(&matches) {
                result |= bitmap;
            }
        }
        result
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (key, bitmap) in &self.entries {
            entries.push((key.clone(), serialize_bitmap(bitmap)?));
        }
        let image = IndexImage {
            meta: self.meta.clone(),
            entries,
            nulls: serialize_bitmap(&self.nulls)?,
        };
        Ok(bincode::serialize(&image)?)
    }

    /// Restores an index without indexer; see [`BitmapIndex::attach`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image: IndexImage = bincode::deserialize(bytes)?;
        let mut entries = BTreeMap::new();
        for (key, bitmap) in image.entries {
            entries.insert(key, deserialize_bitmap(&bitmap)?);
        }
        Ok(BitmapIndex {
            meta: image.meta,
            entries,
            nulls: deserialize_bitmap(&image.nulls)?,
            indexer: None,
        })
    }
}

fn range_is_empty(lower: &Bound<IndexKey>, upper: &Bound<IndexKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

fn serialize_bitmap(bitmap: &RoaringTreemap) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut bytes)?;
    Ok(bytes)
}

fn deserialize_bitmap(bytes: &[u8]) -> Result<RoaringTreemap> {
    RoaringTreemap::deserialize_from(bytes)
        .map_err(|e| Error::new(ErrorKind::Parse, format!("corrupt bitmap: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::indexer::IndexerFn;

    fn by_value() -> BitmapIndex<(i64, &'static str)> {
        BitmapIndex::new(Arc::new(IndexerFn::single("value", |e: &(i64, &'static str)| e.0)), false)
    }

    fn by_name(unique: bool) -> BitmapIndex<(i64, &'static str)> {
        BitmapIndex::new(Arc::new(IndexerFn::single("name", |e: &(i64, &'static str)| e.1)), unique)
    }

    fn positions(bitmap: RoaringTreemap) -> Vec<u64> {
        bitmap.iter().collect()
    }

    #[test]
    fn equality_and_ranges() {
        let mut index = by_value();
        for (position, value) in [(0, 10), (1, 20), (2, 20), (3, 30)] {
            index.internal_add(position, &(value, "x")).unwrap();
        }

        assert_eq!(positions(index.lookup(&Predicate::Equals(20i64.into()))), vec![1, 2]);
        assert_eq!(
            positions(index.lookup(&Predicate::In(vec![10i64.into(), 30i64.into(), 99i64.into()]))),
            vec![0, 3]
        );
        let range = Predicate::Range {
            lower: Bound::Excluded(10i64.into()),
            upper: Bound::Included(30i64.into()),
        };
        assert_eq!(positions(index.lookup(&range)), vec![1, 2, 3]);
        let inverted = Predicate::Range {
            lower: Bound::Included(30i64.into()),
            upper: Bound::Excluded(10i64.into()),
        };
        assert!(index.lookup(&inverted).is_empty());

        index.internal_update(1, &(20, "x"), &(40, "x")).unwrap();
        assert_eq!(positions(index.lookup(&Predicate::Equals(20i64.into()))), vec![2]);
        index.internal_remove(2, &(20, "x")).unwrap();
        assert!(index.lookup(&Predicate::Equals(20i64.into())).is_empty());
        assert_eq!(index.key_count(), 3);
    }

    #[test]
    fn string_predicates() {
        let mut index = by_name(false);
        for (position, name) in [(0, "alpha"), (1, "alphabet"), (2, "beta"), (3, "gamma")] {
            index.internal_add(position, &(0, name)).unwrap();
        }
        assert_eq!(positions(index.lookup(&Predicate::StartsWith("alp".into()))), vec![0, 1]);
        assert_eq!(positions(index.lookup(&Predicate::EndsWith("ta".into()))), vec![2]);
        assert_eq!(positions(index.lookup(&Predicate::Contains("mm".into()))), vec![3]);
        assert_eq!(positions(index.lookup(&Predicate::NotNull)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut index = by_name(true);
        index.internal_add(0, &(0, "a")).unwrap();
        let err = index.internal_add(1, &(0, "a")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConstraintViolation);
        assert!(index.lookup(&Predicate::Equals("a".into())).contains(0));
        assert!(!index.lookup(&Predicate::Equals("a".into())).contains(1));

        // updating an entity to its own key is fine
        index.internal_update(0, &(0, "a"), &(1, "a")).unwrap();
        assert_eq!(index.find_by_key(&"a".into()).unwrap(), Some(0));
        assert_eq!(index.find_by_key(&"b".into()).unwrap(), None);
    }

    #[test]
    fn nulls_are_tracked_separately() {
        let indexer = IndexerFn::optional("maybe", |e: &Option<i64>| *e);
        let mut index = BitmapIndex::new(Arc::new(indexer), false);
        index.internal_add(0, &Some(1)).unwrap();
        index.internal_add(1, &None).unwrap();
        assert_eq!(positions(index.lookup(&Predicate::IsNull)), vec![1]);
        assert_eq!(positions(index.lookup(&Predicate::NotNull)), vec![0]);
    }

    #[test]
    fn decoded_index_needs_an_indexer() {
        let mut index = by_value();
        index.internal_add(7, &(5, "x")).unwrap();
        index.internal_add(9, &(6, "x")).unwrap();

        let mut restored: BitmapIndex<(i64, &'static str)> = BitmapIndex::decode(&index.encode().unwrap()).unwrap();
        assert!(!restored.is_attached());
        assert_eq!(positions(restored.lookup(&Predicate::Equals(5i64.into()))), vec![7]);
        assert_eq!(restored.internal_add(10, &(5, "x")).unwrap_err().kind, ErrorKind::InvalidState);

        let wrong = IndexerFn::single("value", |e: &(i64, &'static str)| e.1);
        assert!(restored.attach(Arc::new(wrong)).is_err());
        restored.attach(Arc::new(IndexerFn::single("value", |e: &(i64, &'static str)| e.0))).unwrap();
        restored.internal_add(10, &(5, "x")).unwrap();
        assert_eq!(positions(restored.lookup(&Predicate::Equals(5i64.into()))), vec![7, 10]);
    }
}
