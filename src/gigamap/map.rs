use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Range;
use std::sync::Arc;
use parking_lot::RwLock;
use rayon::prelude::*;
use roaring::RoaringTreemap;
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ObjectId;
use crate::index::bitmap::BitmapIndex;
use crate::index::constraint::Constraint;
use crate::index::indexer::Indexer;
use crate::index::key::IndexKey;
use crate::query::condition::Condition;
use crate::query::evaluator::ConditionEvaluator;
use crate::query::optimizer::QueryOptimizer;
use crate::query::results::{EntityResolver, QueryResults};

/// Positions per persisted segment
pub const SEGMENT_SIZE: u64 = 1024;

/// Object ids a map was last stored under
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub root: ObjectId,
    pub segments: BTreeMap<u64, ObjectId>,
    pub indices: BTreeMap<String, ObjectId>,
}

pub(crate) struct MapState<E> {
    /// Slot per position ever handed out; positions are never reused
    pub entities: Vec<Option<E>>,
    pub live: RoaringTreemap,
    pub indices: BTreeMap<String, BitmapIndex<E>>,
    pub constraints: Vec<Arc<dyn Constraint<E>>>,
    pub dirty_segments: BTreeSet<u64>,
    pub dirty_indices: BTreeSet<String>,
    pub binding: Option<Binding>,
}

impl<E> MapState<E> {
    pub fn new() -> Self {
        MapState {
            entities: Vec::new(),
            live: RoaringTreemap::new(),
            indices: BTreeMap::new(),
            constraints: Vec::new(),
            dirty_segments: BTreeSet::new(),
            dirty_indices: BTreeSet::new(),
            binding: None,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.entities.len() as u64
    }

    fn entity(&self, position: u64) -> Option<&E> {
        self.entities.get(position as usize).and_then(Option::as_ref)
    }

    /// Runs every check for placing `candidate` at `position` and returns
    /// its keys per index, in index order. Nothing is modified.
    fn prepare(&self, position: u64, current: Option<&E>, candidate: &E) -> Result<Vec<Vec<IndexKey>>> {
        for constraint in &self.constraints {
            constraint.check(position, current, candidate)?;
        }
        let mut keys = Vec::with_capacity(self.indices.len());
        for index in self.indices.values() {
            let entity_keys = index.keys_of(candidate)?;
            index.check_unique(position, &entity_keys)?;
            keys.push(entity_keys);
        }
        Ok(keys)
    }

    fn keys_of(&self, entity: &E) -> Result<Vec<Vec<IndexKey>>> {
        self.indices.values().map(|index| index.keys_of(entity)).collect()
    }

    fn insert_keys(&mut self, position: u64, keys: &[Vec<IndexKey>]) {
        for (index, entity_keys) in self.indices.values_mut().zip(keys) {
            index.insert_keys(position, entity_keys);
        }
    }

    fn remove_keys(&mut self, position: u64, keys: &[Vec<IndexKey>]) {
        for (index, entity_keys) in self.indices.values_mut().zip(keys) {
            index.remove_keys(position, entity_keys);
        }
    }

    fn mark_dirty(&mut self, position: u64) {
        self.dirty_segments.insert(position / SEGMENT_SIZE);
        for name in self.indices.keys() {
            if !self.dirty_indices.contains(name) {
                self.dirty_indices.insert(name.clone());
            }
        }
    }

    fn evaluate(&self, optimizer: &QueryOptimizer, condition: &Condition) -> Result<RoaringTreemap> {
        let optimized = optimizer.optimize(condition.clone());
        ConditionEvaluator::new(&self.indices, &self.live).evaluate(&optimized)
    }
}

struct MapResolver<E> {
    state: Arc<RwLock<MapState<E>>>,
}

impl<E: Clone + Send + Sync> EntityResolver<E> for MapResolver<E> {
    fn resolve(&self, position: u64) -> Option<E> {
        self.state.read().entity(position).cloned()
    }
}

/// Indexed collection of entities addressed by stable, monotonic positions.
///
/// Every registered index is updated synchronously with each mutation under
/// the map's write lock. Mutations are checked completely (constraints,
/// unique indices, indexer availability) before anything changes, so a
/// rejected mutation leaves entities and indices untouched.
pub struct GigaMap<E> {
    pub(crate) state: Arc<RwLock<MapState<E>>>,
    optimizer: Arc<QueryOptimizer>,
}

impl<E> Clone for GigaMap<E> {
    fn clone(&self) -> Self {
        GigaMap { state: self.state.clone(), optimizer: self.optimizer.clone() }
    }
}

impl<E> std::fmt::Debug for GigaMap<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GigaMap").finish_non_exhaustive()
    }
}

impl<E: Clone + Send + Sync + 'static> Default for GigaMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync + 'static> GigaMap<E> {
    pub fn new() -> Self {
        Self::from_state(MapState::new())
    }

    pub(crate) fn from_state(state: MapState<E>) -> Self {
        GigaMap {
            state: Arc::new(RwLock::new(state)),
            optimizer: Arc::new(QueryOptimizer::new()),
        }
    }

    pub fn register_index(&self, indexer: impl Indexer<E> + 'static) -> Result<()> {
        self.register(Arc::new(indexer), false)
    }

    /// Registers an identity index: at most one position per key.
    pub fn register_unique_index(&self, indexer: impl Indexer<E> + 'static) -> Result<()> {
        self.register(Arc::new(indexer), true)
    }

    fn register(&self, indexer: Arc<dyn Indexer<E>>, unique: bool) -> Result<()> {
        let mut state = self.state.write();
        let name = indexer.name().to_string();
        if state.indices.contains_key(&name) {
            return Err(Error::invalid_argument(format!("index {} already registered", name)));
        }

        let mut index = BitmapIndex::new(indexer, unique);
        let computed: Vec<(u64, Vec<IndexKey>)> = state
            .entities
            .par_iter()
            .enumerate()
            .filter_map(|(position, entity)| {
                entity.as_ref().map(|e| index.keys_of(e).map(|keys| (position as u64, keys)))
            })
            .collect::<Result<_>>()?;
        for (position, keys) in &computed {
            index.check_unique(*position, keys)?;
            index.insert_keys(*position, keys);
        }

        debug!(index = %name, unique, entities = computed.len(), "index registered");
        state.indices.insert(name.clone(), index);
        state.dirty_indices.insert(name);
        Ok(())
    }

    pub fn unregister_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.indices.remove(name).is_none() {
            return Err(Error::new(ErrorKind::NotFound, format!("no index named {}", name)));
        }
        state.dirty_indices.remove(name);
        if let Some(binding) = state.binding.as_mut() {
            binding.indices.remove(name);
        }
        debug!(index = %name, "index unregistered");
        Ok(())
    }

    /// Gives a reloaded index its key extraction back.
    pub fn attach_index(&self, indexer: impl Indexer<E> + 'static) -> Result<()> {
        let mut state = self.state.write();
        let name = indexer.name().to_string();
        let index = state
            .indices
            .get_mut(&name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no index named {}", name)))?;
        index.attach(Arc::new(indexer))
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.read().indices.keys().cloned().collect()
    }

    pub fn is_index_attached(&self, name: &str) -> bool {
        self.state.read().indices.get(name).is_some_and(|index| index.is_attached())
    }

    pub fn add_constraint(&self, constraint: impl Constraint<E> + 'static) {
        self.state.write().constraints.push(Arc::new(constraint));
    }

    pub fn add(&self, entity: E) -> Result<u64> {
        let mut state = self.state.write();
        let position = state.next_id();
        let keys = state.prepare(position, None, &entity)?;
        state.insert_keys(position, &keys);
        state.entities.push(Some(entity));
        state.live.insert(position);
        state.mark_dirty(position);
        Ok(position)
    }

    /// Adds all entities or none of them.
    pub fn add_all(&self, entities: impl IntoIterator<Item = E>) -> Result<Range<u64>> {
        let entities: Vec<E> = entities.into_iter().collect();
        let mut state = self.state.write();
        let first = state.next_id();

        let unique: Vec<bool> = state.indices.values().map(|index| index.is_unique()).collect();
        let mut seen: Vec<HashSet<IndexKey>> = vec![HashSet::new(); unique.len()];
        let mut prepared = Vec::with_capacity(entities.len());
        for (offset, entity) in entities.iter().enumerate() {
            let position = first + offset as u64;
            let keys = state.prepare(position, None, entity)?;
            for (i, entity_keys) in keys.iter().enumerate() {
                if !unique[i] {
                    continue;
                }
                for key in entity_keys {
                    if !seen[i].insert(key.clone()) {
                        return Err(Error::constraint(format!("batch contains {} twice for a unique index", key)));
                    }
                }
            }
            prepared.push(keys);
        }

        for (offset, (entity, keys)) in entities.into_iter().zip(prepared).enumerate() {
            let position = first + offset as u64;
            state.insert_keys(position, &keys);
            state.entities.push(Some(entity));
            state.live.insert(position);
            state.mark_dirty(position);
        }
        Ok(first..state.next_id())
    }

    pub fn get(&self, id: u64) -> Option<E> {
        self.state.read().entity(id).cloned()
    }

    /// Number of live entities
    pub fn size(&self) -> u64 {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().live.is_empty()
    }

    /// Highest position ever handed out, removed or not
    pub fn highest_used_id(&self) -> Option<u64> {
        self.state.read().next_id().checked_sub(1)
    }

    pub fn remove_by_id(&self, id: u64) -> Result<Option<E>> {
        let mut state = self.state.write();
        let keys = match state.entity(id) {
            Some(entity) => state.keys_of(entity)?,
            None => return Ok(None),
        };
        state.remove_keys(id, &keys);
        state.live.remove(id);
        state.mark_dirty(id);
        Ok(state.entities[id as usize].take())
    }

    /// Puts `entity` at `id` and returns the entity it replaced.
    pub fn replace(&self, id: u64, entity: E) -> Result<E> {
        let mut state = self.state.write();
        let (old_keys, new_keys) = {
            let current = state.entity(id).ok_or_else(|| not_found(id))?;
            let new_keys = state.prepare(id, Some(current), &entity)?;
            (state.keys_of(current)?, new_keys)
        };
        if old_keys != new_keys {
            state.remove_keys(id, &old_keys);
            state.insert_keys(id, &new_keys);
        }
        state.mark_dirty(id);
        state.entities[id as usize].replace(entity).ok_or_else(|| not_found(id))
    }

    /// Applies `mutator` to a copy of the entity at `id` and replaces it with
    /// the result. A rejected update leaves the stored entity unchanged.
    pub fn update<R>(&self, id: u64, mutator: impl FnOnce(&mut E) -> R) -> Result<R> {
        let mut state = self.state.write();
        let (updated, result, old_keys, new_keys) = {
            let current = state.entity(id).ok_or_else(|| not_found(id))?;
            let mut updated = current.clone();
            let result = mutator(&mut updated);
            let new_keys = state.prepare(id, Some(current), &updated)?;
            (updated, result, state.keys_of(current)?, new_keys)
        };
        if old_keys != new_keys {
            state.remove_keys(id, &old_keys);
            state.insert_keys(id, &new_keys);
        }
        state.entities[id as usize] = Some(updated);
        state.mark_dirty(id);
        Ok(result)
    }

    /// Entity and position holding `key` in the unique index `index`
    pub fn find_by_key(&self, index: &str, key: impl Into<IndexKey>) -> Result<Option<(u64, E)>> {
        let state = self.state.read();
        let index = state
            .indices
            .get(index)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no index named {}", index)))?;
        let position = index.find_by_key(&key.into())?;
        Ok(position.and_then(|p| state.entity(p).cloned().map(|e| (p, e))))
    }

    pub fn query(&self) -> GigaQuery<'_, E> {
        GigaQuery { map: self, condition: Condition::All }
    }

    pub fn query_with(&self, condition: Condition) -> GigaQuery<'_, E> {
        GigaQuery { map: self, condition }
    }

    /// Every live entity, lazily resolved
    pub fn iter(&self) -> Result<QueryResults<E>> {
        self.query().execute()
    }

    fn positions(&self, condition: &Condition) -> Result<RoaringTreemap> {
        self.state.read().evaluate(&self.optimizer, condition)
    }

    fn results(&self, positions: RoaringTreemap) -> QueryResults<E> {
        let resolver: Arc<dyn EntityResolver<E>> = Arc::new(MapResolver { state: self.state.clone() });
        QueryResults::new(positions, resolver)
    }
}

fn not_found(id: u64) -> Error {
    Error::new(ErrorKind::NotFound, format!("no entity at position {}", id))
}

/// Query under construction; nothing is evaluated before a terminal call.
pub struct GigaQuery<'m, E> {
    map: &'m GigaMap<E>,
    condition: Condition,
}

impl<'m, E: Clone + Send + Sync + 'static> GigaQuery<'m, E> {
    pub fn and(mut self, condition: Condition) -> Self {
        self.condition = match self.condition {
            Condition::All => condition,
            current => current.and(condition),
        };
        self
    }

    pub fn or(mut self, condition: Condition) -> Self {
        self.condition = match self.condition {
            Condition::All => Condition::All,
            current => current.or(condition),
        };
        self
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn execute(&self) -> Result<QueryResults<E>> {
        let positions = self.map.positions(&self.condition)?;
        Ok(self.map.results(positions))
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.map.positions(&self.condition)?.len())
    }

    pub fn ids(&self) -> Result<Vec<u64>> {
        Ok(self.map.positions(&self.condition)?.iter().collect())
    }

    pub fn first(&self) -> Result<Option<E>> {
        Ok(self.execute()?.next())
    }

    pub fn limit(&self, limit: usize) -> Result<Vec<E>> {
        Ok(self.execute()?.take(limit).collect())
    }

    pub fn to_vec(&self) -> Result<Vec<E>> {
        Ok(self.execute()?.collect())
    }
}
