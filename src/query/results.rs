use std::sync::Arc;
use roaring::RoaringTreemap;

/// Resolves result positions to entities at iteration time
pub trait EntityResolver<E>: Send + Sync {
    /// `None` if the position was removed since the query ran
    fn resolve(&self, position: u64) -> Option<E>;
}

/// Lazy, forward-only iterator over the entities of a query result.
///
/// Only the position bitmap is computed up front. Each entity is resolved
/// when the iterator reaches it, so removals that happen meanwhile are
/// skipped.
pub struct QueryResults<E> {
    positions: <RoaringTreemap as IntoIterator>::IntoIter,
    total: u64,
    resolver: Arc<dyn EntityResolver<E>>,
}

impl<E> QueryResults<E> {
    pub fn new(positions: RoaringTreemap, resolver: Arc<dyn EntityResolver<E>>) -> Self {
        QueryResults {
            total: positions.len(),
            positions: positions.into_iter(),
            resolver,
        }
    }

    /// Positions matched when the query ran
    pub fn matched(&self) -> u64 {
        self.total
    }

    /// Pairs every entity with its position
    pub fn with_ids(self) -> impl Iterator<Item = (u64, E)> {
        let resolver = self.resolver;
        self.positions.filter_map(move |p| resolver.resolve(p).map(|e| (p, e)))
    }
}

impl<E> Iterator for QueryResults<E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        for position in self.positions.by_ref() {
            if let Some(entity) = self.resolver.resolve(position) {
                return Some(entity);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.positions.size_hint().1)
    }
}
