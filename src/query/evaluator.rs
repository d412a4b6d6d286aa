use std::collections::BTreeMap;
use roaring::RoaringTreemap;
use tracing::trace;
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::bitmap::BitmapIndex;
use crate::query::condition::Condition;

/// Evaluates conditions to position bitmaps against one map's indices
pub struct ConditionEvaluator<'a, E> {
    indices: &'a BTreeMap<String, BitmapIndex<E>>,
    live: &'a RoaringTreemap,
}

impl<'a, E> ConditionEvaluator<'a, E> {
    pub fn new(indices: &'a BTreeMap<String, BitmapIndex<E>>, live: &'a RoaringTreemap) -> Self {
        ConditionEvaluator { indices, live }
    }

    pub fn evaluate(&self, condition: &Condition) -> Result<RoaringTreemap> {
        match condition {
            Condition::All => Ok(self.live.clone()),
            Condition::Leaf { index, predicate } => {
                let index = self.index(index)?;
                Ok(index.lookup(predicate) & self.live)
            }
            Condition::And(children) => self.intersect(children),
            Condition::Or(children) => {
                let mut result = RoaringTreemap::new();
                for child in children {
                    result |= self.evaluate(child)?;
                }
                Ok(result)
            }
            Condition::Not(inner) => Ok(self.live - self.evaluate(inner)?),
        }
    }

    /// Cheapest operands first; stops as soon as the intersection is empty.
    fn intersect(&self, children: &[Condition]) -> Result<RoaringTreemap> {
        let mut ordered = Vec::with_capacity(children.len());
        for child in children {
            ordered.push((self.cost(child)?, child));
        }
        ordered.sort_by_key(|(cost, _)| *cost);

        let mut result: Option<RoaringTreemap> = None;
        for (evaluated, (_, child)) in ordered.iter().enumerate() {
            let bitmap = self.evaluate(child)?;
            let next = match result {
                Some(current) => current & bitmap,
                None => bitmap,
            };
            if next.is_empty() {
                trace!(skipped = ordered.len() - evaluated - 1, "intersection empty, short-circuiting");
                return Ok(next);
            }
            result = Some(next);
        }
        Ok(result.unwrap_or_else(|| self.live.clone()))
    }

    fn cost(&self, condition: &Condition) -> Result<u64> {
        Ok(match condition {
            Condition::Leaf { index, predicate } => self.index(index)?.estimate(predicate),
            _ => self.live.len(),
        })
    }

    fn index(&self, name: &str) -> Result<&'a BitmapIndex<E>> {
        let index = self
            .indices
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no index named {}", name)))?;
        if !index.is_attached() {
            return Err(Error::invalid_state(format!("index {} has no indexer attached", name)));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::index::indexer::IndexerFn;
    use crate::query::condition::{and, eq, greater_than, not, or};

    fn fixture() -> (BTreeMap<String, BitmapIndex<i64>>, RoaringTreemap) {
        let mut indices = BTreeMap::new();
        let mut value = BitmapIndex::new(Arc::new(IndexerFn::single("value", |v: &i64| *v)), false);
        let mut even = BitmapIndex::new(Arc::new(IndexerFn::single("even", |v: &i64| v % 2 == 0)), false);
        let mut live = RoaringTreemap::new();
        for position in 0..10u64 {
            let entity = position as i64;
            value.internal_add(position, &entity).unwrap();
            even.internal_add(position, &entity).unwrap();
            live.insert(position);
        }
        indices.insert("value".to_string(), value);
        indices.insert("even".to_string(), even);
        (indices, live)
    }

    fn positions(bitmap: RoaringTreemap) -> Vec<u64> {
        bitmap.iter().collect()
    }

    #[test]
    fn boolean_operators() {
        let (indices, live) = fixture();
        let evaluator = ConditionEvaluator::new(&indices, &live);

        let large_even = and([eq("even", true), greater_than("value", 5i64)]);
        assert_eq!(positions(evaluator.evaluate(&large_even).unwrap()), vec![6, 8]);

        let either = or([eq("value", 1i64), eq("value", 2i64)]);
        assert_eq!(positions(evaluator.evaluate(&either).unwrap()), vec![1, 2]);

        let odd = not(eq("even", true));
        assert_eq!(positions(evaluator.evaluate(&odd).unwrap()), vec![1, 3, 5, 7, 9]);

        assert_eq!(evaluator.evaluate(&and(Vec::<Condition>::new())).unwrap().len(), 10);
        assert!(evaluator.evaluate(&or(Vec::<Condition>::new())).unwrap().is_empty());
    }

    #[test]
    fn empty_intersection_skips_remaining_operands() {
        let (indices, live) = fixture();
        let evaluator = ConditionEvaluator::new(&indices, &live);
        // the unknown index is never reached once the cheap operand is empty
        let condition = and([eq("value", 42i64), eq("value", 1i64).and(eq("missing", 1i64))]);
        assert!(evaluator.evaluate(&condition).unwrap().is_empty());

        let err = evaluator.evaluate(&eq("missing", 1i64)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn removed_positions_are_excluded() {
        let (indices, mut live) = fixture();
        live.remove(4);
        let evaluator = ConditionEvaluator::new(&indices, &live);
        assert!(evaluator.evaluate(&eq("value", 4i64)).unwrap().is_empty());
        assert!(!evaluator.evaluate(&not(eq("value", 0i64))).unwrap().contains(4));
    }
}
