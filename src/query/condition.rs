use std::ops::Bound;
use serde::{Serialize, Deserialize};
use crate::index::key::IndexKey;

/// Test applied to the keys of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Equals(IndexKey),
    In(Vec<IndexKey>),
    Range { lower: Bound<IndexKey>, upper: Bound<IndexKey> },
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    IsNull,
    NotNull,
}

/// Boolean tree of index predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Every live position
    All,
    Leaf { index: String, predicate: Predicate },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn leaf(index: impl Into<String>, predicate: Predicate) -> Self {
        Condition::Leaf { index: index.into(), predicate }
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(vec![self, other])
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(vec![self, other])
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }
}

impl std::ops::Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        self.negate()
    }
}

pub fn eq(index: impl Into<String>, key: impl Into<IndexKey>) -> Condition {
    Condition::leaf(index, Predicate::Equals(key.into()))
}

pub fn is_in<K: Into<IndexKey>>(index: impl Into<String>, keys: impl IntoIterator<Item = K>) -> Condition {
    Condition::leaf(index, Predicate::In(keys.into_iter().map(Into::into).collect()))
}

pub fn range<K: Into<IndexKey>>(index: impl Into<String>, lower: Bound<K>, upper: Bound<K>) -> Condition {
    Condition::leaf(index, Predicate::Range { lower: map_bound(lower), upper: map_bound(upper) })
}

/// `lower <= key <= upper`
pub fn between(index: impl Into<String>, lower: impl Into<IndexKey>, upper: impl Into<IndexKey>) -> Condition {
    Condition::leaf(index, Predicate::Range {
        lower: Bound::Included(lower.into()),
        upper: Bound::Included(upper.into()),
    })
}

pub fn greater_than(index: impl Into<String>, key: impl Into<IndexKey>) -> Condition {
    Condition::leaf(index, Predicate::Range { lower: Bound::Excluded(key.into()), upper: Bound::Unbounded })
}

pub fn less_than(index: impl Into<String>, key: impl Into<IndexKey>) -> Condition {
    Condition::leaf(index, Predicate::Range { lower: Bound::Unbounded, upper: Bound::Excluded(key.into()) })
}

pub fn starts_with(index: impl Into<String>, prefix: impl Into<String>) -> Condition {
    Condition::leaf(index, Predicate::StartsWith(prefix.into()))
}

pub fn ends_with(index: impl Into<String>, suffix: impl Into<String>) -> Condition {
    Condition::leaf(index, Predicate::EndsWith(suffix.into()))
}

pub fn contains(index: impl Into<String>, infix: impl Into<String>) -> Condition {
    Condition::leaf(index, Predicate::Contains(infix.into()))
}

pub fn is_null(index: impl Into<String>) -> Condition {
    Condition::leaf(index, Predicate::IsNull)
}

pub fn not_null(index: impl Into<String>) -> Condition {
    Condition::leaf(index, Predicate::NotNull)
}

pub fn and(conditions: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::And(conditions.into_iter().collect())
}

pub fn or(conditions: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::Or(conditions.into_iter().collect())
}

pub fn not(condition: Condition) -> Condition {
    condition.negate()
}

fn map_bound<K: Into<IndexKey>>(bound: Bound<K>) -> Bound<IndexKey> {
    match bound {
        Bound::Included(k) => Bound::Included(k.into()),
        Bound::Excluded(k) => Bound::Excluded(k.into()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_compose() {
        let condition = eq("city", "Oslo").and(!between("age", 18i64, 30i64));
        match condition {
            Condition::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Condition::Not(_)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let bounded = range("age", Bound::Included(1i64), Bound::Unbounded);
        assert_eq!(
            bounded,
            Condition::leaf("age", Predicate::Range { lower: Bound::Included(IndexKey::Integer(1)), upper: Bound::Unbounded })
        );
    }
}
