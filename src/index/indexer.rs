use std::marker::PhantomData;
use crate::index::key::{IndexKey, KeyType, KeyValue};

/// Extracts the index keys of an entity.
///
/// An empty key list means the entity is null for this index. Multi-valued
/// indexers return one key per value; the entity's position is then set in
/// every key's bitmap.
pub trait Indexer<E>: Send + Sync {
    /// Stable name the index is registered and persisted under
    fn name(&self) -> &str;

    fn key_type(&self) -> KeyType;

    fn index(&self, entity: &E) -> Vec<IndexKey>;
}

type KeyFn<E> = Box<dyn Fn(&E) -> Vec<IndexKey> + Send + Sync>;

/// Closure-backed indexer
pub struct IndexerFn<E> {
    name: String,
    key_type: KeyType,
    extract: KeyFn<E>,
    _entity: PhantomData<fn(&E)>,
}

impl<E: 'static> IndexerFn<E> {
    pub fn new(
        name: impl Into<String>,
        key_type: KeyType,
        extract: impl Fn(&E) -> Vec<IndexKey> + Send + Sync + 'static,
    ) -> Self {
        IndexerFn {
            name: name.into(),
            key_type,
            extract: Box::new(extract),
            _entity: PhantomData,
        }
    }

    /// Exactly one key per entity
    pub fn single<K: KeyValue + 'static>(
        name: impl Into<String>,
        extract: impl Fn(&E) -> K + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, K::KEY_TYPE, move |entity| vec![extract(entity).into()])
    }

    /// `None` indexes the entity as null
    pub fn optional<K: KeyValue + 'static>(
        name: impl Into<String>,
        extract: impl Fn(&E) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, K::KEY_TYPE, move |entity| {
            extract(entity).map(|key| vec![key.into()]).unwrap_or_default()
        })
    }

    pub fn multi<K: KeyValue + 'static>(
        name: impl Into<String>,
        extract: impl Fn(&E) -> Vec<K> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, K::KEY_TYPE, move |entity| {
            extract(entity).into_iter().map(Into::into).collect()
        })
    }
}

impl<E> Indexer<E> for IndexerFn<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn index(&self, entity: &E) -> Vec<IndexKey> {
        let mut keys = (self.extract)(entity);
        keys.sort();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Person {
        name: String,
        email: Option<String>,
        tags: Vec<&'static str>,
    }

    #[test]
    fn closure_indexers() {
        let person = Person {
            name: "Ada".to_string(),
            email: None,
            tags: vec!["b", "a", "b"],
        };

        let by_name = IndexerFn::single("name", |p: &Person| p.name.clone());
        assert_eq!(by_name.key_type(), KeyType::String);
        assert_eq!(by_name.index(&person), vec![IndexKey::from("Ada")]);

        let by_email = IndexerFn::optional("email", |p: &Person| p.email.clone());
        assert!(by_email.index(&person).is_empty());

        let by_tag = IndexerFn::multi("tags", |p: &Person| p.tags.clone());
        assert_eq!(by_tag.index(&person), vec![IndexKey::from("a"), IndexKey::from("b")]);
    }
}
