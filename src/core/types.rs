use std::fmt;
use serde::{Serialize, Deserialize};

pub const TYPE_ID_BASE: u64 = 1_000_000;
pub const OBJECT_ID_BASE: u64 = 1_000_000_000_000_000_000;
pub const CONSTANT_ID_BASE: u64 = 9_000_000_000_000_000_000;

/// Persistent object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Reserved constant id of the root registry entity.
    pub const ROOTS: ObjectId = ObjectId(CONSTANT_ID_BASE + 1);

    pub fn new(id: u64) -> Self {
        ObjectId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_type_id_range(&self) -> bool {
        self.0 >= TYPE_ID_BASE && self.0 < OBJECT_ID_BASE
    }

    pub fn is_constant_range(&self) -> bool {
        self.0 >= CONSTANT_ID_BASE
    }

    pub fn is_object_range(&self) -> bool {
        self.0 >= OBJECT_ID_BASE && self.0 < CONSTANT_ID_BASE
    }

    /// Channel owning this object. `channel_count` must be a power of two.
    pub fn channel(&self, channel_count: usize) -> usize {
        (self.0 & (channel_count as u64 - 1)) as usize
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        ObjectId(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structural type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u64);

impl TypeId {
    pub const ROOTS: TypeId = TypeId(TYPE_ID_BASE + 1);

    pub fn new(id: u64) -> Self {
        TypeId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A serialized entity as handed over by the serialization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub object_id: ObjectId,
    pub type_id: TypeId,
    pub payload: Vec<u8>,
}

impl Entity {
    pub fn new(object_id: ObjectId, type_id: TypeId, payload: Vec<u8>) -> Self {
        Entity { object_id, type_id, payload }
    }
}

/// Location of an entity record inside a channel's data files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileLocation {
    pub file_number: u64,
    pub offset: u64,
    /// Full record length including header
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ranges_are_disjoint() {
        assert!(ObjectId(TYPE_ID_BASE + 5).is_type_id_range());
        assert!(ObjectId(OBJECT_ID_BASE).is_object_range());
        assert!(!ObjectId(OBJECT_ID_BASE).is_type_id_range());
        assert!(ObjectId::ROOTS.is_constant_range());
        assert!(!ObjectId(42).is_object_range());
    }

    #[test]
    fn channel_is_hash_masked() {
        assert_eq!(ObjectId(OBJECT_ID_BASE + 5).channel(4), ((OBJECT_ID_BASE + 5) & 3) as usize);
        assert_eq!(ObjectId(17).channel(1), 0);
    }
}
