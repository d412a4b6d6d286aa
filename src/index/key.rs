use std::fmt;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

/// Type tag of the keys an index holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Boolean,
    Integer,
    String,
    Date,
    Timestamp,
    Uuid,
}

/// A key value extracted from an entity. Keys of one index all share one
/// `KeyType`; ordering across variants only matters for mixed misuse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Boolean(bool),
    Integer(i64),
    String(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl IndexKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            IndexKey::Boolean(_) => KeyType::Boolean,
            IndexKey::Integer(_) => KeyType::Integer,
            IndexKey::String(_) => KeyType::String,
            IndexKey::Date(_) => KeyType::Date,
            IndexKey::Timestamp(_) => KeyType::Timestamp,
            IndexKey::Uuid(_) => KeyType::Uuid,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IndexKey::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IndexKey::Boolean(v) => write!(f, "{}", v),
            IndexKey::Integer(v) => write!(f, "{}", v),
            IndexKey::String(v) => write!(f, "{:?}", v),
            IndexKey::Date(v) => write!(f, "{}", v),
            IndexKey::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            IndexKey::Uuid(v) => write!(f, "{}", v),
        }
    }
}

/// Rust types usable as index keys
pub trait KeyValue: Into<IndexKey> {
    const KEY_TYPE: KeyType;
}

macro_rules! key_value {
    ($ty:ty, $variant:ident, $key_type:ident) => {
        impl From<$ty> for IndexKey {
            fn from(value: $ty) -> Self {
                IndexKey::$variant(value.into())
            }
        }

        impl KeyValue for $ty {
            const KEY_TYPE: KeyType = KeyType::$key_type;
        }
    };
}

key_value!(bool, Boolean, Boolean);
key_value!(i64, Integer, Integer);
key_value!(i32, Integer, Integer);
key_value!(u32, Integer, Integer);
key_value!(String, String, String);
key_value!(NaiveDate, Date, Date);
key_value!(DateTime<Utc>, Timestamp, Timestamp);
key_value!(Uuid, Uuid, Uuid);

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::String(value.to_string())
    }
}

impl KeyValue for &str {
    const KEY_TYPE: KeyType = KeyType::String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_and_ordering() {
        assert_eq!(IndexKey::from(5i32), IndexKey::Integer(5));
        assert_eq!(IndexKey::from("abc"), IndexKey::String("abc".to_string()));
        assert!(IndexKey::from(-3i64) < IndexKey::from(2i64));
        assert!(IndexKey::from("ab") < IndexKey::from("b"));
        assert_eq!(IndexKey::from(true).key_type(), KeyType::Boolean);

        let earlier = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let later = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        assert!(IndexKey::from(earlier) < IndexKey::from(later));
    }
}
