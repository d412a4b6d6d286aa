pub mod type_dictionary;
pub mod entity_cache;
pub mod gc;
pub mod zombie;
