pub mod map;
pub mod persistence;
