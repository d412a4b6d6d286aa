pub mod key;
pub mod indexer;
pub mod bitmap;
pub mod constraint;
