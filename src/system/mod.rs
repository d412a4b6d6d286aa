pub mod manager;
pub mod providers;
