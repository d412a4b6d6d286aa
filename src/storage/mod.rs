pub mod layout;
pub mod record;
pub mod transactions;
pub mod data_file;
pub mod dissolver;
pub mod file_manager;
pub mod file_lock;
pub mod backup;
