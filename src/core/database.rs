use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use parking_lot::Mutex;
use tracing::debug;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::system::manager::{StorageBuilder, StorageManager, StorageSystem};

/// A named storage location. At most one running storage manager can be
/// attached to a database at any time; the database only keeps a weak
/// reference, so dropping every manager handle frees the slot.
pub struct Database {
    path: PathBuf,
    storage: Mutex<Weak<StorageSystem>>,
}

impl Database {
    fn new(path: PathBuf) -> Self {
        Database { path, storage: Mutex::new(Weak::new()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a storage for this database with `config` (its storage path is
    /// replaced by the database path).
    pub fn start_storage(&self, config: Config) -> Result<StorageManager> {
        self.start_storage_with(StorageBuilder::new(config))
    }

    pub fn start_storage_with(&self, builder: StorageBuilder) -> Result<StorageManager> {
        let mut slot = self.storage.lock();
        if let Some(existing) = slot.upgrade() {
            let running = StorageManager::from_system(existing).is_running();
            if running {
                return Err(Error::invalid_state(format!(
                    "database {} already has a running storage", self.path.display()
                )));
            }
        }

        let manager = builder.storage_path(self.path.clone()).start()?;
        *slot = Arc::downgrade(manager.system());
        debug!(path = %self.path.display(), "storage attached to database");
        Ok(manager)
    }

    /// The attached storage, if one is still alive and running.
    pub fn storage(&self) -> Option<StorageManager> {
        let system = self.storage.lock().upgrade()?;
        let manager = StorageManager::from_system(system);
        if manager.is_running() { Some(manager) } else { None }
    }
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<Database>>> {
    static DATABASES: OnceLock<Mutex<HashMap<PathBuf, Weak<Database>>>> = OnceLock::new();
    DATABASES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide registry handing out one `Database` per storage path
pub struct Databases;

impl Databases {
    pub fn get(path: impl AsRef<Path>) -> Arc<Database> {
        let path = path.as_ref().to_path_buf();
        let mut databases = registry().lock();
        databases.retain(|_, database| database.strong_count() > 0);
        if let Some(database) = databases.get(&path).and_then(Weak::upgrade) {
            return database;
        }
        let database = Arc::new(Database::new(path.clone()));
        databases.insert(path, Arc::downgrade(&database));
        database
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_running_storage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let database = Databases::get(dir.path());
        assert!(Arc::ptr_eq(&database, &Databases::get(dir.path())));

        let config = Config::new(dir.path()).with_channel_count(2);
        let storage = database.start_storage(config.clone()).unwrap();
        assert!(database.storage().is_some());
        assert!(database.start_storage(config.clone()).is_err());

        storage.shutdown().unwrap();
        assert!(database.storage().is_none());
        let restarted = database.start_storage(config).unwrap();
        assert!(restarted.is_running());
        restarted.shutdown().unwrap();
    }
}
