use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use crate::cache::gc::MarkMonitor;
use crate::cache::type_dictionary::{PayloadBuilder, PayloadReader, TypeDictionary};
use crate::cache::zombie::{handler_for, ZombieOidHandler};
use crate::channel::channel::{ChannelContext, StorageChannel};
use crate::channel::controller::{DisruptingExceptionHandler, OperationController, StorageExceptionHandler};
use crate::channel::housekeeping::{controller_for, HousekeepingController};
use crate::channel::init::InitCoordinator;
use crate::channel::task::{ChannelInput, TaskBroker, TaskKind, TaskOutput};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::StorageStatistics;
use crate::core::types::{Entity, ObjectId, TypeId};
use crate::storage::backup::BackupHandler;
use crate::storage::dissolver::{FileDissolver, RatioFileDissolver};
use crate::storage::file_lock::LockFileManager;
use crate::storage::file_manager::validate_entity;
use crate::storage::layout::StorageLayout;
use crate::storage::record::{ByteOrder, RecordIterator};
use crate::system::providers::{ObjectIdProvider, TimestampProvider};

type HousekeepingFactory = Arc<dyn Fn(&Config) -> Box<dyn HousekeepingController> + Send + Sync>;

/// Collects the pluggable parts of a storage before starting it
pub struct StorageBuilder {
    config: Config,
    dictionary: Option<Arc<TypeDictionary>>,
    exception_handler: Option<Arc<dyn StorageExceptionHandler>>,
    zombie_handler: Option<Arc<dyn ZombieOidHandler>>,
    dissolver: Option<Arc<dyn FileDissolver>>,
    housekeeping: Option<HousekeepingFactory>,
}

impl StorageBuilder {
    pub fn new(config: Config) -> Self {
        StorageBuilder {
            config,
            dictionary: None,
            exception_handler: None,
            zombie_handler: None,
            dissolver: None,
            housekeeping: None,
        }
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = path.into();
        self
    }

    pub fn type_dictionary(mut self, dictionary: Arc<TypeDictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn StorageExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn zombie_handler(mut self, handler: Arc<dyn ZombieOidHandler>) -> Self {
        self.zombie_handler = Some(handler);
        self
    }

    pub fn file_dissolver(mut self, dissolver: Arc<dyn FileDissolver>) -> Self {
        self.dissolver = Some(dissolver);
        self
    }

    pub fn housekeeping<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Config) -> Box<dyn HousekeepingController> + Send + Sync + 'static,
    {
        self.housekeeping = Some(Arc::new(factory));
        self
    }

    pub fn start(self) -> Result<StorageManager> {
        let system = StorageSystem::start(self)?;
        Ok(StorageManager { system: Arc::new(system) })
    }
}

pub(crate) struct StorageSystem {
    config: Arc<Config>,
    layout: StorageLayout,
    controller: Arc<OperationController>,
    broker: TaskBroker,
    threads: Mutex<Vec<JoinHandle<()>>>,
    dictionary: Arc<TypeDictionary>,
    object_ids: ObjectIdProvider,
    timestamps: TimestampProvider,
    lock_file: Mutex<Option<LockFileManager>>,
    backup: Mutex<Option<BackupHandler>>,
    /// Serializes stores so their timestamps reach every channel in order
    store_lock: Mutex<()>,
    running: AtomicBool,
    /// Newest store every channel completed, shared with the channels
    confirmed_store_timestamp: Arc<AtomicU64>,
}

impl StorageSystem {
    fn start(builder: StorageBuilder) -> Result<Self> {
        let config = builder.config;
        config.validate()?;
        let channel_count = config.channel_count;

        let layout = StorageLayout::new(config.storage_path.clone())?;
        let lock_file = LockFileManager::acquire(&layout, config.lock_file_update_interval)?;

        let existing = layout.existing_channel_count()?;
        if existing != 0 && existing != channel_count {
            return Err(Error::consistency(format!(
                "storage at {} has {} channels, configured for {}",
                layout.base_dir.display(), existing, channel_count
            )));
        }
        layout.create_channel_dirs(channel_count)?;

        let backup = match &config.backup_path {
            Some(path) => Some(BackupHandler::start(path.clone(), channel_count)?),
            None => None,
        };

        let dictionary = builder.dictionary.unwrap_or_else(|| Arc::new(TypeDictionary::new()));
        crate::gigamap::persistence::register_types(&dictionary);

        let config = Arc::new(config);
        let controller = Arc::new(OperationController::new());
        let confirmed_store_timestamp = Arc::new(AtomicU64::new(0));
        let context = Arc::new(ChannelContext {
            config: config.clone(),
            layout: layout.clone(),
            dictionary: dictionary.clone(),
            monitor: Arc::new(MarkMonitor::new(channel_count)),
            controller: controller.clone(),
            exception_handler: builder.exception_handler
                .unwrap_or_else(|| Arc::new(DisruptingExceptionHandler)),
            zombie_handler: builder.zombie_handler
                .unwrap_or_else(|| Arc::from(handler_for(config.zombie_policy))),
            dissolver: builder.dissolver
                .unwrap_or_else(|| Arc::new(RatioFileDissolver::from_config(&config))),
            backup: backup.as_ref().and_then(|b| b.sink()),
            confirmed_store_timestamp: confirmed_store_timestamp.clone(),
        });
        let housekeeping: HousekeepingFactory = match builder.housekeeping {
            Some(factory) => factory,
            None => Arc::new(controller_for),
        };

        let mut senders = Vec::with_capacity(channel_count);
        let mut threads = Vec::with_capacity(channel_count);
        for index in 0..channel_count {
            let (sender, receiver) = unbounded();
            let channel = StorageChannel::new(index, context.clone(), housekeeping(&config));
            threads.push(channel.spawn(receiver)?);
            senders.push(sender);
        }
        drop(context);

        let system = StorageSystem {
            config: config.clone(),
            layout,
            controller: controller.clone(),
            broker: TaskBroker::new(senders, controller.clone()),
            threads: Mutex::new(threads),
            dictionary,
            object_ids: ObjectIdProvider::new(None),
            timestamps: TimestampProvider::new(0),
            lock_file: Mutex::new(Some(lock_file)),
            backup: Mutex::new(backup),
            store_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            confirmed_store_timestamp,
        };

        let coordinator = Arc::new(InitCoordinator::new(channel_count));
        if let Err(e) = system.broker.submit(TaskKind::Initialize(coordinator.clone()), None) {
            warn!(error = %e, "storage initialization failed");
            system.stop();
            return Err(e);
        }
        let decision = match coordinator.decision() {
            Some(Ok(decision)) => decision,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::invalid_state("initialization finished without decision")),
        };

        if let Some(highest) = decision.highest_object_id {
            system.object_ids.observe(highest);
        }
        system.timestamps.advance_to(decision.initial_timestamp);
        controller.activate();
        info!(
            path = %system.layout.base_dir.display(),
            channels = channel_count,
            fresh = decision.fresh,
            "storage started"
        );
        Ok(system)
    }

    /// Terminates channel threads and releases background resources.
    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.controller.deactivate();
        if let Err(e) = self.broker.submit(TaskKind::Shutdown, None) {
            warn!(error = %e, "channel shutdown reported an error");
        }
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                warn!("channel thread panicked");
            }
        }
        if let Some(mut backup) = self.backup.lock().take() {
            if let Err(e) = backup.stop() {
                warn!(error = %e, "backup handler stopped with error");
            }
        }
        if let Some(mut lock) = self.lock_file.lock().take() {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to release storage lock");
            }
        }
        info!(path = %self.layout.base_dir.display(), "storage stopped");
    }

    fn partition<T>(&self, items: impl IntoIterator<Item = T>, object_id: impl Fn(&T) -> ObjectId) -> Vec<Vec<T>> {
        let count = self.config.channel_count;
        let mut slices: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
        for item in items {
            slices[object_id(&item).channel(count)].push(item);
        }
        slices
    }

    fn load_by_oids(&self, object_ids: &[ObjectId], strict: bool) -> Result<Vec<Entity>> {
        let unique: HashSet<ObjectId> = object_ids.iter().copied().collect();
        let inputs = self.partition(unique, |oid| *oid)
            .into_iter()
            .map(ChannelInput::ObjectIds)
            .collect();
        let outputs = self.broker.submit(TaskKind::LoadByOids { strict }, Some(inputs))?;

        let mut found = HashMap::new();
        for output in outputs {
            if let TaskOutput::Entities(entities) = output {
                found.extend(entities.into_iter().map(|e| (e.object_id, e)));
            }
        }
        let mut seen = HashSet::new();
        Ok(object_ids
            .iter()
            .filter(|oid| seen.insert(**oid))
            .filter_map(|oid| found.remove(oid))
            .collect())
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle to a running storage. Cloning shares the same storage.
#[derive(Clone)]
pub struct StorageManager {
    system: Arc<StorageSystem>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager").finish_non_exhaustive()
    }
}

impl StorageManager {
    pub fn start(config: Config) -> Result<Self> {
        StorageBuilder::new(config).start()
    }

    pub fn builder(config: Config) -> StorageBuilder {
        StorageBuilder::new(config)
    }

    pub(crate) fn from_system(system: Arc<StorageSystem>) -> Self {
        StorageManager { system }
    }

    pub(crate) fn system(&self) -> &Arc<StorageSystem> {
        &self.system
    }

    pub fn config(&self) -> &Config {
        &self.system.config
    }

    pub fn type_dictionary(&self) -> &Arc<TypeDictionary> {
        &self.system.dictionary
    }

    pub fn operation_controller(&self) -> &Arc<OperationController> {
        &self.system.controller
    }

    pub fn is_running(&self) -> bool {
        self.system.running.load(Ordering::SeqCst) && self.system.controller.is_active()
    }

    pub fn is_channel_processing_enabled(&self) -> bool {
        self.system.controller.is_channel_processing_enabled()
    }

    pub fn new_object_id(&self) -> Result<ObjectId> {
        self.system.object_ids.next_object_id()
    }

    /// Reserves `count` consecutive object ids and returns them.
    pub fn new_object_ids(&self, count: usize) -> Result<Vec<ObjectId>> {
        let first = self.system.object_ids.reserve(count as u64)?;
        Ok((0..count as u64).map(|i| ObjectId(first.0 + i)).collect())
    }

    /// Writes all entities as one store: every channel appends its share and
    /// logs the same store timestamp.
    pub fn store(&self, entities: Vec<Entity>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        // reject before any channel writes, a failed chunk would disrupt the storage
        for entity in &entities {
            validate_entity(entity)?;
        }
        let system = &self.system;
        let _guard = system.store_lock.lock();
        system.controller.check_active()?;

        let count = entities.len();
        let timestamp = system.timestamps.next();
        let inputs = system.partition(entities, |e| e.object_id)
            .into_iter()
            .map(ChannelInput::Entities)
            .collect();
        system.broker.submit(TaskKind::Store { timestamp }, Some(inputs))?;
        system.confirmed_store_timestamp.fetch_max(timestamp, Ordering::SeqCst);
        debug!(entities = count, timestamp, "store completed");
        Ok(())
    }

    pub fn load(&self, object_id: ObjectId) -> Result<Option<Entity>> {
        Ok(self.system.load_by_oids(&[object_id], false)?.into_iter().next())
    }

    /// Loads the given entities; unknown ids are skipped. Results follow input order.
    pub fn load_many(&self, object_ids: &[ObjectId]) -> Result<Vec<Entity>> {
        self.system.load_by_oids(object_ids, false)
    }

    /// Loads the given entities and everything they reference, transitively.
    /// A referenced entity no channel holds is a consistency error.
    pub fn load_graph(&self, object_ids: &[ObjectId]) -> Result<Vec<Entity>> {
        let dictionary = &self.system.dictionary;
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut loaded = Vec::new();
        let mut frontier: Vec<ObjectId> = object_ids.iter().copied().filter(|oid| visited.insert(*oid)).collect();

        while !frontier.is_empty() {
            let entities = self.system.load_by_oids(&frontier, true)?;
            let mut next = Vec::new();
            for entity in &entities {
                dictionary.iterate_references(entity.type_id, &entity.payload, &mut |reference| {
                    if reference.is_object_range() && visited.insert(reference) {
                        next.push(reference);
                    }
                })?;
            }
            loaded.extend(entities);
            frontier = next;
        }
        Ok(loaded)
    }

    /// Object ids registered as storage roots, empty for a fresh storage.
    pub fn roots(&self) -> Result<Vec<ObjectId>> {
        let outputs = self.system.broker.submit(TaskKind::LoadRoots, None)?;
        for output in outputs {
            if let TaskOutput::Entities(entities) = output {
                if let Some(roots) = entities.into_iter().find(|e| e.object_id == ObjectId::ROOTS) {
                    return PayloadReader::new(&roots.payload).references();
                }
            }
        }
        Ok(Vec::new())
    }

    pub fn set_roots(&self, roots: &[ObjectId]) -> Result<()> {
        let payload = PayloadBuilder::new().references(roots).finish();
        self.store(vec![Entity::new(ObjectId::ROOTS, TypeId::ROOTS, payload)])
    }

    pub fn add_root(&self, root: ObjectId) -> Result<()> {
        let mut roots = self.roots()?;
        if !roots.contains(&root) {
            roots.push(root);
            self.set_roots(&roots)?;
        }
        Ok(())
    }

    pub fn issue_full_garbage_collection(&self) -> Result<()> {
        self.system.broker.submit(TaskKind::GarbageCollection, None).map(|_| ())
    }

    pub fn issue_full_cache_check(&self) -> Result<()> {
        self.system.broker.submit(TaskKind::CacheCheck, None).map(|_| ())
    }

    pub fn issue_full_file_check(&self) -> Result<()> {
        self.system.broker.submit(TaskKind::FileCheck, None).map(|_| ())
    }

    pub fn statistics(&self) -> Result<StorageStatistics> {
        let outputs = self.system.broker.submit(TaskKind::Statistics, None)?;
        let channels = outputs
            .into_iter()
            .filter_map(|output| match output {
                TaskOutput::Statistics(statistics) => Some(statistics),
                _ => None,
            })
            .collect();
        Ok(StorageStatistics { creation_time: SystemTime::now(), channels })
    }

    /// Copies every channel's files into `target`, which can be started as a
    /// storage of its own.
    pub fn export_channels(&self, target: impl Into<PathBuf>) -> Result<()> {
        let target = target.into();
        let _guard = self.system.store_lock.lock();
        self.system.broker.submit(TaskKind::Export(target.clone()), None)?;
        info!(target = %target.display(), "storage exported");
        Ok(())
    }

    /// Stores the entity records of the given data files. Later records win,
    /// also across files. Returns the number of entities imported.
    pub fn import_files(&self, paths: &[impl AsRef<Path>]) -> Result<usize> {
        let order = ByteOrder::from_switch(self.system.config.switch_byte_order);
        let mut latest: HashMap<ObjectId, Entity> = HashMap::new();
        for path in paths {
            let bytes = fs::read(path.as_ref())?;
            for item in RecordIterator::new(&bytes, order) {
                let (_, record) = item?;
                latest.insert(record.object_id, record.to_entity());
            }
        }

        let entities: Vec<Entity> = latest.into_values().collect();
        for entity in &entities {
            self.system.object_ids.observe(entity.object_id);
        }
        let count = entities.len();
        self.store(entities)?;
        info!(entities = count, files = paths.len(), "data files imported");
        Ok(count)
    }

    /// Waits until the backup copy has caught up with every write so far.
    pub fn flush_backup(&self) -> Result<()> {
        match self.system.backup.lock().as_ref() {
            Some(backup) => backup.flush(),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.system.stop();
        Ok(())
    }
}
