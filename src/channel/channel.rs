use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, trace};
use crate::cache::entity_cache::{EntityCache, EntityCacheEvaluator};
use crate::cache::gc::MarkMonitor;
use crate::cache::type_dictionary::TypeDictionary;
use crate::cache::zombie::ZombieOidHandler;
use crate::channel::controller::{OperationController, StorageExceptionHandler};
use crate::channel::housekeeping::HousekeepingController;
use crate::channel::init::{ChannelReport, InitCoordinator};
use crate::channel::task::{ChannelTask, TaskKind, TaskOutput};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ObjectId;
use crate::storage::backup::BackupSink;
use crate::storage::dissolver::FileDissolver;
use crate::storage::file_manager::{read_storage, FileManager};
use crate::storage::layout::StorageLayout;
use crate::storage::record::ByteOrder;

/// Live records moved per transfer entry while dissolving a file
const DISSOLVE_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Initializing,
    Active,
    ShuttingDown,
    Terminated,
}

/// Everything the channels of one storage share
pub struct ChannelContext {
    pub config: Arc<Config>,
    pub layout: StorageLayout,
    pub dictionary: Arc<TypeDictionary>,
    pub monitor: Arc<MarkMonitor>,
    pub controller: Arc<OperationController>,
    pub exception_handler: Arc<dyn StorageExceptionHandler>,
    pub zombie_handler: Arc<dyn ZombieOidHandler>,
    pub dissolver: Arc<dyn FileDissolver>,
    pub backup: Option<BackupSink>,
    /// Newest store known to be complete on every channel
    pub confirmed_store_timestamp: Arc<AtomicU64>,
}

/// One storage channel: owns a disjoint hash partition of all entities,
/// its files, and its cache. Runs on its own thread.
pub struct StorageChannel {
    index: usize,
    state: ChannelState,
    context: Arc<ChannelContext>,
    housekeeping: Box<dyn HousekeepingController>,
    files: Option<FileManager>,
    cache: EntityCache,
}

impl StorageChannel {
    pub fn new(index: usize, context: Arc<ChannelContext>, housekeeping: Box<dyn HousekeepingController>) -> Self {
        let evaluator = EntityCacheEvaluator::new(
            context.config.entity_cache_timeout,
            // every channel gets its share of the cache threshold
            context.config.entity_cache_threshold / context.config.channel_count.max(1) as u64,
        );
        StorageChannel {
            index,
            state: ChannelState::Uninitialized,
            context,
            housekeeping,
            files: None,
            cache: EntityCache::new(index, evaluator),
        }
    }

    pub fn spawn(self, receiver: Receiver<Arc<ChannelTask>>) -> Result<JoinHandle<()>> {
        let name = format!("gigastore-channel-{}", self.index);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(receiver))?;
        Ok(handle)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn run(mut self, receiver: Receiver<Arc<ChannelTask>>) {
        let mut last_housekeeping = Instant::now();
        debug!(channel = self.index, "channel thread started");

        loop {
            let interval = self.housekeeping.interval();
            let wait = interval.saturating_sub(last_housekeeping.elapsed());
            match receiver.recv_timeout(wait) {
                Ok(task) => {
                    let shutdown = matches!(task.kind, TaskKind::Shutdown);
                    let result = self.handle(&task);
                    task.report(self.index, result);
                    if shutdown {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_housekeeping.elapsed() >= interval {
                self.run_housekeeping();
                last_housekeeping = Instant::now();
            }
        }

        self.state = ChannelState::Terminated;
        debug!(channel = self.index, "channel thread terminated");
    }

    fn handle(&mut self, task: &ChannelTask) -> Result<TaskOutput> {
        let context = self.context.clone();
        if !matches!(task.kind, TaskKind::Shutdown) && !context.controller.is_channel_processing_enabled() {
            return Err(Error::new(
                ErrorKind::Disrupted,
                format!("channel {} rejects {} task: processing disabled", self.index, task.kind.name()),
            ));
        }

        trace!(channel = self.index, task = task.id, kind = task.kind.name(), "processing task");
        let result = self.process(task);
        if let Err(e) = &result {
            context.exception_handler.handle_exception(self.index, e, &context.controller);
        }
        result
    }

    fn run_housekeeping(&mut self) {
        if self.state != ChannelState::Active || !self.context.controller.is_channel_processing_enabled() {
            return;
        }
        if let Err(e) = self.housekeep() {
            let context = self.context.clone();
            context.exception_handler.handle_exception(self.index, &e, &context.controller);
        }
    }

    fn files(&mut self) -> Result<&mut FileManager> {
        let index = self.index;
        self.files
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("channel {} is not initialized", index)))
    }

    fn process(&mut self, task: &ChannelTask) -> Result<TaskOutput> {
        match &task.kind {
            TaskKind::Initialize(coordinator) => self.initialize(coordinator),
            TaskKind::Store { timestamp } => self.store(*timestamp, task),
            TaskKind::LoadByOids { strict } => self.load(task.take_object_ids(self.index), *strict),
            TaskKind::LoadRoots => {
                if ObjectId::ROOTS.channel(self.context.config.channel_count) == self.index {
                    self.load(vec![ObjectId::ROOTS], false)
                } else {
                    Ok(TaskOutput::Entities(Vec::new()))
                }
            }
            TaskKind::GarbageCollection => self.full_garbage_collection(),
            TaskKind::CacheCheck => {
                self.cache.clear_cache(None);
                Ok(TaskOutput::Done)
            }
            TaskKind::FileCheck => {
                self.file_check(None)?;
                Ok(TaskOutput::Done)
            }
            TaskKind::Statistics => {
                let mut statistics = self.files()?.statistics();
                statistics.entity_count = self.cache.len() as u64;
                statistics.cached_bytes = self.cache.cached_bytes();
                Ok(TaskOutput::Statistics(statistics))
            }
            TaskKind::Export(path) => {
                let target = StorageLayout::new(path.clone())?;
                self.files()?.export(&target)?;
                Ok(TaskOutput::Done)
            }
            TaskKind::Shutdown => {
                self.state = ChannelState::ShuttingDown;
                self.files = None;
                Ok(TaskOutput::Done)
            }
        }
    }

    fn initialize(&mut self, coordinator: &InitCoordinator) -> Result<TaskOutput> {
        if self.state != ChannelState::Uninitialized {
            return Err(Error::invalid_state(format!("channel {} is already initialized", self.index)));
        }
        self.state = ChannelState::Initializing;

        let config = &self.context.config;
        let order = ByteOrder::from_switch(config.switch_byte_order);
        let inventory = read_storage(&self.context.layout, self.index, order);
        let report = inventory.as_ref().map_err(Clone::clone).map(|inventory| ChannelReport {
            transactions_exist: inventory.transactions_exist,
            latest_store_timestamp: inventory.replay.latest_store_timestamp(),
            previous_store_timestamp: inventory.replay.previous_store_timestamp(),
            latest_timestamp: inventory.replay.latest_timestamp,
            highest_object_id: inventory.highest_object_id(),
        });
        let decision = coordinator.report(self.index, report)?;
        let inventory = inventory?;

        let (mut files, records) = FileManager::initialize(
            self.context.layout.clone(),
            inventory,
            order,
            decision.consistent_store_timestamp,
            decision.initial_timestamp,
            self.context.dissolver.clone(),
            self.context.backup.clone(),
        )?;
        self.cache.rebuild(&records, &mut files);
        self.files = Some(files);
        self.state = ChannelState::Active;

        info!(channel = self.index, entities = self.cache.len(), "channel initialized");
        Ok(TaskOutput::Done)
    }

    fn store(&mut self, timestamp: u64, task: &ChannelTask) -> Result<TaskOutput> {
        let entities = task.take_entities(self.index);
        let gc_enabled = self.context.config.garbage_collection_enabled;
        let monitor = self.context.monitor.clone();

        let files = self.files.as_mut().ok_or_else(|| Error::invalid_state("channel is not initialized"))?;
        let locations = files.write_store(timestamp, &entities)?;
        for (entity, location) in entities.into_iter().zip(locations) {
            let object_id = entity.object_id;
            if let Some(previous) = self.cache.put_entity(entity, location) {
                files.remove_live(previous);
            }
            files.add_live(location);
            if gc_enabled {
                // stored entities survive the running cycle
                monitor.enqueue(object_id);
            }
        }
        Ok(TaskOutput::Done)
    }

    fn load(&mut self, object_ids: Vec<ObjectId>, strict: bool) -> Result<TaskOutput> {
        let files = self.files.as_mut().ok_or_else(|| Error::invalid_state("channel is not initialized"))?;
        let mut entities = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            match self.cache.load(object_id, files)? {
                Some(entity) => entities.push(entity),
                None if strict => {
                    return Err(Error::consistency(format!(
                        "referenced entity {} not found in channel {}", object_id, self.index
                    )));
                }
                None => {}
            }
        }
        Ok(TaskOutput::Entities(entities))
    }

    /// One incremental GC step: join the cycle, mark until the deadline, and
    /// sweep once marking is complete on every channel.
    fn gc_step(&mut self, deadline: Option<Instant>) -> Result<()> {
        let context = self.context.clone();
        let monitor = &context.monitor;
        if let Some(cycle) = monitor.join(self.index) {
            self.cache.begin_mark_cycle(cycle);
        }

        let files = self.files.as_mut().ok_or_else(|| Error::invalid_state("channel is not initialized"))?;
        let drained = self.cache.mark(
            monitor,
            &context.dictionary,
            files,
            context.zombie_handler.as_ref(),
            deadline,
        )?;
        if drained && monitor.may_sweep(self.index) {
            self.cache.sweep(files);
            monitor.swept(self.index);
        }
        Ok(())
    }

    /// Runs GC steps until two more cycles have completed, so at least one
    /// full cycle started after this request.
    fn full_garbage_collection(&mut self) -> Result<TaskOutput> {
        let context = self.context.clone();
        let target = context.monitor.completed_cycles() + 2;
        loop {
            self.gc_step(None)?;
            if context.monitor.wait_for_completion(target, Duration::from_millis(1)) {
                return Ok(TaskOutput::Done);
            }
            context.controller.check_processing_enabled()?;
        }
    }

    /// Dissolves files the dissolver selects. Returns false if the deadline
    /// cut the check short.
    fn file_check(&mut self, deadline: Option<Instant>) -> Result<bool> {
        let expired = |deadline: Option<Instant>| deadline.map(|d| Instant::now() >= d).unwrap_or(false);
        let files = self.files.as_mut().ok_or_else(|| Error::invalid_state("channel is not initialized"))?;
        files.confirm_stores_up_to(self.context.confirmed_store_timestamp.load(Ordering::SeqCst));

        for number in files.dissolve_candidates() {
            let members = self.cache.members_of(number);
            for batch in members.chunks(DISSOLVE_BATCH) {
                if expired(deadline) {
                    return Ok(false);
                }
                let moved = files.transfer(number, batch)?;
                for ((object_id, _), location) in batch.iter().zip(moved) {
                    self.cache.relocate(*object_id, location);
                }
            }
            if !files.has_live_data(number) {
                files.delete_file(number)?;
            }
            if expired(deadline) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn housekeep(&mut self) -> Result<()> {
        let now = Instant::now();
        if self.context.config.garbage_collection_enabled {
            let progress = self.context.monitor.progress();
            let budget = self.housekeeping.garbage_collection_budget_ns(&progress, now);
            self.gc_step(Some(now + Duration::from_nanos(budget)))?;
        }

        let budget = self.housekeeping.cache_check_budget_ns();
        self.cache.clear_cache(Some(Instant::now() + Duration::from_nanos(budget)));

        let budget = self.housekeeping.file_check_budget_ns();
        self.file_check(Some(Instant::now() + Duration::from_nanos(budget)))?;
        Ok(())
    }
}
