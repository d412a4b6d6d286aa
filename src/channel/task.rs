use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use crate::channel::controller::OperationController;
use crate::channel::init::InitCoordinator;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::ChannelStatistics;
use crate::core::types::{Entity, ObjectId};

/// Work sent to every channel at once
pub enum TaskKind {
    Initialize(Arc<InitCoordinator>),
    Store { timestamp: u64 },
    LoadByOids { strict: bool },
    LoadRoots,
    GarbageCollection,
    CacheCheck,
    FileCheck,
    Statistics,
    Export(PathBuf),
    Shutdown,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Initialize(_) => "initialize",
            TaskKind::Store { .. } => "store",
            TaskKind::LoadByOids { .. } => "load-by-oids",
            TaskKind::LoadRoots => "load-roots",
            TaskKind::GarbageCollection => "garbage-collection",
            TaskKind::CacheCheck => "cache-check",
            TaskKind::FileCheck => "file-check",
            TaskKind::Statistics => "statistics",
            TaskKind::Export(_) => "export",
            TaskKind::Shutdown => "shutdown",
        }
    }
}

/// Per-channel slice of a task's input
pub enum ChannelInput {
    Entities(Vec<Entity>),
    ObjectIds(Vec<ObjectId>),
}

#[derive(Debug)]
pub enum TaskOutput {
    Done,
    Entities(Vec<Entity>),
    Statistics(ChannelStatistics),
}

struct TaskState {
    remaining: usize,
    outputs: Vec<Option<TaskOutput>>,
    problem: Option<Error>,
}

/// One broadcast task. Every channel takes its own input slice, processes
/// it, and reports back; the submitter waits for all reports or the first
/// failure.
pub struct ChannelTask {
    pub id: u64,
    pub kind: TaskKind,
    inputs: Mutex<Vec<Option<ChannelInput>>>,
    state: Mutex<TaskState>,
    done: Condvar,
}

impl ChannelTask {
    pub fn new(id: u64, kind: TaskKind, channel_count: usize, inputs: Option<Vec<ChannelInput>>) -> Self {
        let inputs = match inputs {
            Some(inputs) => inputs.into_iter().map(Some).collect(),
            None => (0..channel_count).map(|_| None).collect(),
        };
        ChannelTask {
            id,
            kind,
            inputs: Mutex::new(inputs),
            state: Mutex::new(TaskState {
                remaining: channel_count,
                outputs: (0..channel_count).map(|_| None).collect(),
                problem: None,
            }),
            done: Condvar::new(),
        }
    }

    pub fn take_input(&self, channel: usize) -> Option<ChannelInput> {
        self.inputs.lock().get_mut(channel).and_then(|slot| slot.take())
    }

    pub fn take_entities(&self, channel: usize) -> Vec<Entity> {
        match self.take_input(channel) {
            Some(ChannelInput::Entities(entities)) => entities,
            _ => Vec::new(),
        }
    }

    pub fn take_object_ids(&self, channel: usize) -> Vec<ObjectId> {
        match self.take_input(channel) {
            Some(ChannelInput::ObjectIds(object_ids)) => object_ids,
            _ => Vec::new(),
        }
    }

    pub fn report(&self, channel: usize, result: Result<TaskOutput>) {
        let mut state = self.state.lock();
        match result {
            Ok(output) => state.outputs[channel] = Some(output),
            Err(error) => {
                if state.problem.is_none() {
                    state.problem = Some(error);
                }
            }
        }
        state.remaining = state.remaining.saturating_sub(1);
        self.done.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().remaining == 0
    }

    /// Blocks until every channel reported or one failed. Also gives up once
    /// processing gets disabled, unless this is a shutdown task.
    pub fn wait_on_completion(&self, controller: &OperationController) -> Result<Vec<TaskOutput>> {
        let mut state = self.state.lock();
        loop {
            if let Some(problem) = &state.problem {
                return Err(problem.clone());
            }
            if state.remaining == 0 {
                return Ok(state.outputs.iter_mut().map(|o| o.take().unwrap_or(TaskOutput::Done)).collect());
            }
            if !matches!(self.kind, TaskKind::Shutdown) && !controller.is_channel_processing_enabled() {
                return Err(Error::new(
                    ErrorKind::Disrupted,
                    format!("{} task {} aborted: channel processing disabled", self.kind.name(), self.id),
                ));
            }
            self.done.wait_for(&mut state, Duration::from_millis(50));
        }
    }
}

/// Fans tasks out to the channel threads
pub struct TaskBroker {
    senders: Vec<Sender<Arc<ChannelTask>>>,
    controller: Arc<OperationController>,
    next_id: AtomicU64,
}

impl TaskBroker {
    pub fn new(senders: Vec<Sender<Arc<ChannelTask>>>, controller: Arc<OperationController>) -> Self {
        TaskBroker { senders, controller, next_id: AtomicU64::new(1) }
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }

    /// Submits a task to every channel and waits for its outputs, indexed by channel.
    pub fn submit(&self, kind: TaskKind, inputs: Option<Vec<ChannelInput>>) -> Result<Vec<TaskOutput>> {
        match kind {
            TaskKind::Shutdown => {}
            TaskKind::Initialize(_) => self.controller.check_processing_enabled()?,
            _ => self.controller.check_active()?,
        }
        if let Some(inputs) = &inputs {
            if inputs.len() != self.senders.len() {
                return Err(Error::invalid_argument(format!(
                    "{} channel inputs for {} channels", inputs.len(), self.senders.len()
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(ChannelTask::new(id, kind, self.senders.len(), inputs));
        for (channel, sender) in self.senders.iter().enumerate() {
            if sender.send(task.clone()).is_err() {
                // a terminated channel counts as failed
                task.report(channel, Err(Error::invalid_state(format!("channel {} is terminated", channel))));
            }
        }
        task.wait_on_completion(&self.controller)
    }
}
