use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;
use crate::core::types::ObjectId;

struct CycleState {
    cycle: u64,
    joined: Vec<bool>,
    swept: Vec<bool>,
    started_at: Instant,
    completed_cycles: u64,
}

/// Progress snapshot handed to housekeeping budget decisions
#[derive(Debug, Clone, Copy)]
pub struct GcProgress {
    pub cycle: u64,
    pub cycle_started_at: Instant,
    pub completed_cycles: u64,
}

/// Coordinates mark and sweep phases across all channels.
///
/// Every channel owns a mark queue. References found while marking are
/// routed to the queue of the owning channel. `pending` counts queued plus
/// in-progress object ids, so zero means marking is complete everywhere
/// once every channel has joined the cycle.
pub struct MarkMonitor {
    queues: Vec<(Sender<ObjectId>, Receiver<ObjectId>)>,
    pending: AtomicU64,
    state: Mutex<CycleState>,
    completion: Condvar,
}

impl MarkMonitor {
    pub fn new(channel_count: usize) -> Self {
        MarkMonitor {
            queues: (0..channel_count).map(|_| unbounded()).collect(),
            pending: AtomicU64::new(0),
            state: Mutex::new(CycleState {
                cycle: 1,
                joined: vec![false; channel_count],
                swept: vec![false; channel_count],
                started_at: Instant::now(),
                completed_cycles: 0,
            }),
            completion: Condvar::new(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.queues.len()
    }

    /// Queues an object id for marking on its owning channel.
    pub fn enqueue(&self, object_id: ObjectId) {
        let channel = object_id.channel(self.queues.len());
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queues[channel].0.send(object_id).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn enqueue_all(&self, object_ids: impl IntoIterator<Item = ObjectId>) {
        for object_id in object_ids {
            self.enqueue(object_id);
        }
    }

    /// Takes the next queued id. Callers must call `processed` afterwards,
    /// after enqueuing everything the id references.
    pub fn poll(&self, channel: usize) -> Option<ObjectId> {
        self.queues[channel].1.try_recv().ok()
    }

    pub fn processed(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn current_cycle(&self) -> u64 {
        self.state.lock().cycle
    }

    pub fn progress(&self) -> GcProgress {
        let state = self.state.lock();
        GcProgress {
            cycle: state.cycle,
            cycle_started_at: state.started_at,
            completed_cycles: state.completed_cycles,
        }
    }

    /// Registers the channel in the current cycle. Returns the cycle number
    /// if the channel was not yet part of it. The channel owning the roots
    /// entity seeds marking with it while still holding the cycle lock.
    pub fn join(&self, channel: usize) -> Option<u64> {
        let mut state = self.state.lock();
        if state.joined[channel] {
            return None;
        }
        state.joined[channel] = true;
        if ObjectId::ROOTS.channel(self.queues.len()) == channel {
            self.enqueue(ObjectId::ROOTS);
        }
        Some(state.cycle)
    }

    /// Sweeping is allowed once every channel joined, no marking work is
    /// left anywhere, and this channel has not swept in this cycle yet.
    pub fn may_sweep(&self, channel: usize) -> bool {
        let state = self.state.lock();
        state.joined.iter().all(|j| *j) && !state.swept[channel] && self.pending() == 0
    }

    pub fn has_swept(&self, channel: usize) -> bool {
        self.state.lock().swept[channel]
    }

    /// Records a finished sweep; the last channel to sweep completes the cycle.
    pub fn swept(&self, channel: usize) {
        let mut state = self.state.lock();
        state.swept[channel] = true;
        if state.swept.iter().all(|s| *s) {
            let finished = state.cycle;
            state.cycle += 1;
            state.completed_cycles += 1;
            state.joined.iter_mut().for_each(|j| *j = false);
            state.swept.iter_mut().for_each(|s| *s = false);
            state.started_at = Instant::now();
            debug!(cycle = finished, "garbage collection cycle completed");
            self.completion.notify_all();
        }
    }

    pub fn completed_cycles(&self) -> u64 {
        self.state.lock().completed_cycles
    }

    /// Waits up to `timeout` for the completed cycle count to reach `target`.
    pub fn wait_for_completion(&self, target: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.completed_cycles < target {
            self.completion.wait_for(&mut state, timeout);
        }
        state.completed_cycles >= target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_completes_after_all_channels_sweep() {
        let monitor = MarkMonitor::new(2);
        assert_eq!(monitor.join(0), Some(1));
        assert_eq!(monitor.join(0), None);
        assert!(!monitor.may_sweep(0));

        monitor.join(1);
        monitor.enqueue(ObjectId(3)); // channel 1
        assert!(!monitor.may_sweep(0));
        let roots_channel = ObjectId::ROOTS.channel(2);
        assert_eq!(monitor.poll(roots_channel), Some(ObjectId::ROOTS));
        monitor.processed();
        assert_eq!(monitor.poll(0), None);
        assert_eq!(monitor.poll(1), Some(ObjectId(3)));
        monitor.processed();

        assert!(monitor.may_sweep(0));
        monitor.swept(0);
        assert!(!monitor.may_sweep(0));
        assert_eq!(monitor.current_cycle(), 1);

        monitor.swept(1);
        assert_eq!(monitor.current_cycle(), 2);
        assert_eq!(monitor.completed_cycles(), 1);
        assert!(monitor.wait_for_completion(1, Duration::from_millis(1)));
        assert_eq!(monitor.join(1), Some(2));
    }
}
