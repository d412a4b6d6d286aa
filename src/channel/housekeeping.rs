use std::time::{Duration, Instant};
use crate::cache::gc::GcProgress;
use crate::core::config::{AdaptiveHousekeepingConfig, Config};

/// Schedules the idle-time work of a channel and hands out time budgets
pub trait HousekeepingController: Send {
    fn interval(&self) -> Duration;

    fn garbage_collection_budget_ns(&mut self, progress: &GcProgress, now: Instant) -> u64;

    fn cache_check_budget_ns(&self) -> u64;

    fn file_check_budget_ns(&self) -> u64;
}

/// Constant interval and budget
#[derive(Debug, Clone)]
pub struct FixedHousekeeping {
    pub interval: Duration,
    pub time_budget_ns: u64,
}

impl HousekeepingController for FixedHousekeeping {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn garbage_collection_budget_ns(&mut self, _progress: &GcProgress, _now: Instant) -> u64 {
        self.time_budget_ns
    }

    fn cache_check_budget_ns(&self) -> u64 {
        self.time_budget_ns
    }

    fn file_check_budget_ns(&self) -> u64 {
        self.time_budget_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveState {
    pub last_finished_cycle: u64,
    pub last_increase: Option<Instant>,
    pub current_increase_ns: u64,
}

/// Raises the GC budget step by step while a cycle keeps running past the
/// threshold, and drops back to the base budget once a cycle completes.
#[derive(Debug, Clone)]
pub struct AdaptiveHousekeeping {
    pub base: FixedHousekeeping,
    pub config: AdaptiveHousekeepingConfig,
    pub state: AdaptiveState,
}

impl AdaptiveHousekeeping {
    pub fn new(base: FixedHousekeeping, config: AdaptiveHousekeepingConfig) -> Self {
        AdaptiveHousekeeping {
            base,
            config,
            state: AdaptiveState { last_finished_cycle: 0, last_increase: None, current_increase_ns: 0 },
        }
    }

    pub fn next_state(&self, progress: &GcProgress, now: Instant) -> AdaptiveState {
        let state = self.state;
        if progress.completed_cycles > state.last_finished_cycle {
            return AdaptiveState {
                last_finished_cycle: progress.completed_cycles,
                last_increase: None,
                current_increase_ns: 0,
            };
        }

        let threshold = self.config.increase_threshold;
        let running_long = now.saturating_duration_since(progress.cycle_started_at) >= threshold;
        let increase_due = state
            .last_increase
            .map(|last| now.saturating_duration_since(last) >= threshold)
            .unwrap_or(true);
        if running_long && increase_due {
            let ceiling = self.config.maximum_time_budget_ns.saturating_sub(self.base.time_budget_ns);
            return AdaptiveState {
                last_finished_cycle: state.last_finished_cycle,
                last_increase: Some(now),
                current_increase_ns: (state.current_increase_ns + self.config.increase_amount_ns).min(ceiling),
            };
        }
        state
    }
}

impl HousekeepingController for AdaptiveHousekeeping {
    fn interval(&self) -> Duration {
        self.base.interval
    }

    fn garbage_collection_budget_ns(&mut self, progress: &GcProgress, now: Instant) -> u64 {
        self.state = self.next_state(progress, now);
        self.base.time_budget_ns + self.state.current_increase_ns
    }

    fn cache_check_budget_ns(&self) -> u64 {
        self.base.time_budget_ns
    }

    fn file_check_budget_ns(&self) -> u64 {
        self.base.time_budget_ns
    }
}

pub fn controller_for(config: &Config) -> Box<dyn HousekeepingController> {
    let fixed = FixedHousekeeping {
        interval: config.housekeeping_interval,
        time_budget_ns: config.housekeeping_time_budget_ns,
    };
    match &config.adaptive_housekeeping {
        Some(adaptive) => Box::new(AdaptiveHousekeeping::new(fixed, adaptive.clone())),
        None => Box::new(fixed),
    }
}
