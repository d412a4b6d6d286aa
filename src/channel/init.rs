use std::time::{SystemTime, UNIX_EPOCH};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};
use crate::core::error::{Error, Result};
use crate::core::types::ObjectId;

/// What one channel found in its transactions log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReport {
    pub transactions_exist: bool,
    pub latest_store_timestamp: u64,
    pub previous_store_timestamp: u64,
    pub latest_timestamp: u64,
    pub highest_object_id: Option<ObjectId>,
}

/// Common outcome every channel initializes with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitDecision {
    /// Stores newer than this get rolled back
    pub consistent_store_timestamp: u64,
    /// New timestamps must be issued above this
    pub initial_timestamp: u64,
    pub highest_object_id: Option<ObjectId>,
    pub fresh: bool,
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Agrees on the consistent store timestamp across channels.
///
/// Every store task logs a store entry on every channel, so a completed store
/// leaves equal latest timestamps everywhere. A crash during a store leaves
/// some channels one store ahead; those roll back to the previous store,
/// which must be what all the other channels have as their latest.
pub fn decide(reports: &[ChannelReport]) -> Result<InitDecision> {
    let existing = reports.iter().filter(|r| r.transactions_exist).count();
    let highest_object_id = reports.iter().filter_map(|r| r.highest_object_id).max();

    if existing == 0 {
        return Ok(InitDecision {
            consistent_store_timestamp: 0,
            initial_timestamp: now_nanos(),
            highest_object_id: None,
            fresh: true,
        });
    }
    if existing != reports.len() {
        return Err(Error::consistency(format!(
            "only {} of {} channels have a transactions file", existing, reports.len()
        )));
    }

    let initial_timestamp = reports.iter().map(|r| r.latest_timestamp).max().unwrap_or(0);
    let max_latest = reports.iter().map(|r| r.latest_store_timestamp).max().unwrap_or(0);

    let consistent = if reports.iter().all(|r| r.latest_store_timestamp == max_latest) {
        max_latest
    } else {
        let ahead: Vec<&ChannelReport> = reports.iter().filter(|r| r.latest_store_timestamp == max_latest).collect();
        let fallback = ahead[0].previous_store_timestamp;
        if ahead.iter().any(|r| r.previous_store_timestamp != fallback) {
            return Err(Error::consistency(format!(
                "channels ahead at store {} disagree on their previous store", max_latest
            )));
        }
        if let Some(other) = reports
            .iter()
            .find(|r| r.latest_store_timestamp != max_latest && r.latest_store_timestamp != fallback)
        {
            return Err(Error::consistency(format!(
                "inconsistent store timestamps: {} is neither {} nor {}",
                other.latest_store_timestamp, max_latest, fallback
            )));
        }
        warn!(
            incomplete = max_latest,
            consistent = fallback,
            channels = ahead.len(),
            "incomplete store found, rolling back"
        );
        fallback
    };

    Ok(InitDecision {
        consistent_store_timestamp: consistent,
        initial_timestamp,
        highest_object_id,
        fresh: false,
    })
}

struct InitState {
    reports: Vec<Option<Result<ChannelReport>>>,
    decision: Option<Result<InitDecision>>,
}

/// Rendezvous for the initialize task: each channel reports, blocks until
/// all have reported, and continues with the shared decision.
pub struct InitCoordinator {
    state: Mutex<InitState>,
    decided: Condvar,
}

impl InitCoordinator {
    pub fn new(channel_count: usize) -> Self {
        InitCoordinator {
            state: Mutex::new(InitState {
                reports: (0..channel_count).map(|_| None).collect(),
                decision: None,
            }),
            decided: Condvar::new(),
        }
    }

    pub fn report(&self, channel: usize, report: Result<ChannelReport>) -> Result<InitDecision> {
        let mut state = self.state.lock();
        state.reports[channel] = Some(report);

        if state.reports.iter().all(|r| r.is_some()) {
            let decision = Self::evaluate(&state.reports);
            if let Ok(decision) = &decision {
                info!(
                    consistent = decision.consistent_store_timestamp,
                    fresh = decision.fresh,
                    "channel initialization decided"
                );
            }
            state.decision = Some(decision);
            self.decided.notify_all();
        }

        loop {
            if let Some(decision) = &state.decision {
                return decision.clone();
            }
            self.decided.wait(&mut state);
        }
    }

    pub fn decision(&self) -> Option<Result<InitDecision>> {
        self.state.lock().decision.clone()
    }

    fn evaluate(reports: &[Option<Result<ChannelReport>>]) -> Result<InitDecision> {
        let mut collected = Vec::with_capacity(reports.len());
        for (channel, report) in reports.iter().enumerate() {
            match report {
                Some(Ok(report)) => collected.push(*report),
                Some(Err(e)) => {
                    return Err(Error::new(e.kind, format!("channel {} failed to initialize: {}", channel, e.context)));
                }
                None => return Err(Error::invalid_state(format!("channel {} did not report", channel))),
            }
        }
        decide(&collected)
    }
}
