use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use parking_lot::Mutex;
use tracing::error;
use crate::core::error::{Error, ErrorKind, Result};

/// A failure that disabled channel processing
#[derive(Debug, Clone)]
pub struct Disruption {
    pub channel: Option<usize>,
    pub error: Error,
    pub time: SystemTime,
}

/// Shared run state of the storage: whether it is active and whether
/// channels may still process tasks. The first disruption disables
/// processing for good.
pub struct OperationController {
    active: AtomicBool,
    processing_enabled: AtomicBool,
    disruptions: Mutex<Vec<Disruption>>,
}

impl OperationController {
    pub fn new() -> Self {
        OperationController {
            active: AtomicBool::new(false),
            processing_enabled: AtomicBool::new(true),
            disruptions: Mutex::new(Vec::new()),
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_channel_processing_enabled(&self) -> bool {
        self.processing_enabled.load(Ordering::SeqCst)
    }

    pub fn register_disruption(&self, channel: Option<usize>, error: Error) {
        self.processing_enabled.store(false, Ordering::SeqCst);
        self.disruptions.lock().push(Disruption { channel, error, time: SystemTime::now() });
    }

    pub fn disruptions(&self) -> Vec<Disruption> {
        self.disruptions.lock().clone()
    }

    /// Fails fast with the first registered disruption.
    pub fn check_processing_enabled(&self) -> Result<()> {
        if self.is_channel_processing_enabled() {
            return Ok(());
        }
        let cause = self.disruptions
            .lock()
            .first()
            .map(|d| d.error.to_string())
            .unwrap_or_else(|| "unknown cause".to_string());
        Err(Error::new(ErrorKind::Disrupted, format!("channel processing disabled: {}", cause)))
    }

    pub fn check_active(&self) -> Result<()> {
        self.check_processing_enabled()?;
        if !self.is_active() {
            return Err(Error::invalid_state("storage is not running"));
        }
        Ok(())
    }
}

impl Default for OperationController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives every failure that escapes a channel's task or housekeeping work
pub trait StorageExceptionHandler: Send + Sync {
    fn handle_exception(&self, channel: usize, error: &Error, controller: &OperationController);
}

/// Logs the failure and disables all further channel processing
pub struct DisruptingExceptionHandler;

impl StorageExceptionHandler for DisruptingExceptionHandler {
    fn handle_exception(&self, channel: usize, error: &Error, controller: &OperationController) {
        error!(channel, error = %error, "channel failure, disabling storage processing");
        controller.register_disruption(Some(channel), error.clone());
    }
}
