use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: PathBuf,
    pub channel_count: usize,               // power of two

    // data file housekeeping
    pub file_minimum_size: u64,             // smaller non-head files get dissolved
    pub file_maximum_size: u64,             // head file rotates beyond this
    pub minimum_use_ratio: f64,             // live/total below this gets dissolved

    // housekeeping scheduling
    pub housekeeping_interval: Duration,
    pub housekeeping_time_budget_ns: u64,
    pub adaptive_housekeeping: Option<AdaptiveHousekeepingConfig>,
    pub garbage_collection_enabled: bool,

    // entity cache
    pub entity_cache_timeout: Duration,
    pub entity_cache_threshold: u64,

    pub lock_file_update_interval: Duration,
    pub backup_path: Option<PathBuf>,
    pub switch_byte_order: bool,
    pub zombie_policy: ZombiePolicy,
}

#[derive(Debug, Clone)]
pub struct AdaptiveHousekeepingConfig {
    /// GC running longer than this without completing starts raising the budget
    pub increase_threshold: Duration,
    pub increase_amount_ns: u64,
    pub maximum_time_budget_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombiePolicy {
    Ignore,  // log and continue
    Fail,    // surface as error
}

impl Default for AdaptiveHousekeepingConfig {
    fn default() -> Self {
        AdaptiveHousekeepingConfig {
            increase_threshold: Duration::from_secs(5),
            increase_amount_ns: 50_000_000,       // +50ms per step
            maximum_time_budget_ns: 500_000_000,  // 0.5s
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./storage"),
            channel_count: default_channel_count(),

            file_minimum_size: 1024 * 1024,          // 1MB
            file_maximum_size: 8 * 1024 * 1024,      // 8MB
            minimum_use_ratio: 0.75,

            housekeeping_interval: Duration::from_secs(1),
            housekeeping_time_budget_ns: 10_000_000, // 10ms
            adaptive_housekeeping: None,
            garbage_collection_enabled: true,

            entity_cache_timeout: Duration::from_secs(24 * 60 * 60),
            entity_cache_threshold: 1024 * 1024 * 1024, // 1GB

            lock_file_update_interval: Duration::from_secs(10),
            backup_path: None,
            switch_byte_order: false,
            zombie_policy: ZombiePolicy::Ignore,
        }
    }
}

impl Config {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: storage_path.into(),
            ..Config::default()
        }
    }

    pub fn with_channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    pub fn with_file_sizes(mut self, minimum: u64, maximum: u64) -> Self {
        self.file_minimum_size = minimum;
        self.file_maximum_size = maximum;
        self
    }

    pub fn with_minimum_use_ratio(mut self, ratio: f64) -> Self {
        self.minimum_use_ratio = ratio;
        self
    }

    pub fn with_housekeeping(mut self, interval: Duration, time_budget_ns: u64) -> Self {
        self.housekeeping_interval = interval;
        self.housekeeping_time_budget_ns = time_budget_ns;
        self
    }

    pub fn with_adaptive_housekeeping(mut self, adaptive: AdaptiveHousekeepingConfig) -> Self {
        self.adaptive_housekeeping = Some(adaptive);
        self
    }

    pub fn with_garbage_collection(mut self, enabled: bool) -> Self {
        self.garbage_collection_enabled = enabled;
        self
    }

    pub fn with_entity_cache(mut self, timeout: Duration, threshold: u64) -> Self {
        self.entity_cache_timeout = timeout;
        self.entity_cache_threshold = threshold;
        self
    }

    pub fn with_lock_file_update_interval(mut self, interval: Duration) -> Self {
        self.lock_file_update_interval = interval;
        self
    }

    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    pub fn with_switched_byte_order(mut self, switch: bool) -> Self {
        self.switch_byte_order = switch;
        self
    }

    pub fn with_zombie_policy(mut self, policy: ZombiePolicy) -> Self {
        self.zombie_policy = policy;
        self
    }

    pub fn validate(&self) -> crate::core::error::Result<()> {
        use crate::core::error::Error;

        if self.channel_count == 0 || !self.channel_count.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "channel count must be a power of two, got {}", self.channel_count
            )));
        }
        if self.file_minimum_size >= self.file_maximum_size {
            return Err(Error::invalid_argument(format!(
                "file minimum size {} must be below maximum size {}",
                self.file_minimum_size, self.file_maximum_size
            )));
        }
        if !(0.0..=1.0).contains(&self.minimum_use_ratio) {
            return Err(Error::invalid_argument(format!(
                "minimum use ratio {} out of [0, 1]", self.minimum_use_ratio
            )));
        }
        Ok(())
    }
}

/// Largest power of two not above the number of CPUs.
fn default_channel_count() -> usize {
    let cpus = num_cpus::get().max(1);
    1 << (usize::BITS - 1 - cpus.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.channel_count.is_power_of_two());
        config.validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_channels() {
        let config = Config::new("/tmp/x").with_channel_count(3);
        assert!(config.validate().is_err());
    }
}
