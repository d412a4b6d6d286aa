use crate::core::config::Config;
use crate::storage::data_file::DataFile;

/// Policy deciding when data files rotate and when they get dissolved
pub trait FileDissolver: Send + Sync {
    /// Check if the head file is full and a new head must be started
    fn needs_rotation(&self, head: &DataFile) -> bool;

    /// Check if a non-head file should have its live records moved out
    fn needs_dissolve(&self, file: &DataFile) -> bool;
}

/// Ratio based policy: small or mostly-garbage files get dissolved
pub struct RatioFileDissolver {
    pub file_minimum_size: u64,
    pub file_maximum_size: u64,
    pub minimum_use_ratio: f64,
}

impl RatioFileDissolver {
    pub fn from_config(config: &Config) -> Self {
        RatioFileDissolver {
            file_minimum_size: config.file_minimum_size,
            file_maximum_size: config.file_maximum_size,
            minimum_use_ratio: config.minimum_use_ratio,
        }
    }
}

impl Default for RatioFileDissolver {
    fn default() -> Self {
        RatioFileDissolver {
            file_minimum_size: 1024 * 1024,
            file_maximum_size: 8 * 1024 * 1024,
            minimum_use_ratio: 0.75,
        }
    }
}

impl FileDissolver for RatioFileDissolver {
    fn needs_rotation(&self, head: &DataFile) -> bool {
        head.length >= self.file_maximum_size
    }

    fn needs_dissolve(&self, file: &DataFile) -> bool {
        // Files without live data are always dropped
        if !file.has_live_data() {
            return true;
        }

        // Many small files get merged into the head
        if file.length < self.file_minimum_size {
            return true;
        }

        file.use_ratio() < self.minimum_use_ratio
    }
}
