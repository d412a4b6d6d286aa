use std::time::SystemTime;
use serde::{Serialize, Deserialize};

/// Storage statistics for monitoring, one entry per channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub creation_time: SystemTime,
    pub channels: Vec<ChannelStatistics>,
}

impl StorageStatistics {
    pub fn file_count(&self) -> usize {
        self.channels.iter().map(|c| c.files.len()).sum()
    }

    pub fn total_data_length(&self) -> u64 {
        self.channels.iter().map(|c| c.total_data_length()).sum()
    }

    pub fn live_data_length(&self) -> u64 {
        self.channels.iter().map(|c| c.live_data_length()).sum()
    }

    pub fn entity_count(&self) -> u64 {
        self.channels.iter().map(|c| c.entity_count).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub channel: usize,
    pub files: Vec<FileStatistics>,
    pub entity_count: u64,
    pub cached_bytes: u64,
}

impl ChannelStatistics {
    pub fn total_data_length(&self) -> u64 {
        self.files.iter().map(|f| f.total_length).sum()
    }

    pub fn live_data_length(&self) -> u64 {
        self.files.iter().map(|f| f.live_length).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatistics {
    pub file_number: u64,
    pub total_length: u64,
    pub live_length: u64,
    pub live_count: u64,
}

impl FileStatistics {
    pub fn use_ratio(&self) -> f64 {
        if self.total_length == 0 {
            1.0
        } else {
            self.live_length as f64 / self.total_length as f64
        }
    }
}
