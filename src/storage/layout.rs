use std::path::{Path, PathBuf};
use std::fs;
use crate::core::error::Result;

/// Directory structure for channel files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(StorageLayout { base_dir })
    }

    pub fn create_channel_dirs(&self, channel_count: usize) -> Result<()> {
        for channel in 0..channel_count {
            fs::create_dir_all(self.channel_dir(channel))?;
        }
        Ok(())
    }

    pub fn channel_dir(&self, channel: usize) -> PathBuf {
        self.base_dir.join(format!("channel_{}", channel))
    }

    pub fn data_file_path(&self, channel: usize, file_number: u64) -> PathBuf {
        self.channel_dir(channel)
            .join(format!("channel_{}_{}.dat", channel, file_number))
    }

    pub fn transactions_path(&self, channel: usize) -> PathBuf {
        self.channel_dir(channel).join(format!("transactions_{}.sft", channel))
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.base_dir.join("used.lock")
    }

    /// Existing channel directories, used to detect a channel count change.
    pub fn existing_channel_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry.file_name().to_string_lossy().starts_with("channel_")
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Data file numbers present on disk for a channel, sorted.
    pub fn data_file_numbers(&self, channel: usize) -> Result<Vec<u64>> {
        let mut numbers = Vec::new();
        let dir = self.channel_dir(channel);
        if !dir.exists() {
            return Ok(numbers);
        }

        let prefix = format!("channel_{}_", channel);
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(number) = parse_data_file_number(&path, &prefix) {
                numbers.push(number);
            }
        }

        numbers.sort();
        Ok(numbers)
    }
}

fn parse_data_file_number(path: &Path, prefix: &str) -> Option<u64> {
    if path.extension().and_then(|s| s.to_str()) != Some("dat") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(prefix)?
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_data_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        layout.create_channel_dirs(2).unwrap();

        for number in [3u64, 1, 12] {
            fs::write(layout.data_file_path(1, number), b"").unwrap();
        }
        fs::write(layout.transactions_path(1), b"").unwrap();

        assert_eq!(layout.data_file_numbers(1).unwrap(), vec![1, 3, 12]);
        assert!(layout.data_file_numbers(0).unwrap().is_empty());
        assert_eq!(layout.existing_channel_count().unwrap(), 2);
    }
}
