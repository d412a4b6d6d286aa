use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use crate::core::error::{Error, ErrorKind, Result};

/// One numbered data file of a channel
pub struct DataFile {
    pub number: u64,
    pub path: PathBuf,
    pub file: File,
    pub length: u64,
    /// Bytes of records that are still the current version of a live entity
    pub live_length: u64,
    pub live_count: u64,
}

impl DataFile {
    pub fn create(number: u64, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(DataFile { number, path, file, length: 0, live_length: 0, live_count: 0 })
    }

    pub fn open(number: u64, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let length = file.metadata()?.len();

        Ok(DataFile { number, path, file, length, live_length: 0, live_count: 0 })
    }

    /// Appends bytes and returns the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.length;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.length += bytes.len() as u64;
        Ok(offset)
    }

    pub fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset + length > self.length {
            return Err(Error::new(
                ErrorKind::InvalidEntityLength,
                format!(
                    "read of {} bytes at {} exceeds data file {} length {}",
                    length, offset, self.number, self.length
                ),
            ));
        }

        let mut buffer = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn truncate(&mut self, length: u64) -> Result<()> {
        self.file.set_len(length)?;
        self.file.sync_data()?;
        self.length = length;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn add_live(&mut self, record_length: u64) {
        self.live_length += record_length;
        self.live_count += 1;
    }

    pub fn remove_live(&mut self, record_length: u64) {
        self.live_length = self.live_length.saturating_sub(record_length);
        self.live_count = self.live_count.saturating_sub(1);
    }

    pub fn has_live_data(&self) -> bool {
        self.live_count > 0
    }

    pub fn use_ratio(&self) -> f64 {
        if self.length == 0 {
            1.0
        } else {
            self.live_length as f64 / self.length as f64
        }
    }

    pub fn delete(self) -> Result<()> {
        let DataFile { path, file, .. } = self;
        drop(file);
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = DataFile::create(0, dir.path().join("channel_0_0.dat")).unwrap();

        assert_eq!(file.append(b"hello").unwrap(), 0);
        assert_eq!(file.append(b"world").unwrap(), 5);
        assert_eq!(file.read_at(5, 5).unwrap(), b"world");
        assert!(file.read_at(8, 5).is_err());

        file.truncate(5).unwrap();
        assert_eq!(file.length, 5);
        assert_eq!(file.file.metadata().unwrap().len(), 5);
    }

    #[test]
    fn use_ratio_tracks_live_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = DataFile::create(0, dir.path().join("f.dat")).unwrap();
        file.append(&[0u8; 100]).unwrap();
        file.add_live(60);
        file.add_live(40);
        file.remove_live(40);
        assert!((file.use_ratio() - 0.6).abs() < f64::EPSILON);
        assert!(file.has_live_data());
    }
}
