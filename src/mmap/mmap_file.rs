use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;
use crate::core::error::Result;

/// Read-only memory-mapped view of a data file prefix
pub struct MmapFile {
    pub mmap: Option<Mmap>,  // None for empty files, which cannot be mapped
    pub len: usize,
}

impl MmapFile {
    /// Maps the first `len` bytes of the file at `path`.
    pub fn open_read_only<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        if len == 0 {
            return Ok(MmapFile { mmap: None, len: 0 });
        }

        let file = File::open(&path)?;
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(&file)? };

        Ok(MmapFile { mmap: Some(mmap), len: len as usize })
    }

    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..self.len],
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_prefix_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.dat");
        std::fs::write(&path, b"0123456789").unwrap();

        let mapped = MmapFile::open_read_only(&path, 4).unwrap();
        assert_eq!(mapped.data(), b"0123");

        let empty = MmapFile::open_read_only(&path, 0).unwrap();
        assert!(empty.data().is_empty());
    }
}
