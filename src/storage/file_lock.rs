use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::layout::StorageLayout;

/// Content of `used.lock`: `lastWriteTime;expirationTime;identifier` in epoch millis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFileContent {
    pub last_write_millis: u64,
    pub expiration_millis: u64,
    pub identifier: String,
}

impl LockFileContent {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.trim().splitn(3, ';');
        let mut number = |name: &str| -> Result<u64> {
            parts
                .next()
                .and_then(|p| p.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::new(ErrorKind::Parse, format!("lock file {} missing or invalid", name)))
        };
        let last_write_millis = number("last write time")?;
        let expiration_millis = number("expiration time")?;
        let identifier = parts
            .next()
            .map(|p| p.trim().to_string())
            .ok_or_else(|| Error::new(ErrorKind::Parse, "lock file identifier missing".to_string()))?;

        Ok(LockFileContent { last_write_millis, expiration_millis, identifier })
    }

    pub fn format(&self) -> String {
        format!("{};{};{}", self.last_write_millis, self.expiration_millis, self.identifier)
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expiration_millis <= now_millis
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Guards a storage directory against concurrent processes: an OS file lock
/// plus a periodically refreshed lease inside the file.
pub struct LockFileManager {
    path: PathBuf,
    identifier: String,
    file: File,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LockFileManager {
    pub fn acquire(layout: &StorageLayout, update_interval: Duration) -> Result<Self> {
        let path = layout.lock_file_path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Self::lock_exclusive(&file)?;

        let mut text = String::new();
        file.read_to_string(&mut text)?;
        if !text.trim().is_empty() {
            match LockFileContent::parse(&text) {
                Ok(existing) if !existing.is_expired(now_millis()) => {
                    return Err(Error::new(
                        ErrorKind::LockContention,
                        format!("storage {} is in use by {}", layout.base_dir.display(), existing.identifier),
                    ));
                }
                Ok(existing) => debug!(identifier = %existing.identifier, "taking over expired lock file"),
                Err(e) => warn!(error = %e, "ignoring unreadable lock file"),
            }
        }

        let identifier = Uuid::new_v4().to_string();
        Self::write_content(&mut file, &identifier, update_interval)?;

        let (stop, stopped) = bounded::<()>(1);
        let mut refresh_file = file.try_clone()?;
        let refresh_identifier = identifier.clone();
        let thread = thread::Builder::new()
            .name("gigastore-lock".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(update_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = Self::write_content(&mut refresh_file, &refresh_identifier, update_interval) {
                            warn!(error = %e, "failed to refresh lock file");
                        }
                    }
                    _ => break,
                }
            })?;

        debug!(path = %path.display(), %identifier, "acquired storage lock");
        Ok(LockFileManager {
            path,
            identifier,
            file,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn write_content(file: &mut File, identifier: &str, update_interval: Duration) -> Result<()> {
        let now = now_millis();
        let content = LockFileContent {
            last_write_millis: now,
            // one missed refresh is tolerated
            expiration_millis: now + 2 * update_interval.as_millis() as u64,
            identifier: identifier.to_string(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(content.format().as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(Error::new(
                ErrorKind::LockContention,
                "storage lock file is locked by another process".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> Result<()> {
        Ok(())
    }

    /// Stops refreshing and removes the lock file.
    pub fn release(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| Error::new(ErrorKind::Internal, "lock file thread panicked".to_string()))?;
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for LockFileManager {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release lock file");
        }

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            unsafe {
                flock(self.file.as_raw_fd(), LOCK_UN);
            }
        }
    }
}
