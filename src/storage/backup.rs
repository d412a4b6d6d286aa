use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::layout::StorageLayout;

/// Which channel file a backup item refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTarget {
    DataFile(u64),
    Transactions,
}

pub enum BackupItem {
    Write { channel: usize, target: BackupTarget, offset: u64, bytes: Vec<u8> },
    Truncate { channel: usize, target: BackupTarget, length: u64 },
    Delete { channel: usize, target: BackupTarget },
    /// Acknowledged once every earlier item has been applied
    Flush(Sender<()>),
    Shutdown,
}

/// Handle given to file managers for mirroring their writes
#[derive(Clone)]
pub struct BackupSink {
    sender: Sender<BackupItem>,
}

impl BackupSink {
    pub fn write(&self, channel: usize, target: BackupTarget, offset: u64, bytes: Vec<u8>) {
        self.send(BackupItem::Write { channel, target, offset, bytes });
    }

    pub fn truncate(&self, channel: usize, target: BackupTarget, length: u64) {
        self.send(BackupItem::Truncate { channel, target, length });
    }

    pub fn delete(&self, channel: usize, target: BackupTarget) {
        self.send(BackupItem::Delete { channel, target });
    }

    fn send(&self, item: BackupItem) {
        if self.sender.send(item).is_err() {
            warn!("backup handler is stopped, dropping backup item");
        }
    }
}

/// Continuous backup: mirrors every channel file mutation into a second layout
pub struct BackupHandler {
    sender: Option<Sender<BackupItem>>,
    thread: Option<JoinHandle<Result<()>>>,
    pub layout: StorageLayout,
}

impl BackupHandler {
    pub fn start(backup_path: PathBuf, channel_count: usize) -> Result<Self> {
        let layout = StorageLayout::new(backup_path)?;
        layout.create_channel_dirs(channel_count)?;

        let (sender, receiver) = unbounded();
        let worker_layout = layout.clone();
        let thread = thread::Builder::new()
            .name("gigastore-backup".to_string())
            .spawn(move || Self::backup_worker(receiver, worker_layout))?;

        Ok(BackupHandler {
            sender: Some(sender),
            thread: Some(thread),
            layout,
        })
    }

    pub fn sink(&self) -> Option<BackupSink> {
        self.sender.as_ref().map(|sender| BackupSink { sender: sender.clone() })
    }

    /// Blocks until every item queued so far has been applied.
    pub fn flush(&self) -> Result<()> {
        let sender = self.sender.as_ref()
            .ok_or_else(|| Error::invalid_state("backup handler already stopped"))?;
        let (ack_sender, ack_receiver) = unbounded();
        sender.send(BackupItem::Flush(ack_sender))
            .map_err(|_| Error::invalid_state("backup thread terminated"))?;
        ack_receiver.recv()
            .map_err(|_| Error::new(ErrorKind::Internal, "backup thread terminated before flush".to_string()))
    }

    /// Drains the queue and joins the backup thread.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(BackupItem::Shutdown);
        }
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                Error::new(ErrorKind::Internal, "backup thread panicked".to_string())
            })?,
            None => Ok(()),
        }
    }

    fn backup_worker(receiver: Receiver<BackupItem>, layout: StorageLayout) -> Result<()> {
        while let Ok(item) = receiver.recv() {
            if matches!(item, BackupItem::Shutdown) {
                break;
            }
            if let Err(e) = Self::apply(&layout, item) {
                error!(error = %e, "backup failed, stopping backup thread");
                return Err(e);
            }
        }
        debug!("backup thread finished");
        Ok(())
    }

    fn apply(layout: &StorageLayout, item: BackupItem) -> Result<()> {
        match item {
            BackupItem::Write { channel, target, offset, bytes } => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(Self::target_path(layout, channel, target))?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&bytes)?;
            }
            BackupItem::Truncate { channel, target, length } => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(Self::target_path(layout, channel, target))?;
                file.set_len(length)?;
            }
            BackupItem::Delete { channel, target } => {
                let path = Self::target_path(layout, channel, target);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
            BackupItem::Flush(ack) => {
                let _ = ack.send(());
            }
            BackupItem::Shutdown => {}
        }
        Ok(())
    }

    fn target_path(layout: &StorageLayout, channel: usize, target: BackupTarget) -> PathBuf {
        match target {
            BackupTarget::DataFile(number) => layout.data_file_path(channel, number),
            BackupTarget::Transactions => layout.transactions_path(channel),
        }
    }
}

impl Drop for BackupHandler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "backup handler stopped with error");
        }
    }
}
