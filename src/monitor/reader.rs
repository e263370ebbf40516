use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::file::TrackedFile;

pub type SharedFile = Arc<Mutex<TrackedFile>>;

/// Background poller over every open file.
///
/// The reader is the only writer of per-file read state (descriptor, carry
/// buffer, queue tail); the monitor drains queues at squash time. Map
/// membership is guarded by a mutex, and files are read from a snapshot so
/// the lock is never held across I/O.
#[derive(Debug, Clone)]
pub struct FileReader {
    files: Arc<Mutex<IndexMap<String, SharedFile>>>,
    close_timeout: Duration,
    poll_period: Duration,
}

impl FileReader {
    pub fn new(close_timeout: Duration, poll_period: Duration) -> Self {
        Self {
            files: Arc::new(Mutex::new(IndexMap::new())),
            close_timeout,
            poll_period,
        }
    }

    /// Open the file (if not already open) at its monitored position and
    /// start polling it.
    pub fn add_file(&self, file: &SharedFile) -> io::Result<()> {
        if let Ok(mut tracked) = file.lock() {
            if !tracked.is_open() {
                let seek_pos = tracked.monitor.position;
                tracked.open(Some(seek_pos))?;
            }
            let filename = tracked.filename.clone();
            drop(tracked);

            if let Ok(mut files) = self.files.lock() {
                files.insert(filename, Arc::clone(file));
            }
        }
        Ok(())
    }

    pub fn remove_file(&self, filename: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.shift_remove(filename);
        }
    }

    pub fn len(&self) -> usize {
        self.files.lock().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One pass over every polled file: read what is available, then close
    /// and drop anything that errored or sat idle past the close timeout.
    pub fn poll_once(&self) {
        let snapshot: Vec<SharedFile> = match self.files.lock() {
            Ok(files) => files.values().cloned().collect(),
            Err(_) => return,
        };

        let mut to_remove: Vec<String> = Vec::new();
        for file in snapshot {
            let Ok(mut tracked) = file.lock() else {
                continue;
            };
            match tracked.read() {
                Ok(()) => {
                    if tracked.elapsed_since_last_update() > self.close_timeout {
                        warn!(
                            filename = %tracked.filename,
                            timeout_s = self.close_timeout.as_secs_f64(),
                            "file has not updated within the close timeout; \
                             closing and freeing up resources"
                        );
                        tracked.close();
                        to_remove.push(tracked.filename.clone());
                    }
                }
                Err(err) => {
                    warn!(
                        filename = %tracked.filename,
                        error = %err,
                        "read failed; dropping file until the next glob pass"
                    );
                    tracked.close();
                    to_remove.push(tracked.filename.clone());
                }
            }
        }

        if to_remove.is_empty() {
            return;
        }
        if let Ok(mut files) = self.files.lock() {
            for filename in to_remove {
                files.shift_remove(&filename);
            }
        }
    }

    /// Spawn the poll loop; it runs until the shutdown flag flips.
    pub fn start(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let reader = self.clone();
        tokio::spawn(async move {
            info!("file reader poll loop started");
            while !*shutdown_rx.borrow() {
                reader.poll_once();
                tokio::time::sleep(reader.poll_period).await;
            }
            info!("file reader poll loop stopped");
        })
    }
}
