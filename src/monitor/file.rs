use std::collections::VecDeque;
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::debug;

use crate::squash::timestamp::STANDARD_FORMAT;
use crate::squash::{Message, Squasher};

/// Stat-derived view of a file: how big it is, where we are, and which
/// inode we think we are reading.
#[derive(Debug)]
pub struct FileSizeMonitor {
    path: PathBuf,
    size: u64,
    /// Next byte offset to read; never exceeds `size` observed at stat time.
    pub position: u64,
    inode: Option<u64>,
}

impl FileSizeMonitor {
    pub fn new(path: &Path) -> io::Result<Self> {
        let mut monitor = Self {
            path: path.to_path_buf(),
            size: 0,
            position: 0,
            inode: None,
        };
        monitor.check()?;
        Ok(monitor)
    }

    /// Restat the path; an inode change rewinds the read position.
    pub fn check(&mut self) -> io::Result<()> {
        let metadata = std::fs::metadata(&self.path)?;
        let inode = get_inode(&metadata);
        self.size = metadata.len();
        if self.inode != Some(inode) {
            self.reset(inode);
        }
        Ok(())
    }

    fn reset(&mut self, inode: u64) {
        self.position = if self.inode.is_none() {
            // First sight: tail, do not re-ingest history.
            self.size
        } else {
            // Rotated, truncated, or replaced: start over.
            0
        };
        self.inode = Some(inode);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data_available(&self) -> bool {
        self.size > self.position
    }
}

/// Per-file tailing state: an optionally-open non-blocking descriptor, the
/// partial-line carry buffer, the queue of lines awaiting a squash tick,
/// and the squasher that last consumed them.
#[derive(Debug)]
pub struct TrackedFile {
    pub filename: String,
    pub short_name: String,
    pub monitor: FileSizeMonitor,
    file: Option<File>,
    /// Partial line carried between reads; never contains a newline.
    buffer: String,
    /// Complete lines awaiting the next squash tick, with their read times.
    pub lines: VecDeque<(NaiveDateTime, String)>,
    /// Most recent squasher; its counters stay inspectable after a squash.
    pub squasher: Squasher,
    last_update: Instant,
}

impl TrackedFile {
    pub fn new(path: &Path, short_name: String) -> io::Result<Self> {
        Ok(Self {
            filename: path.to_string_lossy().into_owned(),
            short_name,
            monitor: FileSizeMonitor::new(path)?,
            file: None,
            buffer: String::new(),
            lines: VecDeque::new(),
            squasher: Squasher::new(),
            last_update: Instant::now(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn open(&mut self, seek_pos: Option<u64>) -> io::Result<()> {
        let mut file = File::open(&self.filename)?;
        set_nonblocking(&file)?;
        if let Some(pos) = seek_pos {
            file.seek(SeekFrom::Start(pos))?;
        }
        self.file = Some(file);
        self.last_update = Instant::now();
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Drain whatever the descriptor has for us right now. Would-block and
    /// EOF-without-data both leave the state untouched.
    pub fn read(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut data = Vec::new();
        let mut chunk = [0u8; 16384];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        if data.is_empty() {
            return Ok(());
        }

        self.buffer.push_str(&latin1_to_string(&data));
        let read_time = Local::now().naive_local();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.lines
                .push_back((read_time, line.trim_end().to_string()));
        }

        self.monitor.position = file.stream_position()?;
        self.last_update = Instant::now();
        debug!(
            filename = %self.filename,
            queued = self.lines.len(),
            "read new log data"
        );
        Ok(())
    }

    pub fn elapsed_since_last_update(&self) -> Duration {
        self.last_update.elapsed()
    }

    /// Turn the queued lines into Messages. Lines of an unfinished
    /// multi-line group go back to the front of the queue, with their
    /// original timestamps rendered back in, so the next tick continues
    /// where this one stopped.
    pub fn squash(&mut self) -> Vec<Message> {
        let mut squasher = Squasher::new();
        while let Some((read_time, line)) = self.lines.pop_front() {
            squasher.add_lines(&line, Some(read_time));
        }
        let messages = squasher.squash();

        for pending in squasher.pending_lines().iter().rev() {
            let line = format!(
                "{} {}",
                pending.timestamp.format(STANDARD_FORMAT),
                pending.value
            );
            self.lines.push_front((pending.timestamp, line));
        }

        self.squasher = squasher;
        messages
    }
}

/// Latin-1 is byte-lossless: corrupted or binary writes decode to
/// something instead of failing the whole read.
fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| byte as char).collect()
}

#[cfg(unix)]
fn set_nonblocking(file: &File) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_nonblocking(_file: &File) -> io::Result<()> {
    // Regular-file reads do not block; nothing to configure.
    Ok(())
}

// Platform-specific inode retrieval
#[cfg(unix)]
fn get_inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn get_inode(metadata: &Metadata) -> u64 {
    // Size plus mtime is an imperfect proxy, but good enough to notice a
    // rotation.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        modified.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_initial_position_tails_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "old line\n").unwrap();

        let tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        assert_eq!(tracked.monitor.position, 9);
        assert!(!tracked.monitor.data_available());
    }

    #[test]
    fn test_read_splits_lines_and_buffers_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "").unwrap();

        let mut tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        tracked.open(Some(0)).unwrap();

        let mut writer = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(writer, "one\ntwo\npart").unwrap();
        writer.flush().unwrap();

        tracked.read().unwrap();
        assert_eq!(tracked.lines.len(), 2);
        assert_eq!(tracked.lines[0].1, "one");
        assert_eq!(tracked.lines[1].1, "two");
        assert_eq!(tracked.monitor.position, 12);

        write!(writer, "ial\n").unwrap();
        writer.flush().unwrap();

        tracked.read().unwrap();
        assert_eq!(tracked.lines.len(), 3);
        assert_eq!(tracked.lines[2].1, "partial");
    }

    #[test]
    fn test_read_tolerates_arbitrary_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "").unwrap();

        let mut tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        tracked.open(Some(0)).unwrap();

        let mut writer = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writer.write_all(b"garbage \xff\xfe bytes\n").unwrap();
        writer.flush().unwrap();

        tracked.read().unwrap();
        assert_eq!(tracked.lines.len(), 1);
        assert_eq!(tracked.lines[0].1, "garbage \u{ff}\u{fe} bytes");
    }

    #[test]
    fn test_inode_change_rewinds_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "some history\n").unwrap();

        let mut tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        assert_eq!(tracked.monitor.position, 13);

        // Write the replacement while the original still exists so the two
        // cannot share an inode, then rotate it into place.
        let rotated = dir.path().join("ioc.log.new");
        std::fs::write(&rotated, "rotated\n").unwrap();
        std::fs::rename(&rotated, &path).unwrap();

        tracked.monitor.check().unwrap();
        assert_eq!(tracked.monitor.position, 0);
        assert!(tracked.monitor.data_available());
    }

    #[test]
    fn test_squash_drains_queue_and_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "").unwrap();

        let mut tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        let read_time = naive(2022, 11, 9, 9, 32, 1);
        for _ in 0..3 {
            tracked.lines.push_back((read_time, "hello".to_string()));
        }

        let messages = tracked.squash();
        assert!(tracked.lines.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "[3x] hello");
        assert_eq!(tracked.squasher.messages.len(), 3);
        assert_eq!(tracked.squasher.num_bytes, 18);
    }

    #[test]
    fn test_squash_requeues_pending_multiline_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.log");
        std::fs::write(&path, "").unwrap();

        let mut tracked = TrackedFile::new(&path, "ioc".to_string()).unwrap();
        let read_time = naive(2022, 11, 9, 9, 32, 1);
        tracked
            .lines
            .push_back((read_time, "@@@ @@@ @@@ @@@ @@@".to_string()));
        tracked
            .lines
            .push_back((read_time, "@@@ Current time: Thu Nov 10 10:19:06 2022".to_string()));

        let messages = tracked.squash();
        assert!(messages.is_empty());
        assert_eq!(tracked.lines.len(), 2);
        assert!(tracked.lines[0].1.ends_with("@@@ @@@ @@@ @@@ @@@"));

        tracked
            .lines
            .push_back((read_time, "@@@ @@@ @@@ @@@ @@@".to_string()));
        let messages = tracked.squash();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "procServ status update");
        assert_eq!(messages[0].source_lines, 3);
    }
}
