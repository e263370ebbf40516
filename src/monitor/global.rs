use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use super::file::TrackedFile;
use super::reader::{FileReader, SharedFile};

/// The fixed path layout IOC logs live under at the facility; a `name`
/// capture becomes the `ioc` output field.
pub const DEFAULT_SHORT_NAME_REGEX: &str = r"^/cds/data/iocData/(?P<name>.*)/iocInfo/.*$";

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid file glob: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("invalid short-name regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Aggregate reduction counters across all files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub bytes_in: usize,
    pub bytes_out: usize,
    pub lines_in: usize,
    pub lines_out: usize,
}

impl Stats {
    pub fn log(&self) {
        let ratio = if self.bytes_in > 0 {
            self.bytes_out as f64 / self.bytes_in as f64
        } else {
            0.0
        };
        info!(
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            lines_in = self.lines_in,
            lines_out = self.lines_out,
            ratio = format!("{ratio:.3}"),
            "squash statistics"
        );
    }
}

/// A poll-driven timer: fires when `period` has elapsed since it last fired.
#[derive(Debug)]
pub struct PeriodicEvent {
    period: Duration,
    last_fired: Instant,
}

impl PeriodicEvent {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: Instant::now(),
        }
    }

    pub fn ready(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.period {
            self.last_fired = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Discovers files by glob, keeps their trackers alive, and turns their
/// queued lines into JSON output at squash ticks.
pub struct GlobalMonitor {
    file_glob: String,
    short_name_regex: Regex,
    pub files: IndexMap<String, SharedFile>,
    pub reader: FileReader,
    pub stats: Stats,
}

impl GlobalMonitor {
    pub fn new(
        file_glob: &str,
        short_name_regex: &str,
        close_timeout: Duration,
    ) -> Result<Self, MonitorError> {
        // Fail on a bad glob now rather than on every update tick.
        glob::Pattern::new(file_glob)?;
        Ok(Self {
            file_glob: file_glob.to_string(),
            short_name_regex: Regex::new(short_name_regex)?,
            files: IndexMap::new(),
            reader: FileReader::new(close_timeout, Duration::from_millis(10)),
            stats: Stats::default(),
        })
    }

    fn short_name(&self, filename: &str) -> String {
        if let Some(caps) = self.short_name_regex.captures(filename) {
            let whole = caps
                .get(0)
                .map(|m| m.start() == 0 && m.end() == filename.len())
                .unwrap_or(false);
            if whole {
                if let Some(name) = caps.name("name") {
                    return name.as_str().to_string();
                }
            }
        }
        filename.to_string()
    }

    pub fn monitored_files(&self) -> Vec<String> {
        self.files_with_open(true)
    }

    pub fn unmonitored_files(&self) -> Vec<String> {
        self.files_with_open(false)
    }

    fn files_with_open(&self, open: bool) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|(filename, file)| {
                let tracked = file.lock().ok()?;
                (tracked.is_open() == open).then(|| filename.clone())
            })
            .collect()
    }

    /// Rescan the glob: track new files, restat known ones, hand newly
    /// readable files to the reader, drop files that left the glob.
    pub fn update(&mut self) {
        let entries = match glob::glob(&self.file_glob) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "glob failed");
                return;
            }
        };

        let mut present: HashSet<String> = HashSet::new();
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "unreadable glob entry");
                    continue;
                }
            };
            let filename = path.to_string_lossy().into_owned();
            present.insert(filename.clone());
            if self.files.contains_key(&filename) {
                continue;
            }

            let short_name = self.short_name(&filename);
            match TrackedFile::new(&path, short_name) {
                Ok(tracked) => {
                    self.files
                        .insert(filename, Arc::new(Mutex::new(tracked)));
                }
                Err(err) => {
                    warn!(filename = %filename, error = %err, "could not stat new log file");
                }
            }
        }

        let gone: Vec<String> = self
            .files
            .keys()
            .filter(|filename| !present.contains(*filename))
            .cloned()
            .collect();
        for filename in gone {
            info!(filename = %filename, "log file no longer matches the glob; dropping");
            self.reader.remove_file(&filename);
            if let Some(file) = self.files.shift_remove(&filename) {
                if let Ok(mut tracked) = file.lock() {
                    tracked.close();
                }
            }
        }

        let previously_monitored = self.monitored_files().len();

        let mut failed: Vec<String> = Vec::new();
        for (filename, file) in &self.files {
            let Ok(mut tracked) = file.lock() else {
                continue;
            };
            if let Err(err) = tracked.monitor.check() {
                warn!(
                    filename = %filename,
                    error = %err,
                    "stat failed; dropping file until the next glob pass"
                );
                tracked.close();
                failed.push(filename.clone());
                continue;
            }
            if !tracked.is_open() && tracked.monitor.data_available() {
                drop(tracked);
                info!(filename = %filename, "log file changed");
                if let Err(err) = self.reader.add_file(file) {
                    warn!(filename = %filename, error = %err, "could not open log file");
                }
            }
        }
        for filename in failed {
            self.reader.remove_file(&filename);
            self.files.shift_remove(&filename);
        }

        let monitored = self.monitored_files().len();
        if monitored != previously_monitored {
            warn!(
                monitored = monitored,
                total = self.files.len(),
                "monitored files changed"
            );
        }
    }

    /// Squash every file with queued lines, writing one JSON object per
    /// Message with the file's short name injected as `ioc`.
    pub fn squash<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        for file in self.files.values() {
            let mut output_lines: Vec<String> = Vec::new();
            {
                let Ok(mut tracked) = file.lock() else {
                    continue;
                };
                if tracked.lines.is_empty() {
                    continue;
                }

                let messages = tracked.squash();
                self.stats.bytes_in += tracked.squasher.num_bytes;
                self.stats.lines_in += tracked.squasher.messages.len();
                self.stats.lines_out += messages.len();

                for message in &messages {
                    let mut obj = message.to_json();
                    obj.insert(
                        "ioc".to_string(),
                        Value::String(tracked.short_name.clone()),
                    );
                    let line = Value::Object(obj).to_string();
                    self.stats.bytes_out += line.len() + 1;
                    output_lines.push(line);
                }
            }

            // The file lock is released before any potentially blocking
            // write.
            for line in output_lines {
                writeln!(out, "{line}")?;
            }
        }
        Ok(())
    }

    /// Main loop: rescan and squash on their own timers until shutdown.
    pub async fn run(
        &mut self,
        file_check_period: Duration,
        squash_period: Duration,
        show_statistics_after: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        let mut file_check = PeriodicEvent::new(file_check_period);
        let mut squash_timer = PeriodicEvent::new(squash_period);
        let mut num_squashes = 0u64;
        let mut stdout = io::stdout();

        self.update();

        while !*shutdown_rx.borrow() {
            if file_check.ready() {
                self.update();
            }
            if squash_timer.ready() {
                self.squash(&mut stdout)?;
                stdout.flush()?;
                num_squashes += 1;
                if show_statistics_after > 0 && num_squashes % show_statistics_after == 0 {
                    self.stats.log();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("monitor loop stopped");
        Ok(())
    }
}
