pub mod file;
pub mod global;
pub mod reader;

pub use file::{FileSizeMonitor, TrackedFile};
pub use global::{
    GlobalMonitor, MonitorError, PeriodicEvent, Stats, DEFAULT_CLOSE_TIMEOUT,
    DEFAULT_SHORT_NAME_REGEX,
};
pub use reader::{FileReader, SharedFile};
