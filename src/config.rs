//! Settings for the logger, stored as [ron]. Every field is optional in the
//! file; anything left out takes its default:
//!
//! ```text
//! (
//!     port: Some("/dev/ttyACM0"),
//!     baud_rate: 115200,
//!     data_dir: "data",
//!     read_timeout_ms: 1000,
//!     poll_interval_ms: 100,
//!     silence_timeout_ms: 60000,
//!     channel_capacity: 512,
//!     rolling_window: 10,
//! )
//! ```

use crate::device::DEFAULT_BAUD_RATE;
use crate::error::LoggerError;
use crate::rolling_window::DEFAULT_WINDOW;
use crate::serial_reader::DEFAULT_CHANNEL_CAPACITY;

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Everything about a logging run that is not specific to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Serial port to open. `None` means ask.
    pub port: Option<PathBuf>,
    pub baud_rate: u32,
    /// Logs are written to `<data_dir>/<subject_id>/`.
    pub data_dir: PathBuf,
    /// How long one read on the serial link may block.
    pub read_timeout_ms: u64,
    /// How often the consumer wakes up when no records arrive.
    pub poll_interval_ms: u64,
    /// A session with no device output for this long is stopped.
    pub silence_timeout_ms: u64,
    pub channel_capacity: usize,
    /// Trials in the rolling success rate.
    pub rolling_window: usize,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            data_dir: PathBuf::from("data"),
            read_timeout_ms: 1000,
            poll_interval_ms: 100,
            silence_timeout_ms: 60_000,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            rolling_window: DEFAULT_WINDOW,
        }
    }
}

impl LoggerSettings {
    /// Reads settings from a ron file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoggerError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| LoggerError::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_ron(&text)
    }

    pub fn from_ron(text: &str) -> Result<Self, LoggerError> {
        ron::de::from_str(text).map_err(|e| LoggerError::Settings(e.to_string()))
    }

    /// Writes the settings out as pretty-printed ron.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), LoggerError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| LoggerError::Settings(e.to_string()))?;
        fs::write(path, text).map_err(LoggerError::from)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}
