//! The serial-port handle provider. [`LineDevice`] is the seam between the
//! logger and whatever produces lines: a real port ([`SerialDevice`]), or one
//! of the stand-ins in [`dummy_device`](crate::dummy_device).

use crate::error::DeviceError;

use log::{debug, warn};
use serial2::SerialPort;
use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

/// Baud rate the behaviour box firmware is built with.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// A partial line longer than this is flushed as-is instead of growing
/// forever while we wait for a newline that never comes.
const MAX_PENDING_BYTES: usize = 4096;

/// A line-oriented, bidirectional link to the device.
pub trait LineDevice: Send {
    /// Blocks for at most the link's read timeout. `Ok(None)` means no
    /// complete line arrived in that time, which is not an error.
    fn read_line(&mut self) -> Result<Option<String>, DeviceError>;

    /// Writes `line` followed by a newline.
    fn write_line(&mut self, line: &str) -> Result<(), DeviceError>;

    /// Releases the link. Taking `self` by value means it can only happen
    /// once.
    fn close(self: Box<Self>);
}

/// Reassembles newline-delimited text from arbitrarily chunked bytes.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
    ready: VecDeque<String>,
    // set after a runaway line is cut short; the rest of it is dropped
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes from the link. Complete, non-empty lines become
    /// available through [`LineAssembler::next_line`].
    pub fn push(&mut self, bytes: &[u8]) {
        for &c in bytes {
            if c == b'\n' {
                if !std::mem::take(&mut self.discarding) {
                    self.finish_line();
                }
            } else if !self.discarding {
                self.pending.push(c);
                if self.pending.len() >= MAX_PENDING_BYTES {
                    warn!(
                        "No newline in {} bytes, dropping the rest of the line",
                        MAX_PENDING_BYTES
                    );
                    self.finish_line();
                    self.discarding = true;
                }
            }
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn finish_line(&mut self) {
        // Garbage from the hardware buffer at the start of a transmission is
        // often not valid utf-8; keep what we can so the parser can flag it.
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches('\r')
            .to_owned();
        self.pending.clear();
        if !line.trim().is_empty() {
            self.ready.push_back(line);
        }
    }
}

/// A [`LineDevice`] backed by a real serial port.
pub struct SerialDevice {
    port: SerialPort,
    assembler: LineAssembler,
}

impl SerialDevice {
    /// Opens `path` at `baud_rate`; reads give up after `read_timeout`.
    pub fn open(
        path: impl AsRef<Path>,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let mut port = SerialPort::open(path.as_ref(), baud_rate).map_err(DeviceError::Fatal)?;
        port.set_read_timeout(read_timeout)
            .map_err(DeviceError::Fatal)?;
        debug!("Opened {} at {} baud", path.as_ref().display(), baud_rate);

        Ok(Self {
            port,
            assembler: LineAssembler::new(),
        })
    }

    /// The serial ports the operating system knows about.
    pub fn available_ports() -> io::Result<Vec<PathBuf>> {
        SerialPort::available_ports()
    }
}

impl LineDevice for SerialDevice {
    fn read_line(&mut self) -> Result<Option<String>, DeviceError> {
        if let Some(line) = self.assembler.next_line() {
            return Ok(Some(line));
        }

        let mut buffer = [0; 256];
        match self.port.read(&mut buffer) {
            Ok(read_len) => self.assembler.push(&buffer[..read_len]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(DeviceError::classify(e)),
        }

        Ok(self.assembler.next_line())
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let mut out = String::with_capacity(line.len() + 1);
        out.push_str(line);
        out.push('\n');
        self.port
            .write_all(out.as_bytes())
            .map_err(DeviceError::classify)?;
        self.port.flush().map_err(DeviceError::classify)
    }

    fn close(self: Box<Self>) {
        // serial2 closes the file descriptor when the port is dropped
        debug!("Closing serial port");
        drop(self);
    }
}
