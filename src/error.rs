//! The error taxonomy for the logger. Callers branch on the kind of error,
//! never on its message.
//!
//! Note that a line that does not match the wire grammar is *not* an error:
//! it becomes [`Record::Malformed`](crate::line_protocol::Record::Malformed)
//! and flows through the pipeline like any other record.

use std::{borrow::Cow, error::Error, fmt, io};

/// A failure reported by a [`LineDevice`](crate::device::LineDevice).
#[derive(Debug)]
pub enum DeviceError {
    /// A hiccup on the link. It is surfaced to the operator but the session
    /// keeps running.
    Transient(io::Error),

    /// The link is gone (port vanished, permission revoked, ...). A fatal
    /// error forces the session to stop.
    Fatal(io::Error),
}

impl DeviceError {
    /// Sorts an [`io::Error`] from the serial link into transient or fatal.
    pub fn classify(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::InvalidData => Self::Transient(error),
            _ => Self::Fatal(error),
        }
    }

    /// Whether this error should end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(error) => write!(f, "transient device error: {}", error),
            Self::Fatal(error) => write!(f, "fatal device error: {}", error),
        }
    }
}

impl Error for DeviceError {}

/// A failure while writing or reading a log file.
#[derive(Debug)]
pub enum SinkError {
    /// The file system refused an operation.
    Io(io::Error),

    /// The CSV layer failed to encode or decode a row.
    Csv(csv::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io error: {}", error),
            Self::Csv(error) => write!(f, "csv error: {}", error),
        }
    }
}

impl Error for SinkError {}

impl From<io::Error> for SinkError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<csv::Error> for SinkError {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

/// An I/O failure during a session, split by severity.
#[derive(Debug)]
pub enum IoFailure {
    /// Surfaced, but does not end the session.
    Transient(String),

    /// Forces `stop(Fatal)`.
    Fatal(String),
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(detail) => write!(f, "transient: {}", detail),
            Self::Fatal(detail) => write!(f, "fatal: {}", detail),
        }
    }
}

/// The errors the logger surfaces to its caller.
#[derive(Debug)]
pub enum LoggerError {
    /// Bad session-start parameters; nothing was opened or mutated.
    InvalidConfig(String),

    /// A serial or file-system operation failed.
    Io(IoFailure),

    /// A persisted log failed validation; nothing was adopted from it.
    CorruptPersistedState(String),

    /// The settings file could not be read or parsed.
    Settings(String),
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidConfig(detail) => Cow::from(format!("invalid config: {}", detail)),
            Self::Io(failure) => Cow::from(format!("io failure ({})", failure)),
            Self::CorruptPersistedState(detail) => {
                Cow::from(format!("corrupt persisted state: {}", detail))
            }
            Self::Settings(detail) => Cow::from(format!("settings error: {}", detail)),
        };

        write!(f, "{}", msg)
    }
}

impl Error for LoggerError {}

impl From<DeviceError> for LoggerError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::Transient(error) => Self::Io(IoFailure::Transient(error.to_string())),
            DeviceError::Fatal(error) => Self::Io(IoFailure::Fatal(error.to_string())),
        }
    }
}

impl From<SinkError> for LoggerError {
    fn from(value: SinkError) -> Self {
        Self::Io(IoFailure::Fatal(value.to_string()))
    }
}

impl From<io::Error> for LoggerError {
    fn from(value: io::Error) -> Self {
        Self::Io(IoFailure::Fatal(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_interrupts_are_not_fatal() {
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(!DeviceError::classify(interrupted).is_fatal());

        let framing = io::Error::new(io::ErrorKind::InvalidData, "framing error");
        assert!(!DeviceError::classify(framing).is_fatal());
    }

    #[test]
    fn vanished_port_is_fatal() {
        let gone = io::Error::new(io::ErrorKind::NotFound, "no such device");
        assert!(DeviceError::classify(gone).is_fatal());
    }

    #[test]
    fn device_errors_keep_their_severity() {
        let transient = DeviceError::Transient(io::Error::new(io::ErrorKind::Interrupted, "x"));
        assert!(matches!(
            LoggerError::from(transient),
            LoggerError::Io(IoFailure::Transient(_))
        ));

        let fatal = DeviceError::Fatal(io::Error::new(io::ErrorKind::BrokenPipe, "x"));
        assert!(matches!(
            LoggerError::from(fatal),
            LoggerError::Io(IoFailure::Fatal(_))
        ));
    }
}
