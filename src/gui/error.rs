use crate::error::LoggerError;

use std::{error::Error, fmt::Display};

#[derive(Debug)]
pub enum GuiError {
    IOError(std::io::Error),
    Logger(LoggerError),
}

impl Display for GuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IOError(e) => write!(f, "terminal error: {}", e),
            Self::Logger(e) => write!(f, "{}", e),
        }
    }
}

impl Error for GuiError {}

impl From<std::io::Error> for GuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<LoggerError> for GuiError {
    fn from(value: LoggerError) -> Self {
        Self::Logger(value)
    }
}
