//! Centralized error types for the broker's subsystems.
//!
//! Each subsystem gets a small `thiserror` enum; binaries fold everything
//! into `anyhow::Result` at the top.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("address {0} is not a physical display address (expected 0..=3)")]
    InvalidAddress(i32),
}

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("gpio chip {chip} unavailable: {source}")]
    ChipUnavailable {
        chip: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to request gpio line {line}: {source}")]
    LineRequest {
        line: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to set gpio line {line}: {source}")]
    SetValue {
        line: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("connection closed before a full length prefix was received")]
    ShortPrefix,
    #[error("length prefix {0:?} is not 4 ASCII decimal digits")]
    BadPrefix(String),
    #[error("connection closed before the full body ({expected} bytes) was received")]
    ShortBody { expected: usize },
    #[error("body is not valid UTF-8")]
    NotUtf8,
    #[error("body is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("encoded body ({0} bytes) exceeds the 4-digit length prefix's 9999 byte limit")]
    TooLarge(usize),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("address {0} is out of range (expected 0..=3 or -1 for broadcast)")]
    InvalidAddress(i32),
    #[error("sequence content must be non-empty and contain only text/time items")]
    InvalidSequence,
    #[error(transparent)]
    Serial(#[from] SerialError),
}
