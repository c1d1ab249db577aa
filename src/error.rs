//! Typed errors for the library surface. Binaries convert these into
//! `anyhow::Error` at their call sites and add context as needed.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status file has wrong size: expected {expected}, got {actual}")]
    WrongSize { expected: usize, actual: usize },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown control byte: {0}")]
    UnknownCommand(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum TaiError {
    #[error("invalid TAI64 textual label: {0:?}")]
    BadLabel(String),
    #[error("value out of range for a packed TAI64 label")]
    OutOfRange,
}
