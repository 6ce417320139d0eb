//! Error type shared by validation, the engine and the processor.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Only MP4 and WebM files are supported, got {0:?}")]
    UnsupportedFormat(String),

    #[error("File size of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Conversion library failed to load: {0}")]
    EngineInit(String),

    #[error("Conversion failed: {0}")]
    EngineRun(String),

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("A conversion is already in progress")]
    Busy,

    #[error("No converted file is available")]
    NoOutput,
}

/// Stable, machine-readable classification of an [`Error`].
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedFormat,
    FileTooLarge,
    EngineInitFailure,
    EngineRunFailure,
    IoFailure,
    Busy,
    NoOutput,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            Error::EngineInit(_) => ErrorKind::EngineInitFailure,
            Error::EngineRun(_) => ErrorKind::EngineRunFailure,
            Error::Io { .. } => ErrorKind::IoFailure,
            Error::Busy => ErrorKind::Busy,
            Error::NoOutput => ErrorKind::NoOutput,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::UnsupportedFormat(_) => 400,
            Error::FileTooLarge { .. } => 413,
            Error::EngineInit(_) => 502,
            Error::EngineRun(_) => 502,
            Error::Io { .. } => 500,
            Error::Busy => 409,
            Error::NoOutput => 404,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
