use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Unreadable input: {0}")]
    UnreadableInput(String),

    #[error("Write error after {frames_written} frames: {reason}")]
    WriteError { frames_written: u64, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} is already processing")]
    AlreadyProcessing(Uuid),

    #[error("Detection failed on frame {frame}: {reason}")]
    DetectionAdapterError { frame: u64, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Cancelled after {frames_processed} frames")]
    Cancelled { frames_processed: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Category of a failure, recorded on job records.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableInput,
    WriteError,
    JobNotFound,
    AlreadyProcessing,
    DetectionAdapterError,
    InvalidInput,
    InvalidFrame,
    Cancelled,
    ConfigError,
    IoError,
    SerializationError,
}

impl CounterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CounterError::UnreadableInput(_) => ErrorKind::UnreadableInput,
            CounterError::WriteError { .. } => ErrorKind::WriteError,
            CounterError::JobNotFound(_) => ErrorKind::JobNotFound,
            CounterError::AlreadyProcessing(_) => ErrorKind::AlreadyProcessing,
            CounterError::DetectionAdapterError { .. } => ErrorKind::DetectionAdapterError,
            CounterError::InvalidInput(_) => ErrorKind::InvalidInput,
            CounterError::InvalidFrame(_) => ErrorKind::InvalidFrame,
            CounterError::Cancelled { .. } => ErrorKind::Cancelled,
            CounterError::ConfigError(_) => ErrorKind::ConfigError,
            CounterError::IoError(_) => ErrorKind::IoError,
            CounterError::SerializationError(_) => ErrorKind::SerializationError,
        }
    }

    pub(crate) fn write(frames_written: u64, reason: impl std::fmt::Display) -> Self {
        CounterError::WriteError {
            frames_written,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for CounterError {
    fn from(error: serde_json::Error) -> Self {
        CounterError::SerializationError(error.to_string())
    }
}

impl From<config::ConfigError> for CounterError {
    fn from(error: config::ConfigError) -> Self {
        CounterError::ConfigError(error.to_string())
    }
}

impl From<validator::ValidationErrors> for CounterError {
    fn from(error: validator::ValidationErrors) -> Self {
        CounterError::ConfigError(error.to_string())
    }
}

impl From<image::ImageError> for CounterError {
    fn from(error: image::ImageError) -> Self {
        CounterError::InvalidFrame(error.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for CounterError {
    fn from(error: ort::Error) -> Self {
        CounterError::ConfigError(format!("ONNX runtime: {}", error))
    }
}

pub type Result<T> = std::result::Result<T, CounterError>;
