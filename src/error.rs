//! Error taxonomy for the frame-exchange core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Capture requested while the camera is not streaming
    #[error("capture device is not streaming")]
    DeviceNotStreaming,

    /// No blank output buffer will become available (e.g. host link gone)
    #[error("no output buffer available: {0}")]
    ResourceExhausted(String),

    /// get/send/done called out of sequence
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Previous output buffer not yet consumed by the transmission path
    #[error("output overflow: previous buffer not yet consumed")]
    Overflow,

    #[error("queue full")]
    QueueSaturated,

    #[error("queue empty")]
    QueueStarved,

    #[error("{0} not implemented by this module")]
    NotImplemented(&'static str),

    #[error("Unsupported command")]
    UnsupportedCommand,

    #[error("module {name} built against version {found_major}.{found_minor}, host is {host_major}.{host_minor}")]
    VersionMismatch {
        name: String,
        found_major: i32,
        found_minor: i32,
        host_major: i32,
        host_minor: i32,
    },

    #[error("module {0} not found")]
    ModuleNotFound(String),

    #[error("failed to load module artifact: {0}")]
    Load(String),

    #[error("invalid frame in slot {index}: {reason}")]
    InvalidFrame { index: usize, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Free-form failure raised by a processing unit
    #[error("{0}")]
    Module(String),
}

impl Error {
    /// Backpressure and starvation may clear up on retry; sequence misuse never does.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Overflow
                | Error::QueueSaturated
                | Error::QueueStarved
                | Error::ResourceExhausted(_)
        )
    }

    /// A device had no frame or buffer to hand out; the cycle did no work
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotStreaming | Error::QueueStarved | Error::ResourceExhausted(_)
        )
    }

    pub fn module(msg: impl Into<String>) -> Self {
        Error::Module(msg.into())
    }
}
