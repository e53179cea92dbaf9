//! Error types for SonicPort

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SonicPortError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Terminal status once every recovery path has been exhausted.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Device monitor error: {0}")]
    Monitor(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SonicPortError {
    /// Whether a caller can reasonably retry with a different device or format.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AudioDevice(_) | Self::AudioFormat(_) | Self::Stream(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SonicPortError>;
