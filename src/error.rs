use speech_protocol::ProtocolError;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::audio::AudioError;
use crate::config::ConfigError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recognition is already running")]
    AlreadyRunning,

    #[error("Session task has shut down")]
    SessionClosed,
}

/// Why a recognition was canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum CancellationReason {
    /// A failure ended the recognition
    Error,
    /// The audio stream ended normally
    EndOfStream,
}

/// Error classification delivered with a cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum CancellationErrorCode {
    NoError,
    AuthenticationFailure,
    BadRequest,
    TooManyRequests,
    Forbidden,
    ConnectionFailure,
    ServiceTimeout,
    ServiceError,
    ServiceUnavailable,
    RuntimeError,
}

impl CancellationErrorCode {
    /// Classify a service-initiated close that will not be retried
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1007 => Self::BadRequest,
            1008 => Self::Forbidden,
            1011 => Self::ServiceError,
            1013 => Self::ServiceUnavailable,
            _ => Self::ConnectionFailure,
        }
    }
}

/// Details attached to a `Canceled` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationDetails {
    pub reason: CancellationReason,
    pub error_code: CancellationErrorCode,
    pub details: String,
}

impl CancellationDetails {
    pub fn error(error_code: CancellationErrorCode, details: impl Into<String>) -> Self {
        Self {
            reason: CancellationReason::Error,
            error_code,
            details: details.into(),
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            reason: CancellationReason::EndOfStream,
            error_code: CancellationErrorCode::NoError,
            details: String::new(),
        }
    }
}
