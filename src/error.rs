//! Error types for voice sessions
//!
//! Only `SessionError` ever reaches the UI, and then only as its
//! `ErrorCategory`. Decode errors stay internal.

use thiserror::Error;

/// Short, user-visible error category shown under the orb
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    MicError,
    ConnectionError,
    MissingCredentials,
}

impl ErrorCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::MicError => "Mic Error",
            ErrorCategory::ConnectionError => "Connection Error",
            ErrorCategory::MissingCredentials => "Missing Credentials",
        }
    }
}

/// Errors that end (or prevent) a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no API key configured")]
    MissingCredentials,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::MissingCredentials => ErrorCategory::MissingCredentials,
            SessionError::Device(_) => ErrorCategory::MicError,
            SessionError::Transport(_) => ErrorCategory::ConnectionError,
        }
    }
}

/// A single inbound chunk could not be turned into playable samples
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("empty audio payload")]
    Empty,

    #[error("payload of {0} bytes is not whole 16-bit samples")]
    OddLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            SessionError::Device("denied".into()).category().label(),
            "Mic Error"
        );
        assert_eq!(
            SessionError::Transport("refused".into()).category().label(),
            "Connection Error"
        );
        assert_eq!(
            SessionError::MissingCredentials.category(),
            ErrorCategory::MissingCredentials
        );
    }
}
