//! Error types for registrar

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Decode Errors ===
    #[error("Malformed instance key: {0}")]
    MalformedKey(String),

    #[error("Malformed instance payload at {key}: {reason}")]
    MalformedPayload { key: String, reason: String },

    #[error("Unknown store action: {0}")]
    UnknownAction(String),

    // === Slot Errors ===
    #[error("Slot occupied: {slot}")]
    SlotOccupied { slot: String },

    // === Store Errors ===
    #[error("Store transport failure: {0}")]
    Transport(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Watch index {index} has been cleared from store history")]
    IndexCleared { index: u64 },

    #[error("Store error {code}: {message}")]
    Store { code: u64, message: String },

    // === Feed Errors ===
    #[error("Feed terminated: {0}")]
    FeedTerminated(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }

    /// Errors that only affect a single store event; the feed keeps running.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedKey(_) | Error::MalformedPayload { .. } | Error::UnknownAction(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
