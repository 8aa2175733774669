// THEORY:
// Every fault the engine can meet belongs to one of a handful of classes, and the
// class alone decides how far the fault is allowed to travel:
//
// - `ConnectFailure` and `ReadFailure` are contained by the session supervisor,
//   which finalizes any open recording and retries after a backoff, forever.
// - `NoCodecAvailable` and `Write` only end the current recording episode.
// - `Classifier` only affects the frame it was raised for.
// - `Configuration` is the single fatal class, and it can only be raised at startup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentryError {
    #[error("connect failure: {0}")]
    ConnectFailure(String),

    #[error("read failure: {0}")]
    ReadFailure(String),

    #[error("no codec available (tried {tried})")]
    NoCodecAvailable { tried: String },

    #[error("write failure: {0}")]
    Write(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SentryError {
    /// Faults that end a stream session and send the supervisor into backoff.
    pub fn is_stream_fault(&self) -> bool {
        matches!(self, SentryError::ConnectFailure(_) | SentryError::ReadFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, SentryError>;
