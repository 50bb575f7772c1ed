use serde::Serialize;
use thiserror::Error;

/// Category of a session failure, as seen by the escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required endpoint or credential parameters are missing.
    Configuration,
    /// The server answered with an `error` frame.
    Handshake,
    /// The transport closed (or never opened) before the handshake completed.
    Transport,
}

/// Failures a session controller reports to the presentation shell.
///
/// Undecodable inbound frames are deliberately absent: they are passed
/// through to the terminal and never reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("missing configuration: {0}")]
    Configuration(String),

    #[error("server error: {0}")]
    Handshake(String),

    #[error("connection failed: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Configuration(_) => ErrorKind::Configuration,
            SessionError::Handshake(_) => ErrorKind::Handshake,
            SessionError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Only configuration errors are fatal; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::Configuration(_))
    }
}
