//! Module providing the error type shared by every component of the client.

use std::fmt::Display;

/// Classification of failures. Transient kinds are recovered from locally (retry, reconnect,
/// metadata refresh); only exhaustion is surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection carrying a request was lost before a response arrived.
    ConnectionLost,
    /// Broker side transient condition, e.g. leader election in progress.
    Retriable,
    /// Retries exhausted; surfaced through the delivery future.
    DeliveryFailed,
    /// A consumer handler failed to process a record.
    ProcessingFailed,
    /// The broker contacted is no longer the leader for the partition.
    StaleMetadata,
    /// Invalid configuration; fatal at startup.
    ConfigInvalid,
    /// A request or a drain exceeded its timeout.
    TimedOut,
    /// Undecodable frame or unexpected response.
    Protocol,
    /// The component has been shut down.
    Stopped,
    /// A single record can never fit within the pending buffer bound.
    RecordTooLarge,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::Retriable => "retriable broker error",
            ErrorKind::DeliveryFailed => "delivery failed",
            ErrorKind::ProcessingFailed => "processing failed",
            ErrorKind::StaleMetadata => "stale metadata",
            ErrorKind::ConfigInvalid => "invalid configuration",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Stopped => "stopped",
            ErrorKind::RecordTooLarge => "record too large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns whether a request failing with this error may be resent as is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectionLost
                | ErrorKind::Retriable
                | ErrorKind::StaleMetadata
                | ErrorKind::TimedOut
        )
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionLost, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stopped, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    pub fn delivery_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeliveryFailed, message)
    }

    pub fn processing_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcessingFailed, message)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timed_out(err.to_string()),
            _ => Self::connection_lost(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
