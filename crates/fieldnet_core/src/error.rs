//! Error types for the network resource manager.

use fieldnet_storage::StorageError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for network resource operations.
pub type NetResult<T> = Result<T, NetError>;

/// Kind of a transient transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// The request or connection timed out.
    Timeout,
    /// The remote end refused the connection.
    ConnectionRefused,
    /// Any other I/O-level failure (reset, broken pipe, DNS hiccup).
    Io,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Io => write!(f, "i/o"),
        }
    }
}

/// Kind of a permanent request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermanentKind {
    /// The request was malformed or failed server-side validation.
    Validation,
    /// The caller is not authenticated or not allowed.
    Unauthorized,
    /// The requested resource does not exist.
    NotFound,
    /// The server refused the request for any other reason.
    Rejected,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not found"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Errors produced by the resource manager and its collaborators.
#[derive(Error, Debug)]
pub enum NetError {
    /// Transport-level failure that may succeed if retried.
    #[error("transient {kind} error: {message}")]
    Transient {
        /// What went wrong.
        kind: TransientKind,
        /// Error message.
        message: String,
    },

    /// Request-level failure that will never succeed if retried.
    #[error("permanent {kind} error: {message}")]
    Permanent {
        /// What went wrong.
        kind: PermanentKind,
        /// Error message.
        message: String,
    },

    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<NetError>,
    },

    /// The request queue cannot accept more work.
    #[error("request queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The durable task store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A task could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The task log holds bytes that are not a valid record.
    #[error("task log corrupted: {0}")]
    Corrupted(String),

    /// The manager has been shut down.
    #[error("network manager is shut down")]
    ShutDown,
}

impl NetError {
    /// Creates a transient error of the given kind.
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Creates a permanent error of the given kind.
    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, message)
    }

    /// Creates a permanent validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Validation, message)
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetError::Transient { .. })
    }

    /// Returns true if the failure can never be fixed by trying again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, NetError::Permanent { .. })
    }

    /// Maps this error to the classification surfaced to feature code.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            NetError::Transient { .. } | NetError::RetriesExhausted { .. } => {
                FailureKind::Unreachable
            }
            NetError::Permanent { kind, .. } => match kind {
                PermanentKind::Validation => FailureKind::Invalid,
                PermanentKind::Unauthorized => FailureKind::Unauthorized,
                PermanentKind::NotFound => FailureKind::NotFound,
                PermanentKind::Rejected => FailureKind::Rejected,
            },
            _ => FailureKind::Internal,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => TransientKind::Timeout,
            io::ErrorKind::ConnectionRefused => TransientKind::ConnectionRefused,
            _ => TransientKind::Io,
        };
        NetError::transient(kind, err.to_string())
    }
}

/// Why a request or sync task ultimately failed, in terms a user can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The server could not be reached after all retries.
    Unreachable,
    /// The request was invalid and must be corrected.
    Invalid,
    /// The user must sign in again or lacks permission.
    Unauthorized,
    /// The requested item no longer exists.
    NotFound,
    /// The server refused the request.
    Rejected,
    /// A local failure (storage, encoding) prevented completion.
    Internal,
}

impl FailureKind {
    /// Short description suitable for a user-facing message key.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Unreachable => "network unavailable, try again when the connection improves",
            Self::Invalid => "the request was invalid",
            Self::Unauthorized => "sign in again to continue",
            Self::NotFound => "the requested item no longer exists",
            Self::Rejected => "the server refused the request",
            Self::Internal => "the device could not complete the request",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}
