//! Error types for pg-logical.
//!
//! All errors in this crate are represented by [`ReplicationError`]. The
//! variants fall into three groups:
//! - fatal: configuration or slot problems that need an operator
//!   ([`ReplicationError::is_fatal`])
//! - session-ending: stream I/O, malformed frames, server-side copy end;
//!   the client tears the session down and reconnects
//! - connection-time: protocol, auth and TLS failures while connecting,
//!   retried by the session manager's retry policy

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Fields of a PostgreSQL `ErrorResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Severity (`ERROR`, `FATAL`, ...), non-localized when the server sends `V`.
    pub severity: Option<String>,
    /// SQLSTATE code, e.g. `42710`.
    pub code: Option<String>,
    /// Primary human-readable message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Returns `true` if the SQLSTATE is `duplicate_object` or the message
    /// says the object already exists.
    pub fn is_already_exists(&self) -> bool {
        self.code.as_deref() == Some(SQLSTATE_DUPLICATE_OBJECT)
            || self.message.contains("already exist")
    }
}

/// SQLSTATE raised by `CREATE_REPLICATION_SLOT` when the slot exists.
pub const SQLSTATE_DUPLICATE_OBJECT: &str = "42710";

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sev) = &self.severity {
            write!(f, "{sev}: ")?;
        }
        f.write_str(&self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {code})")?;
        }
        Ok(())
    }
}

/// Error type for all pg-logical operations.
#[derive(Debug, Error, Clone)]
pub enum ReplicationError {
    /// I/O error on the connection.
    ///
    /// `std::io::Error` is not `Clone`, so only the message is kept.
    #[error("io error: {0}")]
    Io(String),

    /// Protocol error: unexpected message or malformed backend response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A recognized replication frame shorter than its fixed header.
    #[error("malformed {} frame: {len} bytes (need at least {required})", tag_name(.tag))]
    MalformedFrame {
        tag: Option<u8>,
        len: usize,
        required: usize,
    },

    /// The server returned an `ErrorResponse`.
    #[error("server error: {0}")]
    Server(ServerError),

    /// `CREATE_REPLICATION_SLOT` failed for a reason other than the slot
    /// already existing.
    #[error("could not create replication slot {slot}: {error}")]
    SlotCreation { slot: String, error: ServerError },

    /// The server ended the copy-both stream.
    #[error("replication stream closed by server")]
    StreamClosed,

    /// An operation exceeded its time budget.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    /// Authentication failed or the requested method is unsupported.
    #[error("authentication error: {0}")]
    Auth(String),

    /// TLS negotiation or certificate error.
    #[error("tls error: {0}")]
    Tls(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A capped retry policy ran out of attempts.
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<ReplicationError> },

    /// Background task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),
}

fn tag_name(tag: &Option<u8>) -> String {
    match tag {
        Some(t) => format!("'{}'", *t as char),
        None => "empty".to_string(),
    }
}

impl ReplicationError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, ReplicationError::Io(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, ReplicationError::Server(_))
    }

    /// Returns `true` for errors that stop the client instead of triggering
    /// a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::SlotCreation { .. }
                | ReplicationError::Config(_)
                | ReplicationError::RetryExhausted { .. }
        )
    }

    /// Returns `true` if this error is likely transient and retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Io(_)
                | ReplicationError::Timeout { .. }
                | ReplicationError::StreamClosed
                | ReplicationError::Task(_)
        )
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Io(err.to_string())
    }
}

/// Result type alias for pg-logical operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
