//! Error types for the MySQL client.

use thiserror::Error;

/// Broad classification of a [`MySqlError`], matching the call-site taxonomy
/// binding layers report to their callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed caller input, detected before any I/O.
    Argument,
    /// The session handle could not be allocated.
    Init,
    /// Handshake, authentication or network failure while connecting.
    Connect,
    /// The server or the wire layer reported a failure.
    Protocol,
    /// Operation on a closed connection.
    InvalidHandle,
    /// `execute` was called with an empty statement.
    EmptyStatement,
}

/// The main error type for client operations.
#[derive(Debug, Error)]
pub enum MySqlError {
    /// Caller input has the wrong shape.
    #[error("{0}")]
    Argument(String),

    /// Session allocation failed (runtime or socket setup).
    #[error("{0}")]
    Init(String),

    /// Connecting failed. The message comes from the server or the I/O layer.
    #[error("{message}")]
    Connect { message: String },

    /// ERR packet sent by the server.
    #[error("{message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// Malformed or unexpected packet.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The connection was already closed.
    #[error("invalid handle: connection is closed")]
    InvalidHandle,

    /// Empty SQL text.
    #[error("invalid SQL statement.")]
    EmptyStatement,
}

impl MySqlError {
    /// Create an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Create a server error.
    pub fn server(code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }

    /// Wrap any failure that happened during connect into a `Connect` error,
    /// keeping the underlying message.
    pub(crate) fn into_connect(self) -> Self {
        match self {
            Self::Connect { .. } | Self::Init(_) | Self::Argument(_) => self,
            other => Self::Connect {
                message: other.message(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Argument(_) => ErrorKind::Argument,
            Self::Init(_) => ErrorKind::Init,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Server { .. } | Self::Protocol(_) | Self::Io(_) => ErrorKind::Protocol,
            Self::InvalidHandle => ErrorKind::InvalidHandle,
            Self::EmptyStatement => ErrorKind::EmptyStatement,
        }
    }

    /// The text a binding layer hands to its caller.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Server error code, if the server sent one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for client operations.
pub type MySqlResult<T> = Result<T, MySqlError>;

/// Converts a result into the `(value, error)` pair used by host bindings.
///
/// Exactly one side of the pair is populated.
pub trait TwoChannel<T> {
    fn into_pair(self) -> (Option<T>, Option<MySqlError>);
}

impl<T> TwoChannel<T> for MySqlResult<T> {
    fn into_pair(self) -> (Option<T>, Option<MySqlError>) {
        match self {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        }
    }
}
