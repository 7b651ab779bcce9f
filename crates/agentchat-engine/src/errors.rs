use std::path::PathBuf;
use std::time::Duration;

/// Message fragments that mark a stream-open failure as permanent.
const NON_RETRYABLE_PHRASES: &[&str] = &[
    "authentication failed",
    "access forbidden",
    "unauthorized",
    "permission denied",
    "invalid api key",
    "rate limit exceeded",
    "quota exceeded",
    "payment required",
    "agent not found",
    "bad request",
    "invalid request",
];

/// Errors returned by an `AgentTransport` while establishing a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The agent endpoint answered with a non-success HTTP status.
    #[error("agent endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },
    /// The connection could not be established or broke before headers.
    #[error("connection failed: {message}")]
    Connect { message: String },
    /// The response could not be interpreted as an event stream.
    #[error("invalid stream response: {message}")]
    Protocol { message: String },
    /// The transport went away before handing out a stream.
    #[error("stream closed before it was established")]
    Closed,
}

impl TransportError {
    /// Creates a status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the HTTP status, when the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. }
            | Self::Connect { message }
            | Self::Protocol { message } => message,
            Self::Closed => "stream closed",
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Client-side statuses and messages naming auth, quota or lookup
    /// failures are permanent; everything else is worth retrying.
    pub fn is_retryable(&self) -> bool {
        if let Some(status) = self.status_code()
            && matches!(status, 400 | 401 | 402 | 403 | 404 | 429)
        {
            return false;
        }
        let lower = self.message().to_ascii_lowercase();
        !NON_RETRYABLE_PHRASES
            .iter()
            .any(|phrase| lower.contains(phrase))
    }
}

/// A stream line or event that could not be understood. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("malformed stream line: {0}")]
    Malformed(String),
}

/// Top-level error type for session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Invalid engine or transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// `send_message` was called before `start`.
    #[error("session has not been started")]
    NotStarted,
    /// The stream could not be established within the retry budget.
    #[error("failed to open stream after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Protocol anomaly surfaced outside the stream.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The agent reported a terminal error for the exchange.
    #[error("agent error: {0}")]
    Agent(String),
    /// The per-call deadline passed before any content arrived.
    #[error("no response from agent within {after:?}")]
    Timeout { after: Duration },
    /// The exchange was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
    /// A background task ended without reporting a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Cancellation is a normal unwind, not a failure to show the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from the local tool runner sidecar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolApiError {
    #[error("tool runner config error: {0}")]
    Config(String),
    #[error("tool runner request failed: {0}")]
    Transport(String),
    #[error("tool runner returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid tool runner response: {0}")]
    Protocol(String),
    #[error("tool execution failed: {0}")]
    Failed(String),
    #[error("tool execution cancelled")]
    Cancelled,
}

/// Errors from reading or writing the session history file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history io error at {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("history file {} is not valid JSON: {message}", .path.display())]
    Format { path: PathBuf, message: String },
    #[error("no home or config directory available for session history")]
    NoLocation,
}

impl HistoryError {
    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
