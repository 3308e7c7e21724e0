//! Error taxonomy for the pipeline boundaries.
//!
//! Classified by who can act on them:
//!
//! - [`ConnectionError`]: the link to the agent runtime (or to a prlens
//!   server) could not be established or was lost. Retryable by the caller.
//! - [`ControlError`]: the send/abort control surface failed.
//!
//! Session-scoped runtime failures are not Rust errors: they travel as
//! [`crate::events::Event::StreamError`] to the owning session only.
//! Malformed directives in agent text are never errors at all.

/// Failure to establish or keep an event stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The remote could not be reached.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    /// The remote answered with a non-success HTTP status.
    #[error("upstream returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
    /// An established stream failed mid-flight.
    #[error("transport error: {0}")]
    Transport(String),
    /// Reconnection failed too many times in a row.
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },
    /// The stream or router was shut down.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Transport(_) => true,
            Self::Status { status } => *status == 429 || *status >= 500,
            Self::RetriesExhausted { .. } | Self::Closed => false,
        }
    }

    /// Short classification string for logging/metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Closed => "closed",
        }
    }
}

/// Failure of the send-message / abort control surface.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The runtime could not be reached.
    #[error("agent runtime unreachable: {0}")]
    Unreachable(String),
    /// The runtime failed while handling the request.
    #[error("agent runtime error {status}: {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// The request was rejected before it was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlError {
    /// Short classification string for logging/metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Server { .. } => "server",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}
