//! Consumer-side connection lifecycle.

use serde::Serialize;

/// Where a consumer's link to its session stream stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle. Re-enterable: a consumer may subscribe again at any time.
    #[default]
    Disconnected,
    /// First attach for the current session in flight.
    Connecting,
    /// Attached and draining events.
    Connected,
    /// The link dropped; retrying with backoff.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name, as shown to users.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether a link is wanted (anything but `Disconnected`).
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Apply `signal`, or reject a pair the lifecycle does not allow.
    pub fn next(self, signal: ConnectionSignal) -> Result<Self, InvalidTransition> {
        use ConnectionSignal as S;
        use ConnectionState as C;

        let next = match (self, signal) {
            // A subscribe always starts a fresh attach, including a switch.
            (_, S::Subscribe) => C::Connecting,
            (_, S::Close) => C::Disconnected,
            (C::Connecting | C::Reconnecting, S::Established) => C::Connected,
            (C::Connecting | C::Connected | C::Reconnecting, S::Interrupted) => C::Reconnecting,
            (C::Connecting | C::Reconnecting, S::GaveUp) => C::Disconnected,
            (from, signal) => return Err(InvalidTransition { from, signal }),
        };
        Ok(next)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`ConnectionState::next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionSignal {
    /// Attach to a session (first connect or switch).
    Subscribe,
    /// The attach succeeded.
    Established,
    /// An attach failed or a live link dropped.
    Interrupted,
    /// Reconnect attempts are exhausted.
    GaveUp,
    /// The consumer detached.
    Close,
}

/// A signal that makes no sense in the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {signal:?} while {from}")]
pub struct InvalidTransition {
    /// State the signal arrived in.
    pub from: ConnectionState,
    /// Rejected signal.
    pub signal: ConnectionSignal,
}
