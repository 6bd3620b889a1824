//! Connectivity state machine of a session.
//!
//! Kept as a pure transition table so legality is auditable in one place
//! and unit-testable without any I/O. The session applies entry actions
//! after a transition is accepted, outside any lock.

use std::fmt;

/// Connectivity states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No session exists; also the initial state.
    Closed,
    /// A create attempt is running.
    Connecting,
    /// The session is active and publishing.
    Connected,
    /// Keep-alives stopped; the session may still exist on the server.
    Disconnected,
    /// Re-establishing the channel and reactivating the session.
    Reconnecting,
    /// Applying a new identity to the active session.
    Reactivating,
    /// A connect, reconnect or reactivate attempt failed. Terminal until
    /// an explicit new create.
    Error,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        self == ConnectivityState::Connected
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Closed => "closed",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Reconnecting => "reconnecting",
            ConnectivityState::Reactivating => "reactivating",
            ConnectivityState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityTrigger {
    Create,
    ConnectComplete,
    ConnectFailed,
    /// Two keep-alive intervals elapsed without publish traffic.
    KeepAliveMissing,
    Reconnect,
    ReconnectComplete,
    ReconnectFailed,
    RenewIdentity,
    ReactivateComplete,
    ReactivateFailed,
    Close,
}

impl fmt::Display for ConnectivityTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityTrigger::Create => "create",
            ConnectivityTrigger::ConnectComplete => "connect complete",
            ConnectivityTrigger::ConnectFailed => "connect failed",
            ConnectivityTrigger::KeepAliveMissing => "keep-alive missing",
            ConnectivityTrigger::Reconnect => "reconnect",
            ConnectivityTrigger::ReconnectComplete => "reconnect complete",
            ConnectivityTrigger::ReconnectFailed => "reconnect failed",
            ConnectivityTrigger::RenewIdentity => "renew identity",
            ConnectivityTrigger::ReactivateComplete => "reactivate complete",
            ConnectivityTrigger::ReactivateFailed => "reactivate failed",
            ConnectivityTrigger::Close => "close",
        };
        f.write_str(name)
    }
}

/// The complete transition table. Returns the next state, or `None` when
/// the trigger is illegal in the given state.
pub fn transition(
    state: ConnectivityState,
    trigger: ConnectivityTrigger,
) -> Option<ConnectivityState> {
    use ConnectivityState::*;
    use ConnectivityTrigger::*;
    match (state, trigger) {
        (Closed, Create) | (Error, Create) => Some(Connecting),
        (Connecting, ConnectComplete) => Some(Connected),
        (Connecting, ConnectFailed) => Some(Error),
        (Connected, KeepAliveMissing) => Some(Disconnected),
        (Disconnected, Reconnect) => Some(Reconnecting),
        (Reconnecting, ReconnectComplete) => Some(Connected),
        (Reconnecting, ReconnectFailed) => Some(Error),
        (Connected, RenewIdentity) => Some(Reactivating),
        (Reactivating, ReactivateComplete) => Some(Connected),
        (Reactivating, ReactivateFailed) => Some(Error),
        (Connected, Close)
        | (Connecting, Close)
        | (Disconnected, Close)
        | (Reconnecting, Close)
        | (Reactivating, Close)
        | (Error, Close) => Some(Closed),
        _ => None,
    }
}
