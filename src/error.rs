use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::watch;

use crate::types::StatusCode;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A service call completed with a bad status code.
    #[error("service call failed: {0}")]
    Service(StatusCode),

    #[error("session is not connected")]
    NotConnected,

    #[error("invalid state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A connectivity trigger fired in a state that does not accept it.
    #[error("invalid transition: {trigger} while {state}")]
    InvalidTransition { state: String, trigger: String },

    /// Another connect, reconnect or reactivate attempt is already running.
    #[error("a connectivity transition is already in flight")]
    TransitionInFlight,

    #[error("subscription has not been created on the server")]
    NotCreated,

    #[error("the server returned {actual} results, expected {expected}")]
    ResultCountMismatch { expected: usize, actual: usize },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("session state channel closed: {0}")]
    StateChannel(#[from] watch::error::RecvError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn service(code: StatusCode) -> Self {
        Error::Service(code)
    }

    /// Status code carried by the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Service(code) => Some(*code),
            Error::Timeout => Some(StatusCode::BAD_TIMEOUT),
            _ => None,
        }
    }
}

impl From<StatusCode> for Error {
    fn from(code: StatusCode) -> Self {
        Error::Service(code)
    }
}
