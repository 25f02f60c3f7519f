//! Resumable account session initialization
//!
//! ```text
//! idle -> checking -> deploying -> approving -> obtaining-credential -> complete
//!            \_________________________/^
//! ```
//! Any failure returns to `idle` carrying the error.

mod manager;

use alloy::primitives::Address;
use std::sync::Arc;

use crate::account::{Credential, ExecutionClient};
use crate::error::{Error, ErrorKind};

pub use manager::{SessionManager, SessionSettings};

/// A failure that sent the session back to idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for SessionFailure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Ready trading session
#[derive(Debug)]
pub struct Session {
    pub execution_client: ExecutionClient,
    pub credential: Credential,
    pub account_address: Address,
}

/// Snapshot of the initialization state machine
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle { error: Option<SessionFailure> },
    Checking,
    Deploying,
    Approving,
    ObtainingCredential,
    Complete(Arc<Session>),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle { .. } => "idle",
            SessionState::Checking => "checking",
            SessionState::Deploying => "deploying",
            SessionState::Approving => "approving",
            SessionState::ObtainingCredential => "obtaining-credential",
            SessionState::Complete(_) => "complete",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, SessionState::Complete(_))
    }

    /// Initialization is running
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, SessionState::Idle { .. } | SessionState::Complete(_))
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        match self {
            SessionState::Complete(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SessionFailure> {
        match self {
            SessionState::Idle { error } => error.as_ref(),
            _ => None,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle { error: None }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.error() {
            Some(error) => write!(f, "idle ({})", error),
            None => write!(f, "{}", self.name()),
        }
    }
}
