//! Per-peer connection lifecycle.
//!
//! ```text
//! connecting ──► connected ──► disconnected
//!     │              │              │
//!     └──► failed ◄──┘              │
//!            │                      │
//!            ▼                      ▼
//!       reconnecting ◄──────────────┘ (manual reconnect)
//!            │
//!            ├──► connecting (new attempt)
//!            ├──► connected  (reconnect succeeded)
//!            └──► failed     (retries exhausted)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Reconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Disconnected, Reconnecting)
                | (Failed, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
        )
    }

    /// States in which the transport may still come up without user action
    pub fn is_establishing(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Tracks one peer's state and rejects transitions the lifecycle does not allow
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    transitions: u64,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            transitions: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: ConnectionState) -> Result<ConnectionState, ConnectionError> {
        if !self.state.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.transitions += 1;
        Ok(previous)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let mut machine = ConnectionStateMachine::new();
        assert_eq!(machine.state(), Connecting);
        assert_eq!(machine.transition(Connected).unwrap(), Connecting);
        assert_eq!(machine.transition(Disconnected).unwrap(), Connected);
        assert_eq!(machine.transitions(), 2);
    }

    #[test]
    fn test_retry_cycle() {
        let mut machine = ConnectionStateMachine::new();
        machine.transition(Failed).unwrap();
        machine.transition(Reconnecting).unwrap();
        machine.transition(Connecting).unwrap();
        machine.transition(Failed).unwrap();
        machine.transition(Reconnecting).unwrap();
        machine.transition(Connected).unwrap();
        assert_eq!(machine.state(), Connected);
    }

    #[test]
    fn test_rejects_invalid_transition() {
        let mut machine = ConnectionStateMachine::new();
        let err = machine.transition(Reconnecting).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InvalidTransition { from: Connecting, to: Reconnecting }
        ));
        assert_eq!(machine.state(), Connecting);
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
    }
}
