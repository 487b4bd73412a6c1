use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of the analysis-service connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Stopped,
    Starting,
    Ready,
    Failed,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ConnectionState, ConnectionState),
}

#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: ConnectionState::Stopped }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Starting` is only reachable from `Stopped`; every state may be
    /// stopped.
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self.state, to),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Ready, Stopped)
                | (Failed, Stopped)
        )
    }

    pub fn transition(&mut self, to: ConnectionState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("Connection state: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
