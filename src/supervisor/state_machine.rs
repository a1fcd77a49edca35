use thiserror::Error;

/// Lifecycle of the managed server.
///
/// `Starting → Ready → Running → Stopping → Stopped`, with `Failed` reachable
/// from `Starting` (never became ready) and `Running` (crashed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Failed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ServerState, ServerState),
}

#[derive(Debug)]
pub struct StateMachine {
    pub state: ServerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ServerState::Starting,
        }
    }
}

impl StateMachine {
    /// A freshly spawned process.
    pub fn new() -> Self {
        Self::default()
    }

    /// An instance that was already answering before we spawned anything.
    pub fn adopted() -> Self {
        Self {
            state: ServerState::Ready,
        }
    }

    pub fn can_transition(&self, to: &ServerState) -> bool {
        matches!(
            (&self.state, to),
            (ServerState::Starting, ServerState::Ready)
                | (ServerState::Starting, ServerState::Failed)
                | (ServerState::Ready, ServerState::Running)
                | (ServerState::Running, ServerState::Stopping)
                | (ServerState::Running, ServerState::Failed)
                | (ServerState::Stopping, ServerState::Stopped)
        )
    }

    pub fn transition(&mut self, to: ServerState) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::info!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state, ServerState::Starting);
        assert!(sm.transition(ServerState::Ready).is_ok());
        assert!(sm.transition(ServerState::Running).is_ok());
        assert!(sm.transition(ServerState::Stopping).is_ok());
        assert!(sm.transition(ServerState::Stopped).is_ok());
        assert!(sm.state.is_terminal());
    }

    #[test]
    fn failed_from_starting_and_running() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(ServerState::Failed).is_ok());

        let mut sm = StateMachine::adopted();
        sm.transition(ServerState::Running).unwrap();
        assert!(sm.transition(ServerState::Failed).is_ok());
    }

    #[test]
    fn invalid_transition() {
        let mut sm = StateMachine::new();
        // cannot go directly from Starting -> Running
        let res = sm.transition(ServerState::Running);
        assert_eq!(
            res,
            Err(TransitionError::InvalidTransition(ServerState::Starting, ServerState::Running))
        );
    }

    #[test]
    fn terminal_states_stay_put() {
        let mut sm = StateMachine::new();
        sm.transition(ServerState::Failed).unwrap();
        for to in [ServerState::Starting, ServerState::Ready, ServerState::Running, ServerState::Stopped] {
            assert!(sm.transition(to).is_err());
        }
    }

    #[test]
    fn adopted_starts_ready() {
        let sm = StateMachine::adopted();
        assert_eq!(sm.state, ServerState::Ready);
        assert!(!sm.state.is_terminal());
    }
}
