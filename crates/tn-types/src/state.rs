use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state shared by experiments and trials.
///
/// Trials use the same shape for their desired state: the experiment patches
/// its children with whatever state it moves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Active,
    Paused,
    StoppingCanceled,
    StoppingKilled,
    StoppingError,
    StoppingCompleted,
    Canceled,
    Killed,
    Errored,
    Completed,
}

impl State {
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            State::StoppingCanceled
                | State::StoppingKilled
                | State::StoppingError
                | State::StoppingCompleted
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Canceled | State::Killed | State::Errored | State::Completed
        )
    }

    /// The terminal state a stopping state resolves to.
    pub fn terminal(&self) -> Option<State> {
        match self {
            State::StoppingCanceled => Some(State::Canceled),
            State::StoppingKilled => Some(State::Killed),
            State::StoppingError => Some(State::Errored),
            State::StoppingCompleted => Some(State::Completed),
            _ => None,
        }
    }

    /// Whether a requested transition out of `self` is allowed.
    pub fn can_transition_to(&self, next: State) -> bool {
        match (self, next) {
            (State::Active, State::Paused) | (State::Paused, State::Active) => true,
            (current, next) if current == &next => false,
            (State::Active | State::Paused, next) => next.is_stopping(),
            (current, next) if current.is_stopping() => current.terminal() == Some(next),
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Active => "ACTIVE",
            State::Paused => "PAUSED",
            State::StoppingCanceled => "STOPPING_CANCELED",
            State::StoppingKilled => "STOPPING_KILLED",
            State::StoppingError => "STOPPING_ERROR",
            State::StoppingCompleted => "STOPPING_COMPLETED",
            State::Canceled => "CANCELED",
            State::Killed => "KILLED",
            State::Errored => "ERRORED",
            State::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// A state together with the operator-facing reason it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWithReason {
    pub state: State,
    pub reason: String,
}

impl StateWithReason {
    pub fn new(state: State, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_paused_toggle() {
        assert!(State::Active.can_transition_to(State::Paused));
        assert!(State::Paused.can_transition_to(State::Active));
        assert!(!State::Active.can_transition_to(State::Active));
    }

    #[test]
    fn stopping_only_resolves_to_matching_terminal() {
        assert!(State::StoppingKilled.can_transition_to(State::Killed));
        assert!(!State::StoppingKilled.can_transition_to(State::Canceled));
        assert!(!State::StoppingKilled.can_transition_to(State::Active));
        assert!(!State::Completed.can_transition_to(State::Active));
    }

    #[test]
    fn running_states_cannot_jump_to_terminal() {
        assert!(!State::Active.can_transition_to(State::Completed));
        assert!(State::Paused.can_transition_to(State::StoppingCanceled));
    }

    #[test]
    fn terminal_mapping() {
        assert_eq!(State::StoppingError.terminal(), Some(State::Errored));
        assert_eq!(State::Active.terminal(), None);
        assert!(State::Errored.is_terminal());
        assert!(!State::Errored.is_stopping());
    }
}
