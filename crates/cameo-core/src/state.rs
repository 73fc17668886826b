//! Application states and state masks
//!
//! States are single bit flags so that the set of states an instance has
//! passed through can be kept as a plain bitmask ([`StateSet`]).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Lifecycle state of an application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum State {
    /// No state yet. Never recorded in a [`StateSet`].
    #[default]
    Unknown = 0,
    Starting = 1,
    Running = 2,
    Stopping = 4,
    Killing = 8,
    /// The process failed and its error handler is running.
    ProcessingFailure = 16,
    Failure = 32,
    Success = 64,
    Stopped = 128,
    Killed = 256,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Starting,
        State::Running,
        State::Stopping,
        State::Killing,
        State::ProcessingFailure,
        State::Failure,
        State::Success,
        State::Stopped,
        State::Killed,
    ];

    /// Raw flag value.
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(State::Unknown),
            _ => State::ALL.into_iter().find(|s| s.bits() == bits),
        }
    }

    /// Terminal states are absorbing: the instance is removed once one is reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Success | State::Stopped | State::Killed | State::Failure
        )
    }

    /// States in which the instance counts as alive.
    pub fn is_alive(self) -> bool {
        matches!(self, State::Starting | State::Running | State::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Killing => "KILLING",
            State::ProcessingFailure => "PROCESSING_FAILURE",
            State::Failure => "FAILURE",
            State::Success => "SUCCESS",
            State::Stopped => "STOPPED",
            State::Killed => "KILLED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<State> for u32 {
    fn from(state: State) -> Self {
        state.bits()
    }
}

impl TryFrom<u32> for State {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        State::from_bits(bits).ok_or_else(|| format!("invalid state value {bits}"))
    }
}

/// Bitmask of states, used both for accumulated past states and for wait masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSet(u32);

impl StateSet {
    pub const EMPTY: StateSet = StateSet(0);

    /// Every terminal state.
    pub const TERMINAL: StateSet = StateSet(
        State::Success as u32 | State::Stopped as u32 | State::Killed as u32 | State::Failure as u32,
    );

    pub fn from_bits(bits: u32) -> Self {
        StateSet(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Record a state. `Unknown` is ignored.
    pub fn insert(&mut self, state: State) {
        self.0 |= state.bits();
    }

    pub fn contains(self, state: State) -> bool {
        state != State::Unknown && self.0 & state.bits() != 0
    }

    pub fn intersects(self, other: StateSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = State> {
        State::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<State> for StateSet {
    fn from(state: State) -> Self {
        StateSet(state.bits())
    }
}

impl BitOr for State {
    type Output = StateSet;

    fn bitor(self, rhs: State) -> StateSet {
        StateSet(self.bits() | rhs.bits())
    }
}

impl BitOr<State> for StateSet {
    type Output = StateSet;

    fn bitor(self, rhs: State) -> StateSet {
        StateSet(self.0 | rhs.bits())
    }
}

impl BitOr for StateSet {
    type Output = StateSet;

    fn bitor(self, rhs: StateSet) -> StateSet {
        StateSet(self.0 | rhs.0)
    }
}

impl BitOrAssign<State> for StateSet {
    fn bitor_assign(&mut self, rhs: State) {
        self.insert(rhs);
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(State::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_flags_are_distinct_bits() {
        for state in State::ALL {
            assert_eq!(state.bits().count_ones(), 1, "{state}");
        }
        assert_eq!(State::Unknown.bits(), 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(State::Success.is_terminal());
        assert!(State::Stopped.is_terminal());
        assert!(State::Killed.is_terminal());
        assert!(State::Failure.is_terminal());
        assert!(!State::Stopping.is_terminal());
        assert!(!State::ProcessingFailure.is_terminal());
        for state in State::ALL {
            assert_eq!(state.is_terminal(), StateSet::TERMINAL.contains(state));
        }
    }

    #[test]
    fn test_past_states_accumulate_every_state_entered() {
        let sequence = [
            State::Starting,
            State::Running,
            State::Stopping,
            State::Stopped,
        ];
        let mut past = StateSet::EMPTY;
        let mut expected = 0u32;
        for state in sequence {
            past |= state;
            expected |= state.bits();
            assert_eq!(past.bits(), expected);
            assert!(past.contains(state));
        }
    }

    #[test]
    fn test_unknown_is_never_recorded() {
        let mut past = StateSet::EMPTY;
        past |= State::Unknown;
        assert!(past.is_empty());
        assert!(!past.contains(State::Unknown));
    }

    #[test]
    fn test_state_serializes_as_number() {
        let json = serde_json::to_string(&State::Running).unwrap();
        assert_eq!(json, "2");
        let state: State = serde_json::from_str("256").unwrap();
        assert_eq!(state, State::Killed);
        assert!(serde_json::from_str::<State>("3").is_err());
    }

    #[test]
    fn test_state_set_display() {
        let set = State::Starting | State::Running;
        assert_eq!(set.to_string(), "[STARTING, RUNNING]");
    }
}
