//! Stream states, error states and the inferred state machine.

use crate::events::{EventHub, SonicPortEvent};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Stopped,
    Active,
    Suspended,
    /// Running, but no data is flowing.
    Idle,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::Active => "Active",
            Self::Suspended => "Suspended",
            Self::Idle => "Idle",
        };
        f.write_str(name)
    }
}

/// Discriminants are ordered by severity.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorState {
    NoError = 0,
    UnderrunError = 1,
    OpenError = 2,
    IoError = 3,
    FatalError = 4,
}

impl ErrorState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::UnderrunError,
            2 => Self::OpenError,
            3 => Self::IoError,
            4 => Self::FatalError,
            _ => Self::NoError,
        }
    }

    /// Errors that end the stream and call for recovery.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OpenError | Self::IoError | Self::FatalError)
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NoError",
            Self::UnderrunError => "UnderrunError",
            Self::OpenError => "OpenError",
            Self::IoError => "IOError",
            Self::FatalError => "FatalError",
        };
        f.write_str(name)
    }
}

/// Error status written by real-time code and polled by the owner.
///
/// Raising never lowers the stored severity, so a fatal error is not masked
/// by an underrun reported later in the same period.
#[derive(Debug, Default)]
pub struct ErrorSlot(AtomicU8);

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, error: ErrorState) {
        self.0.fetch_max(error as u8, Ordering::AcqRel);
    }

    pub fn peek(&self) -> ErrorState {
        ErrorState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Returns the stored error and clears it.
    pub fn take(&self) -> ErrorState {
        ErrorState::from_raw(self.0.swap(ErrorState::NoError as u8, Ordering::AcqRel))
    }
}

/// State machine shared by sinks and sources.
///
/// `Idle` is never requested directly. It is inferred from an active stream
/// that has run out of data and reverts to `Active` once data flows again.
/// Every change is published as a `StreamStateChanged` event.
#[derive(Debug)]
pub struct StreamStateMachine {
    state: StreamState,
    error: ErrorState,
    events: EventHub,
}

impl Default for StreamStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStateMachine {
    pub fn new() -> Self {
        Self {
            state: StreamState::Stopped,
            error: ErrorState::NoError,
            events: EventHub::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn error(&self) -> ErrorState {
        self.error
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Moves to `requested` with `error`. Returns whether anything changed.
    ///
    /// A request for `Idle` is treated as `Active`.
    pub fn transition(&mut self, requested: StreamState, error: ErrorState) -> bool {
        let state = match requested {
            StreamState::Idle => StreamState::Active,
            other => other,
        };
        self.apply(state, error)
    }

    /// Infers Active/Idle from whether data is currently flowing.
    pub fn update_idle(&mut self, idle: bool, error: ErrorState) -> bool {
        match (self.state, idle) {
            (StreamState::Active, true) => self.apply(StreamState::Idle, error),
            (StreamState::Idle, false) => self.apply(StreamState::Active, ErrorState::NoError),
            _ => false,
        }
    }

    fn apply(&mut self, state: StreamState, error: ErrorState) -> bool {
        if self.state == state && self.error == error {
            return false;
        }
        log::debug!("Stream state {} -> {} ({})", self.state, state, error);
        self.state = state;
        self.error = error;
        self.events
            .emit(SonicPortEvent::StreamStateChanged { state, error });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_slot_keeps_most_severe() {
        let slot = ErrorSlot::new();
        slot.raise(ErrorState::FatalError);
        slot.raise(ErrorState::UnderrunError);
        assert_eq!(slot.peek(), ErrorState::FatalError);
        assert_eq!(slot.take(), ErrorState::FatalError);
        assert_eq!(slot.take(), ErrorState::NoError);
    }

    #[test]
    fn test_idle_cannot_be_requested() {
        let mut machine = StreamStateMachine::new();
        assert!(machine.transition(StreamState::Idle, ErrorState::NoError));
        assert_eq!(machine.state(), StreamState::Active);
    }

    #[test]
    fn test_idle_is_inferred_from_active() {
        let mut machine = StreamStateMachine::new();
        let events = machine.events().subscribe();

        assert!(!machine.update_idle(true, ErrorState::UnderrunError));
        machine.transition(StreamState::Active, ErrorState::NoError);
        assert!(machine.update_idle(true, ErrorState::UnderrunError));
        assert_eq!(machine.state(), StreamState::Idle);
        assert_eq!(machine.error(), ErrorState::UnderrunError);

        assert!(machine.update_idle(false, ErrorState::NoError));
        assert_eq!(machine.state(), StreamState::Active);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_suspended_stream_is_not_marked_idle() {
        let mut machine = StreamStateMachine::new();
        machine.transition(StreamState::Active, ErrorState::NoError);
        machine.transition(StreamState::Suspended, ErrorState::NoError);
        assert!(!machine.update_idle(true, ErrorState::UnderrunError));
        assert_eq!(machine.state(), StreamState::Suspended);
    }

    #[test]
    fn test_repeated_transition_is_silent() {
        let mut machine = StreamStateMachine::new();
        let events = machine.events().subscribe();
        machine.transition(StreamState::Stopped, ErrorState::NoError);
        assert!(events.is_empty());
    }
}
