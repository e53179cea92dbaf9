//! Event types for SonicPort

use crate::device::DeviceMode;
use crate::mixer::{SoundEffectStatus, VoiceId};
use crate::stream::{ErrorState, StreamState};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum SonicPortEvent {
    AudioInputsChanged,
    AudioOutputsChanged,
    DefaultInputChanged,
    DefaultOutputChanged,
    VoiceStarted {
        voice_id: VoiceId,
    },
    VoiceFinished {
        voice_id: VoiceId,
    },
    VoiceStopped {
        voice_id: VoiceId,
    },
    VoiceLoopsChanged {
        voice_id: VoiceId,
        loops_remaining: i32,
    },
    PlayingChanged {
        playing: bool,
    },
    StatusChanged {
        status: SoundEffectStatus,
    },
    LoopsRemainingChanged {
        loops_remaining: i32,
    },
    StreamStateChanged {
        state: StreamState,
        error: ErrorState,
    },
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
}

impl SonicPortEvent {
    pub fn voice_id(&self) -> Option<VoiceId> {
        match self {
            Self::VoiceStarted { voice_id }
            | Self::VoiceFinished { voice_id }
            | Self::VoiceStopped { voice_id }
            | Self::VoiceLoopsChanged { voice_id, .. } => Some(*voice_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Self::EngineError { .. } => true,
            Self::StreamStateChanged { error, .. } => *error != ErrorState::NoError,
            Self::StatusChanged { status } => *status == SoundEffectStatus::Error,
            _ => false,
        }
    }

    /// The device-list change event for a direction.
    pub fn devices_changed(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::Input => Self::AudioInputsChanged,
            DeviceMode::Output => Self::AudioOutputsChanged,
        }
    }

    pub fn default_changed(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::Input => Self::DefaultInputChanged,
            DeviceMode::Output => Self::DefaultOutputChanged,
        }
    }
}

/// Fans events out to every live subscriber.
///
/// Receivers that have been dropped are pruned on the next emit.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<SonicPortEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn emit(&self, event: SonicPortEvent) {
        self.subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fans_out() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.emit(SonicPortEvent::AudioOutputsChanged);

        assert_eq!(a.try_recv().ok(), Some(SonicPortEvent::AudioOutputsChanged));
        assert_eq!(b.try_recv().ok(), Some(SonicPortEvent::AudioOutputsChanged));
    }

    #[test]
    fn test_hub_prunes_dropped_receivers() {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());

        hub.emit(SonicPortEvent::EngineStarted);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_event_classification() {
        let voice_id = VoiceId::from_raw(7);
        let finished = SonicPortEvent::VoiceFinished { voice_id };
        assert_eq!(finished.voice_id(), Some(voice_id));
        assert!(!finished.is_error());

        let failed = SonicPortEvent::StreamStateChanged {
            state: StreamState::Stopped,
            error: ErrorState::FatalError,
        };
        assert!(failed.is_error());
    }
}
