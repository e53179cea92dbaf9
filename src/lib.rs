//! SonicPort: audio devices, format negotiation and real-time voice mixing.
//!
//! - [`format`]: sample representations, [`AudioFormat`] and channel layouts.
//! - [`device`]: device snapshots, capability probing and the [`AudioDevices`] cache.
//! - [`monitor`]: an asynchronous registry monitor that publishes resolved nodes.
//! - [`backend`]: platform backends selected at build time, plus [`MockBackend`].
//! - [`stream`]: [`AudioSink`] and [`AudioSource`] endpoints with format recovery.
//! - [`mixer`]: voices, engines and the [`SoundEffect`] player.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod format;
pub mod mixer;
pub mod monitor;
pub mod stream;

#[cfg(feature = "cpal")]
pub use backend::CpalBackend;
pub use backend::{AudioBackend, MockBackend, default_backend};
pub use config::{MixerDesc, MonitorDesc, SonicPortDesc, StreamDesc};
pub use device::{AudioDevice, AudioDevices, DeviceMode, FormatCapabilities};
pub use error::{Result, SonicPortError};
pub use events::{EventHub, SonicPortEvent};
pub use format::{AudioFormat, ChannelConfig, ChannelPosition, SampleFormat};
pub use mixer::{AudioSample, EnginePool, LoopCount, RtAudioEngine, SoundEffect, SoundEffectStatus, Voice, VoiceId};
pub use monitor::{DeviceMonitor, FormatRequester, RegistryEvent};
pub use stream::{
    AudioSink, AudioSource, ErrorState, FormatRecovery, RecoveringSink, RecoveringSource, StreamState,
};
