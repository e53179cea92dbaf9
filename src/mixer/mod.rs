//! Voice mixing.
//!
//! A [`Voice`] plays one [`AudioSample`]. Voices are mixed additively by a
//! [`RtAudioEngine`] on the device's real-time thread. Engines are shared per
//! device and format through the [`EnginePool`]. [`SoundEffect`] is the
//! client-facing player on top.

pub mod engine;
pub mod pool;
pub mod sample;
pub mod sound_effect;
pub mod voice;

pub use engine::{MixerCore, MixerHandle, RtAudioEngine, mixer_channel};
pub use pool::EnginePool;
pub use sample::{AudioSample, SampleLoader, SampleResult, request_sample};
pub use sound_effect::{SoundEffect, SoundEffectStatus};
pub use voice::{LoopCount, Voice, VoiceId, VoicePlayResult};
