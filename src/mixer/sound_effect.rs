//! Low-latency playback of short samples on the shared engines.

use super::engine::RtAudioEngine;
use super::pool::EnginePool;
use super::sample::{AudioSample, SampleLoader, SampleResult, request_sample};
use super::voice::{LoopCount, Voice, VoiceId};
use crate::device::{AudioDevice, AudioDevices};
use crate::error::{Result, SonicPortError};
use crate::events::{EventHub, SonicPortEvent};
use crate::stream::StreamState;
use crossbeam_channel::{Receiver, TryRecvError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SoundEffectStatus {
    #[default]
    Null,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for SoundEffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "Null",
            Self::Loading => "Loading",
            Self::Ready => "Ready",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Plays one sample, possibly several times at once.
///
/// Each [`play`](Self::play) starts a new voice. Loop count, volume and mute
/// apply to the most recent voice. Call [`poll`](Self::poll) regularly from
/// the owning thread to pick up finished loads, device changes and voice
/// progress.
pub struct SoundEffect {
    pool: Arc<EnginePool>,
    devices: Arc<AudioDevices>,
    device_events: Receiver<SonicPortEvent>,
    audio_device: Option<AudioDevice>,
    resolved_device: Option<AudioDevice>,
    sample: Option<AudioSample>,
    loading: Option<Receiver<SampleResult>>,
    status: SoundEffectStatus,
    volume: f32,
    muted: bool,
    loop_count: LoopCount,
    loops_remaining: i32,
    play_pending: bool,
    engine: Option<Arc<RtAudioEngine>>,
    engine_events: Option<Receiver<SonicPortEvent>>,
    voices: BTreeMap<VoiceId, Arc<Voice>>,
    events: EventHub,
    pending: Vec<SonicPortEvent>,
}

impl SoundEffect {
    /// Creates an effect that follows the default output of `devices`.
    pub fn new(pool: Arc<EnginePool>, devices: Arc<AudioDevices>) -> Self {
        let device_events = devices.subscribe();
        let mut effect = Self {
            pool,
            devices,
            device_events,
            audio_device: None,
            resolved_device: None,
            sample: None,
            loading: None,
            status: SoundEffectStatus::Null,
            volume: 1.0,
            muted: false,
            loop_count: LoopCount::default(),
            loops_remaining: 0,
            play_pending: false,
            engine: None,
            engine_events: None,
            voices: BTreeMap::new(),
            events: EventHub::new(),
            pending: Vec::new(),
        };
        effect.resolve_audio_device();
        effect
    }

    /// The explicitly chosen device, `None` when following the default.
    pub fn audio_device(&self) -> Option<&AudioDevice> {
        self.audio_device.as_ref()
    }

    /// The device actually used for playback.
    pub fn resolved_audio_device(&self) -> Option<&AudioDevice> {
        self.resolved_device.as_ref()
    }

    /// Selects a device, or the default output for `None`. Returns false if
    /// nothing changed.
    pub fn set_audio_device(&mut self, device: Option<AudioDevice>) -> bool {
        if device == self.audio_device {
            return false;
        }
        self.audio_device = device;
        self.resolve_audio_device();
        true
    }

    fn resolve_audio_device(&mut self) {
        let resolved = match &self.audio_device {
            Some(device) => Some(device.clone()),
            None => self.devices.default_audio_output(),
        };
        self.set_resolved_device(resolved);
    }

    /// Moves playback to `device`, resuming every voice there once.
    fn set_resolved_device(&mut self, device: Option<AudioDevice>) {
        if device == self.resolved_device {
            return;
        }
        log::info!(
            "Sound effect output is now {}",
            device.as_ref().map_or("<none>", |d| d.id())
        );
        self.resolved_device = device;

        let was_playing = self.is_playing();
        if let Some(engine) = &self.engine {
            for id in self.voices.keys() {
                engine.stop(*id);
            }
        }
        let voices = std::mem::take(&mut self.voices);

        let Some(sample) = self.sample.clone() else {
            self.release_engine();
            let status = if self.loading.is_some() {
                SoundEffectStatus::Loading
            } else {
                SoundEffectStatus::Null
            };
            self.set_status(status);
            self.notify_playing(was_playing);
            return;
        };

        if !self.update_player(&sample) {
            self.set_status(SoundEffectStatus::Error);
            self.notify_playing(was_playing);
            return;
        }

        if let Some(format) = self.engine.as_ref().map(|engine| engine.format()) {
            for voice in voices.values() {
                match voice.clone_for(&format) {
                    Ok(clone) => self.start_voice(Arc::new(clone)),
                    Err(e) => log::warn!("Failed to move {} to the new device: {}", voice.id(), e),
                }
            }
        }
        self.set_status(SoundEffectStatus::Ready);
        self.notify_playing(was_playing);
    }

    pub fn sample(&self) -> Option<&AudioSample> {
        self.sample.as_ref()
    }

    /// Uses an already decoded sample.
    ///
    /// # Errors
    ///
    /// Fails for samples that are neither mono nor stereo and when no engine
    /// can be opened for the sample on the resolved device. The status is
    /// `Error` in both cases.
    pub fn set_source(&mut self, sample: AudioSample) -> Result<()> {
        let was_playing = self.is_playing();
        self.loading = None;
        self.stop_voices();
        self.sample = None;
        self.notify_playing(was_playing);
        self.install_sample(sample)
    }

    /// Starts loading `locator` through `loader`. The result is picked up
    /// by [`poll`](Self::poll).
    pub fn load_source(&mut self, loader: Arc<dyn SampleLoader>, locator: &str) {
        let was_playing = self.is_playing();
        self.loading = None;
        self.stop_voices();
        self.sample = None;
        self.release_engine();
        self.notify_playing(was_playing);

        if locator.is_empty() {
            self.set_status(SoundEffectStatus::Null);
            return;
        }
        self.set_status(SoundEffectStatus::Loading);
        self.loading = Some(request_sample(loader, locator));
    }

    fn install_sample(&mut self, sample: AudioSample) -> Result<()> {
        if !matches!(sample.channel_count(), 1 | 2) {
            log::warn!("Sound effects only support mono or stereo samples");
            self.set_status(SoundEffectStatus::Error);
            return Err(SonicPortError::AudioFormat(format!(
                "{}-channel samples cannot be played as a sound effect",
                sample.channel_count()
            )));
        }

        let has_player = self.update_player(&sample);
        self.sample = Some(sample);
        if !has_player {
            log::warn!("Playback of this sample is not supported on the selected device");
            self.set_status(SoundEffectStatus::Error);
            return Err(SonicPortError::DeviceUnavailable(
                "No engine for the sample on the selected device".into(),
            ));
        }

        self.set_status(SoundEffectStatus::Ready);
        if std::mem::take(&mut self.play_pending) {
            self.play();
        }
        Ok(())
    }

    /// Opens an engine for `sample`, retrying with mono and stereo swapped.
    fn update_player(&mut self, sample: &AudioSample) -> bool {
        self.release_engine();
        let Some(device) = self.resolved_device.clone() else {
            return false;
        };

        let format = sample.format();
        let engine = self.pool.get_engine_for(&device, &format).or_else(|e| {
            let toggled = if format.channel_count() == 1 { 2 } else { 1 };
            log::debug!(
                "Engine for {} failed ({}), retrying with {} channels",
                format,
                e,
                toggled
            );
            self.pool
                .get_engine_for(&device, &format.with_channel_count(toggled))
        });

        match engine {
            Ok(engine) => {
                self.engine_events = Some(engine.subscribe());
                self.engine = Some(engine);
                true
            }
            Err(e) => {
                log::warn!("No engine on {}: {}", device.id(), e);
                false
            }
        }
    }

    fn release_engine(&mut self) {
        self.engine_events = None;
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }

    /// Starts a new voice. Before the sample has loaded this only marks the
    /// effect to start once it is ready.
    pub fn play(&mut self) {
        let Some(sample) = self.sample.clone() else {
            self.play_pending = true;
            return;
        };
        if self.status != SoundEffectStatus::Ready {
            return;
        }
        let Some(format) = self.engine.as_ref().map(|engine| engine.format()) else {
            return;
        };

        let was_playing = self.is_playing();
        match Voice::new(sample, &format) {
            Ok(voice) => {
                let voice = voice
                    .with_volume(self.volume)
                    .with_muted(self.muted)
                    .with_loop_count(self.loop_count);
                self.start_voice(Arc::new(voice));
                self.set_loops_remaining(self.loop_count.to_raw());
            }
            Err(e) => log::warn!("Cannot create a voice: {}", e),
        }
        self.notify_playing(was_playing);
    }

    fn start_voice(&mut self, voice: Arc<Voice>) {
        let Some(engine) = &self.engine else {
            return;
        };
        match engine.play(voice.clone()) {
            Ok(id) => {
                self.voices.insert(id, voice);
            }
            Err(e) => log::warn!("Engine refused {}: {}", voice.id(), e),
        }
    }

    /// Stops every voice and cancels a pending play.
    pub fn stop(&mut self) {
        let was_playing = self.is_playing();
        self.stop_voices();
        self.play_pending = false;
        self.notify_playing(was_playing);
    }

    fn stop_voices(&mut self) {
        if let Some(engine) = &self.engine {
            for id in self.voices.keys() {
                engine.stop(*id);
            }
        }
        self.voices.clear();
        self.set_loops_remaining(0);
    }

    pub fn is_playing(&self) -> bool {
        !self.voices.is_empty()
    }

    /// Number of voices still playing.
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn status(&self) -> SoundEffectStatus {
        self.status
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) -> bool {
        let volume = volume.clamp(0.0, 1.0);
        if volume == self.volume {
            return false;
        }
        self.volume = volume;
        for voice in self.voices.values() {
            voice.set_volume(volume);
        }
        true
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) -> bool {
        if muted == self.muted {
            return false;
        }
        self.muted = muted;
        for voice in self.voices.values() {
            voice.set_muted(muted);
        }
        true
    }

    pub fn loop_count(&self) -> LoopCount {
        self.loop_count
    }

    /// Sets the loop count of future voices and of the latest one. Zero
    /// counts as one.
    pub fn set_loop_count(&mut self, loops: LoopCount) -> bool {
        let loops = loops.normalized();
        if loops == self.loop_count {
            return false;
        }
        self.loop_count = loops;
        if let Some(voice) = self.voices.values().next_back().cloned() {
            voice.set_loop_count(loops);
            self.set_loops_remaining(loops.to_raw());
        }
        true
    }

    /// Loops left on the latest voice, or [`LoopCount::INFINITE_RAW`].
    pub fn loops_remaining(&self) -> i32 {
        if self.voices.is_empty() {
            0
        } else {
            self.loops_remaining
        }
    }

    fn active_voice(&self) -> Option<VoiceId> {
        self.voices.keys().next_back().copied()
    }

    /// Processes loader results, device changes and engine events. Returns
    /// the events raised since the last call.
    pub fn poll(&mut self) -> Vec<SonicPortEvent> {
        self.poll_loader();
        self.poll_devices();
        self.poll_engine();
        std::mem::take(&mut self.pending)
    }

    fn poll_loader(&mut self) {
        let Some(loading) = &self.loading else {
            return;
        };
        let result = match loading.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err(SonicPortError::Unknown("Sample loader vanished".into())),
        };
        self.loading = None;

        match result {
            Ok(sample) => {
                if let Err(e) = self.install_sample(sample) {
                    log::warn!("Loaded sample is unusable: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Error decoding sound effect source: {}", e);
                self.set_status(SoundEffectStatus::Error);
            }
        }
    }

    fn poll_devices(&mut self) {
        let outputs_changed = self
            .device_events
            .try_iter()
            .filter(|event| {
                matches!(
                    event,
                    SonicPortEvent::AudioOutputsChanged | SonicPortEvent::DefaultOutputChanged
                )
            })
            .count()
            > 0;
        if outputs_changed && self.audio_device.is_none() {
            self.resolve_audio_device();
        }
    }

    fn poll_engine(&mut self) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        engine.poll_events();
        let events: Vec<_> = match &self.engine_events {
            Some(receiver) => receiver.try_iter().collect(),
            None => return,
        };

        for event in events {
            match event {
                SonicPortEvent::VoiceFinished { voice_id } | SonicPortEvent::VoiceStopped { voice_id } => {
                    if Some(voice_id) == self.active_voice() {
                        self.set_loops_remaining(0);
                    }
                    if self.voices.remove(&voice_id).is_some() && self.voices.is_empty() {
                        self.emit(SonicPortEvent::PlayingChanged { playing: false });
                    }
                }
                SonicPortEvent::VoiceLoopsChanged {
                    voice_id,
                    loops_remaining,
                } => {
                    if Some(voice_id) == self.active_voice() {
                        self.set_loops_remaining(loops_remaining);
                    }
                }
                SonicPortEvent::EngineError { error } => {
                    if engine.state() == StreamState::Stopped {
                        log::error!("Sound effect output failed: {}", error);
                        self.recover_from_engine_failure();
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    /// Reopens on the current device and resumes the voices there.
    fn recover_from_engine_failure(&mut self) {
        self.engine_events = None;
        self.engine = None;
        self.resolved_device = None;
        self.resolve_audio_device();
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.events.subscribe()
    }

    fn emit(&mut self, event: SonicPortEvent) {
        self.events.emit(event.clone());
        self.pending.push(event);
    }

    fn notify_playing(&mut self, was_playing: bool) {
        let playing = self.is_playing();
        if playing != was_playing {
            self.emit(SonicPortEvent::PlayingChanged { playing });
        }
    }

    fn set_status(&mut self, status: SoundEffectStatus) {
        if status != self.status {
            log::debug!("Sound effect status {} -> {}", self.status, status);
            self.status = status;
            self.emit(SonicPortEvent::StatusChanged { status });
        }
    }

    fn set_loops_remaining(&mut self, loops_remaining: i32) {
        if loops_remaining != self.loops_remaining {
            self.loops_remaining = loops_remaining;
            self.emit(SonicPortEvent::LoopsRemainingChanged { loops_remaining });
        }
    }
}

impl Drop for SoundEffect {
    fn drop(&mut self) {
        self.stop();
        self.release_engine();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::MixerDesc;
    use crate::device::DeviceMode;
    use crate::format::{AudioFormat, SampleFormat};
    use std::time::{Duration, Instant};

    struct Fixture {
        backend: Arc<MockBackend>,
        pool: Arc<EnginePool>,
        devices: Arc<AudioDevices>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new().with_outputs(vec![
            MockBackend::device("a", "Speakers", DeviceMode::Output, true),
            MockBackend::device("b", "Headphones", DeviceMode::Output, false),
        ]));
        let pool = Arc::new(
            EnginePool::new(backend.clone(), MixerDesc::default().engine_release_delay(Duration::ZERO)).unwrap(),
        );
        let devices = Arc::new(AudioDevices::new(backend.clone()));
        Fixture {
            backend,
            pool,
            devices,
        }
    }

    fn mono(frames: usize) -> AudioSample {
        AudioSample::new(AudioFormat::new(SampleFormat::Float, 48000, 1), vec![0.5; frames]).unwrap()
    }

    #[test]
    fn test_plays_on_default_output() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        assert_eq!(effect.resolved_audio_device().map(|d| d.id()), Some("a"));

        effect.set_source(mono(4)).unwrap();
        assert_eq!(effect.status(), SoundEffectStatus::Ready);
        effect.play();
        assert!(effect.is_playing());
        assert_eq!(effect.loops_remaining(), 1);

        let out = f.backend.render("a", 8).unwrap();
        assert_eq!(&out[..2], &[0.5, 0.5]);

        let events = effect.poll();
        assert!(events.contains(&SonicPortEvent::PlayingChanged { playing: false }));
        assert!(!effect.is_playing());
        assert_eq!(effect.loops_remaining(), 0);
    }

    #[test]
    fn test_play_before_load_is_deferred() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        let loader: Arc<dyn SampleLoader> = Arc::new(|_: &str| Ok(mono(48000)));

        effect.load_source(loader, "click.wav");
        assert_eq!(effect.status(), SoundEffectStatus::Loading);
        effect.play();
        assert!(!effect.is_playing());

        let deadline = Instant::now() + Duration::from_secs(2);
        while effect.status() == SoundEffectStatus::Loading && Instant::now() < deadline {
            effect.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(effect.status(), SoundEffectStatus::Ready);
        assert!(effect.is_playing());
    }

    #[test]
    fn test_failed_load_sets_error() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        let loader: Arc<dyn SampleLoader> = Arc::new(|_: &str| Err(SonicPortError::Unknown("corrupt".into())));
        effect.load_source(loader, "broken.wav");

        let deadline = Instant::now() + Duration::from_secs(2);
        while effect.status() == SoundEffectStatus::Loading && Instant::now() < deadline {
            effect.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(effect.status(), SoundEffectStatus::Error);
    }

    #[test]
    fn test_rejects_surround_samples() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        let surround = AudioSample::new(AudioFormat::new(SampleFormat::Float, 48000, 6), vec![0.0; 12]).unwrap();
        assert!(effect.set_source(surround).is_err());
        assert_eq!(effect.status(), SoundEffectStatus::Error);
    }

    #[test]
    fn test_channel_fallback_opens_stereo_engine() {
        let f = fixture();
        f.backend.reject_when(|_, format| format.channel_count() == 1);
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        effect.set_source(mono(100)).unwrap();
        effect.play();

        let out = f.backend.render("a", 2).unwrap();
        assert_eq!(out, vec![0.5; 4]);
    }

    #[test]
    fn test_default_change_moves_each_voice_once() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        effect.set_source(mono(48000)).unwrap();
        effect.set_loop_count(LoopCount::Infinite);
        effect.play();
        f.backend.render("a", 100).unwrap();

        f.backend.set_outputs(vec![
            MockBackend::device("a", "Speakers", DeviceMode::Output, false),
            MockBackend::device("b", "Headphones", DeviceMode::Output, true),
        ]);
        f.devices.on_outputs_changed();
        effect.poll();

        assert_eq!(effect.resolved_audio_device().map(|d| d.id()), Some("b"));
        assert_eq!(effect.voice_count(), 1);
        assert!(f.backend.render("a", 10).is_none());

        let engine = f.pool.get_engine_for(effect.resolved_audio_device().unwrap(), &mono(1).format()).unwrap();
        assert_eq!(engine.live_voices(), 1);
        let voice = effect.voices.values().next().unwrap().clone();
        assert_eq!(voice.current_frame(), 100);
        assert_eq!(f.backend.render("b", 10).unwrap(), vec![0.5; 10]);
    }

    #[test]
    fn test_explicit_device_ignores_default_changes() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        let headphones = f.devices.audio_outputs()[1].clone();
        assert!(effect.set_audio_device(Some(headphones)));
        effect.set_source(mono(10)).unwrap();

        f.devices.on_outputs_changed();
        effect.poll();
        assert_eq!(effect.resolved_audio_device().map(|d| d.id()), Some("b"));
    }

    #[test]
    fn test_runtime_failure_reopens_and_resumes() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        effect.set_source(mono(48000)).unwrap();
        effect.play();
        f.backend.render("a", 10).unwrap();

        f.backend.inject_error("a", crate::stream::ErrorState::IoError);
        effect.poll();
        assert!(effect.is_playing());
        assert_eq!(effect.status(), SoundEffectStatus::Ready);
        assert_eq!(f.backend.render("a", 4).unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn test_loop_count_zero_plays_once() {
        let f = fixture();
        let mut effect = SoundEffect::new(f.pool.clone(), f.devices.clone());
        assert!(!effect.set_loop_count(LoopCount::Finite(0)));
        assert_eq!(effect.loop_count(), LoopCount::Finite(1));
    }
}
