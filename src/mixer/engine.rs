//! Real-time voice mixing.
//!
//! The mixer is split in two halves connected by bounded channels:
//! [`MixerCore`] lives on the render thread and owns the playing voices,
//! [`MixerHandle`] lives on the owning thread and sends commands. Voices
//! that end are handed back to the owning thread, so the render thread
//! never frees one.

use super::voice::{Voice, VoiceId, VoicePlayResult};
use crate::backend::AudioBackend;
use crate::config::{MixerDesc, StreamDesc};
use crate::device::AudioDevice;
use crate::error::{Result, SonicPortError};
use crate::events::{EventHub, SonicPortEvent};
use crate::format::AudioFormat;
use crate::format::convert::encode_samples;
use crate::stream::{AudioSink, ErrorState, StreamState};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

enum EngineCommand {
    Play(Arc<Voice>),
    Stop(VoiceId),
    StopAll,
}

enum Retired {
    Finished(Arc<Voice>),
    Stopped(Arc<Voice>),
    /// Dropped because the engine was at `max_voices`.
    Rejected(Arc<Voice>),
}

/// Creates a connected handle and render core for `format`.
pub fn mixer_channel(format: AudioFormat, desc: &MixerDesc) -> (MixerHandle, MixerCore) {
    let max_voices = desc.max_voices.max(1);
    let (commands, command_rx) = crossbeam_channel::bounded(desc.command_capacity.max(1));
    // Room for every voice the core can hold plus every queued play command.
    let retire_capacity = max_voices + desc.command_capacity.max(1);
    let (retired_tx, retired) = crossbeam_channel::bounded(retire_capacity);
    let lost = Arc::new(AtomicUsize::new(0));
    let channels = format.channel_count().max(1) as usize;

    (
        MixerHandle {
            format,
            commands,
            retired,
            voices: Mutex::new(HashMap::new()),
            events: EventHub::new(),
            lost: lost.clone(),
        },
        MixerCore {
            format,
            commands: command_rx,
            retired: retired_tx,
            backlog: VecDeque::with_capacity(retire_capacity),
            lost,
            voices: Vec::with_capacity(max_voices),
            max_voices,
            scratch: vec![0.0; desc.block_frames.max(1) * channels],
        },
    )
}

/// Render-thread half of a mixer.
pub struct MixerCore {
    format: AudioFormat,
    commands: Receiver<EngineCommand>,
    retired: Sender<Retired>,
    /// Retirements waiting for room in `retired` while the owner is not
    /// polling.
    backlog: VecDeque<Retired>,
    /// Retirements dropped with both the channel and the backlog full.
    lost: Arc<AtomicUsize>,
    voices: Vec<Arc<Voice>>,
    max_voices: usize,
    scratch: Vec<f32>,
}

impl MixerCore {
    /// Overwrites `output` with the mix of every playing voice.
    ///
    /// Real-time safe as long as the voice list stays within its
    /// preallocated capacity, which [`MixerHandle`] guarantees by retiring
    /// overflow.
    pub fn render(&mut self, output: &mut [f32]) {
        self.flush_backlog();
        self.drain_commands();
        output.fill(0.0);

        let mut index = 0;
        while index < self.voices.len() {
            if self.voices[index].play(output) == VoicePlayResult::Finished {
                let voice = self.voices.swap_remove(index);
                self.retire(Retired::Finished(voice));
            } else {
                index += 1;
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(item) = self.backlog.pop_front() {
            match self.retired.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.backlog.push_front(item);
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    /// Hands a voice back to the owner without blocking or allocating.
    fn retire(&mut self, item: Retired) {
        self.flush_backlog();
        let item = if self.backlog.is_empty() {
            match self.retired.try_send(item) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(item)) => item,
            }
        } else {
            item
        };

        if self.backlog.len() < self.backlog.capacity() {
            self.backlog.push_back(item);
        } else {
            // The owner still holds the voice, so nothing is freed here.
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Renders into raw bytes of the mixer's sample format. Returns the
    /// number of bytes written, always whole frames.
    pub fn render_bytes(&mut self, output: &mut [u8]) -> usize {
        let bytes_per_frame = self.format.bytes_per_frame();
        let channels = self.format.channel_count().max(1) as usize;
        if bytes_per_frame == 0 {
            return 0;
        }

        let frames = output.len() / bytes_per_frame;
        let block = self.scratch.len() / channels;
        let mut scratch = std::mem::take(&mut self.scratch);
        let mut written = 0;
        for start in (0..frames).step_by(block) {
            let count = block.min(frames - start);
            let samples = &mut scratch[..count * channels];
            self.render(samples);
            let bytes = &mut output[start * bytes_per_frame..(start + count) * bytes_per_frame];
            written += encode_samples(self.format.sample_format(), samples, bytes)
                * self.format.bytes_per_sample();
        }
        self.scratch = scratch;
        written
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::Play(voice) => {
                    if self.voices.len() < self.max_voices {
                        self.voices.push(voice);
                    } else {
                        self.retire(Retired::Rejected(voice));
                    }
                }
                EngineCommand::Stop(id) => {
                    if let Some(index) = self.voices.iter().position(|v| v.id() == id) {
                        let voice = self.voices.swap_remove(index);
                        self.retire(Retired::Stopped(voice));
                    }
                }
                EngineCommand::StopAll => {
                    while let Some(voice) = self.voices.pop() {
                        self.retire(Retired::Stopped(voice));
                    }
                }
            }
        }
    }
}

/// Owning-thread half of a mixer.
pub struct MixerHandle {
    format: AudioFormat,
    commands: Sender<EngineCommand>,
    retired: Receiver<Retired>,
    voices: Mutex<HashMap<VoiceId, Arc<Voice>>>,
    events: EventHub,
    lost: Arc<AtomicUsize>,
}

impl MixerHandle {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Queues `voice` for playback.
    ///
    /// # Errors
    ///
    /// Fails if the voice was built for another channel count or the command
    /// queue is full.
    pub fn play(&self, voice: Arc<Voice>) -> Result<VoiceId> {
        let id = voice.id();
        if voice.output_channels() != self.format.channel_count() {
            return Err(SonicPortError::Engine(format!(
                "{} mixes into {} channels, the engine has {}",
                id,
                voice.output_channels(),
                self.format.channel_count()
            )));
        }
        self.voices.lock().insert(id, voice.clone());
        match self.commands.try_send(EngineCommand::Play(voice)) {
            Ok(()) => {
                log::debug!("Queued {}", id);
                self.events.emit(SonicPortEvent::VoiceStarted { voice_id: id });
                Ok(id)
            }
            Err(e) => {
                self.voices.lock().remove(&id);
                Err(SonicPortError::Engine(match e {
                    TrySendError::Full(_) => "Mixer command queue is full".into(),
                    TrySendError::Disconnected(_) => "Mixer render thread is gone".into(),
                }))
            }
        }
    }

    /// Requests `id` to stop. Returns false if the voice is not live.
    pub fn stop(&self, id: VoiceId) -> bool {
        self.voices.lock().contains_key(&id) && self.commands.try_send(EngineCommand::Stop(id)).is_ok()
    }

    pub fn stop_all(&self) {
        if self.commands.try_send(EngineCommand::StopAll).is_err() {
            log::warn!("Failed to queue stop-all for the mixer");
        }
    }

    pub fn set_voice_volume(&self, id: VoiceId, volume: f32) -> bool {
        self.with_voice(id, |voice| voice.set_volume(volume))
    }

    pub fn set_voice_muted(&self, id: VoiceId, muted: bool) -> bool {
        self.with_voice(id, |voice| voice.set_muted(muted))
    }

    pub fn voice(&self, id: VoiceId) -> Option<Arc<Voice>> {
        self.voices.lock().get(&id).cloned()
    }

    pub fn live_voices(&self) -> usize {
        self.voices.lock().len()
    }

    fn with_voice(&self, id: VoiceId, apply: impl FnOnce(&Voice)) -> bool {
        match self.voices.lock().get(&id) {
            Some(voice) => {
                apply(voice);
                true
            }
            None => false,
        }
    }

    /// Collects voice events since the last call and publishes them.
    pub fn poll_events(&self) -> Vec<SonicPortEvent> {
        let mut events = Vec::new();
        {
            let voices = self.voices.lock();
            for voice in voices.values() {
                if voice.take_loop_changed() {
                    events.push(SonicPortEvent::VoiceLoopsChanged {
                        voice_id: voice.id(),
                        loops_remaining: voice.loops_remaining(),
                    });
                }
            }
        }

        for retired in self.retired.try_iter() {
            let (voice, event) = match retired {
                Retired::Finished(voice) => {
                    let voice_id = voice.id();
                    (voice, SonicPortEvent::VoiceFinished { voice_id })
                }
                Retired::Stopped(voice) => {
                    let voice_id = voice.id();
                    (voice, SonicPortEvent::VoiceStopped { voice_id })
                }
                Retired::Rejected(voice) => {
                    log::warn!("Mixer is full, dropping {}", voice.id());
                    events.push(SonicPortEvent::EngineError {
                        error: format!("Too many voices, {} dropped", voice.id()),
                    });
                    let voice_id = voice.id();
                    (voice, SonicPortEvent::VoiceStopped { voice_id })
                }
            };
            // Already swept after an earlier overflow.
            if self.voices.lock().remove(&voice.id()).is_some() {
                events.push(event);
            }
        }

        let lost = self.lost.swap(0, Ordering::Relaxed);
        if lost > 0 {
            log::warn!("Retire queue overflowed, {} voices were not handed back", lost);
            self.voices.lock().retain(|&voice_id, voice| {
                let done = !voice.is_active();
                if done {
                    events.push(SonicPortEvent::VoiceFinished { voice_id });
                }
                !done
            });
        }

        for event in &events {
            self.events.emit(event.clone());
        }
        events
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.events.subscribe()
    }
}

/// A mixer playing on one device with one format.
///
/// The mixer runs inside the sink's render callback.
pub struct RtAudioEngine {
    mixer: MixerHandle,
    device: AudioDevice,
    sink: Mutex<AudioSink>,
}

impl RtAudioEngine {
    /// Opens `device` with `format` and starts mixing.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be opened.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        device: AudioDevice,
        format: AudioFormat,
        desc: &MixerDesc,
    ) -> Result<Self> {
        let (mixer, mut core) = mixer_channel(format, desc);
        let mut sink = AudioSink::new(
            backend,
            device.clone(),
            format,
            StreamDesc::default().block_frames(desc.block_frames),
        );
        sink.start_callback(Box::new(move |buffer: &mut [f32]| core.render(buffer)))?;

        log::info!("Engine started on {} with {}", device.id(), format);
        mixer.events.emit(SonicPortEvent::EngineStarted);
        Ok(Self {
            mixer,
            device,
            sink: Mutex::new(sink),
        })
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    pub fn format(&self) -> AudioFormat {
        self.mixer.format()
    }

    pub fn play(&self, voice: Arc<Voice>) -> Result<VoiceId> {
        self.mixer.play(voice)
    }

    pub fn stop(&self, id: VoiceId) -> bool {
        self.mixer.stop(id)
    }

    pub fn stop_all(&self) {
        self.mixer.stop_all();
    }

    pub fn set_voice_volume(&self, id: VoiceId, volume: f32) -> bool {
        self.mixer.set_voice_volume(id, volume)
    }

    pub fn set_voice_muted(&self, id: VoiceId, muted: bool) -> bool {
        self.mixer.set_voice_muted(id, muted)
    }

    pub fn voice(&self, id: VoiceId) -> Option<Arc<Voice>> {
        self.mixer.voice(id)
    }

    pub fn live_voices(&self) -> usize {
        self.mixer.live_voices()
    }

    pub fn state(&self) -> StreamState {
        self.sink.lock().state()
    }

    /// Polls the output stream and the mixer.
    ///
    /// A terminal stream error is reported once as `EngineError`.
    pub fn poll_events(&self) -> Vec<SonicPortEvent> {
        let mut events = Vec::new();
        {
            let mut sink = self.sink.lock();
            let was_running = sink.state() != StreamState::Stopped;
            if sink.poll() == StreamState::Stopped && was_running && sink.error() != ErrorState::NoError {
                let event = SonicPortEvent::EngineError {
                    error: format!("Output on {} failed: {}", self.device.id(), sink.error()),
                };
                self.mixer.events.emit(event.clone());
                events.push(event);
            }
        }
        events.extend(self.mixer.poll_events());
        events
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.mixer.subscribe()
    }
}

impl Drop for RtAudioEngine {
    fn drop(&mut self) {
        self.sink.lock().stop();
        log::info!("Engine stopped on {}", self.device.id());
        self.mixer.events.emit(SonicPortEvent::EngineStopped);
    }
}
