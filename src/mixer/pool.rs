//! Shared engines keyed by device and format.

use super::engine::RtAudioEngine;
use crate::backend::AudioBackend;
use crate::config::MixerDesc;
use crate::device::{AudioDevice, DeviceMode};
use crate::error::Result;
use crate::format::AudioFormat;
use crate::stream::StreamState;
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EngineKey {
    device_id: String,
    mode: DeviceMode,
    format: AudioFormat,
}

impl EngineKey {
    fn new(device: &AudioDevice, format: &AudioFormat) -> Self {
        Self {
            device_id: device.id().to_string(),
            mode: device.mode(),
            format: *format,
        }
    }
}

/// Hands out one engine per device and format.
///
/// The pool only holds weak references. Owners give their engine back with
/// [`release`](Self::release), which keeps it alive for
/// `engine_release_delay` so a quick re-request reuses the open device.
pub struct EnginePool {
    backend: Arc<dyn AudioBackend>,
    desc: MixerDesc,
    engines: Mutex<HashMap<EngineKey, Weak<RtAudioEngine>>>,
    reaper: Option<Sender<Arc<RtAudioEngine>>>,
    reaper_thread: Option<JoinHandle<()>>,
}

impl EnginePool {
    /// # Errors
    ///
    /// Returns an error if the reaper thread cannot be spawned.
    pub fn new(backend: Arc<dyn AudioBackend>, desc: MixerDesc) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Arc<RtAudioEngine>>();
        let delay = desc.engine_release_delay;

        let reaper_thread = thread::Builder::new()
            .name("sonicport-engine-reaper".into())
            .spawn(move || {
                let mut held: Vec<(Instant, Arc<RtAudioEngine>)> = Vec::new();
                loop {
                    let next = held.iter().map(|(deadline, _)| *deadline).min();
                    let received = match next {
                        Some(deadline) => receiver.recv_deadline(deadline),
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(engine) => held.push((Instant::now() + delay, engine)),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let now = Instant::now();
                    held.retain(|(deadline, engine)| {
                        let keep = *deadline > now;
                        if !keep {
                            log::debug!("Releasing engine on {}", engine.device().id());
                        }
                        keep
                    });
                }
                log::debug!("Engine reaper exiting with {} held engines", held.len());
            })?;

        Ok(Self {
            backend,
            desc,
            engines: Mutex::new(HashMap::new()),
            reaper: Some(sender),
            reaper_thread: Some(reaper_thread),
        })
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Returns the live engine for `device` and `format`, opening one if
    /// none exists or the existing one has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if a new engine cannot open the device.
    pub fn get_engine_for(&self, device: &AudioDevice, format: &AudioFormat) -> Result<Arc<RtAudioEngine>> {
        let key = EngineKey::new(device, format);
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(&key).and_then(Weak::upgrade) {
            if engine.state() != StreamState::Stopped {
                return Ok(engine);
            }
            log::debug!("Replacing failed engine on {}", device.id());
        }

        engines.retain(|_, weak| weak.strong_count() > 0);
        let engine = Arc::new(RtAudioEngine::new(
            self.backend.clone(),
            device.clone(),
            *format,
            &self.desc,
        )?);
        engines.insert(key, Arc::downgrade(&engine));
        Ok(engine)
    }

    /// Gives an engine back. It stays open for the release delay.
    pub fn release(&self, engine: Arc<RtAudioEngine>) {
        if self.desc.engine_release_delay.is_zero() {
            return;
        }
        if let Some(reaper) = &self.reaper {
            let _ = reaper.send(engine);
        }
    }

    pub fn release_delay(&self) -> Duration {
        self.desc.engine_release_delay
    }

    /// Number of engines that are still open.
    pub fn live_engines(&self) -> usize {
        self.engines
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.reaper.take();
        if let Some(thread) = self.reaper_thread.take() {
            let _ = thread.join();
        }
    }
}
