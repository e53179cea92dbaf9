//! Process-wide cache of enumerated devices.

use super::{AudioDevice, DeviceMode};
use crate::error::Result;
use crate::events::{EventHub, SonicPortEvent};
use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Anything that can list the devices of one direction.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self, mode: DeviceMode) -> Result<Vec<AudioDevice>>;
}

impl<T: DeviceEnumerator + ?Sized> DeviceEnumerator for Arc<T> {
    fn enumerate(&self, mode: DeviceMode) -> Result<Vec<AudioDevice>> {
        (**self).enumerate(mode)
    }
}

type DeviceList = Arc<[AudioDevice]>;

/// Lazily computed input and output device lists.
///
/// Reads return a shared snapshot. Change notifications from the platform
/// only drop the snapshot and the next read enumerates again. The eager
/// `update_*_cache` variants enumerate immediately and notify subscribers
/// only when the sequence of device identities actually changed.
pub struct AudioDevices {
    enumerator: Box<dyn DeviceEnumerator>,
    inputs: Mutex<Option<DeviceList>>,
    outputs: Mutex<Option<DeviceList>>,
    events: EventHub,
    forwarders: Mutex<Vec<Forwarder>>,
}

/// Thread relaying an upstream event stream into [`AudioDevices`].
struct Forwarder {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            // The forwarder may itself hold the last registry reference.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl AudioDevices {
    pub fn new<E: DeviceEnumerator + 'static>(enumerator: E) -> Self {
        Self {
            enumerator: Box::new(enumerator),
            inputs: Mutex::new(None),
            outputs: Mutex::new(None),
            events: EventHub::new(),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Applies every event from `upstream` through
    /// [`on_upstream_event`](Self::on_upstream_event) on a relay thread.
    ///
    /// The relay stops when the registry is dropped or `upstream`
    /// disconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay thread cannot be spawned.
    pub fn follow(self: &Arc<Self>, upstream: Receiver<SonicPortEvent>) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let registry: Weak<Self> = Arc::downgrade(self);

        let thread = thread::Builder::new()
            .name("sonicport-registry".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(upstream) -> event => {
                            let Ok(event) = event else { break };
                            let Some(registry) = registry.upgrade() else { break };
                            registry.on_upstream_event(&event);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                log::debug!("Registry relay exiting");
            })?;

        self.forwarders.lock().push(Forwarder {
            stop: Some(stop_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    fn slot(&self, mode: DeviceMode) -> &Mutex<Option<DeviceList>> {
        match mode {
            DeviceMode::Input => &self.inputs,
            DeviceMode::Output => &self.outputs,
        }
    }

    fn enumerate(&self, mode: DeviceMode) -> Option<DeviceList> {
        match self.enumerator.enumerate(mode) {
            Ok(devices) => Some(devices.into()),
            Err(e) => {
                log::warn!("Failed to enumerate {} devices: {}", mode, e);
                None
            }
        }
    }

    /// Cached list for `mode`, enumerated on first access.
    ///
    /// A failed enumeration yields an empty list and is retried on the next
    /// read.
    pub fn devices(&self, mode: DeviceMode) -> DeviceList {
        let mut slot = self.slot(mode).lock();
        if let Some(devices) = slot.as_ref() {
            return devices.clone();
        }
        match self.enumerate(mode) {
            Some(devices) => {
                *slot = Some(devices.clone());
                devices
            }
            None => Arc::from(Vec::new()),
        }
    }

    pub fn audio_inputs(&self) -> DeviceList {
        self.devices(DeviceMode::Input)
    }

    pub fn audio_outputs(&self) -> DeviceList {
        self.devices(DeviceMode::Output)
    }

    /// Drops the cached list and tells subscribers it is stale.
    pub fn on_devices_changed(&self, mode: DeviceMode) {
        self.slot(mode).lock().take();
        self.events.emit(SonicPortEvent::devices_changed(mode));
    }

    pub fn on_inputs_changed(&self) {
        self.on_devices_changed(DeviceMode::Input);
    }

    pub fn on_outputs_changed(&self) {
        self.on_devices_changed(DeviceMode::Output);
    }

    /// Re-enumerates now. Returns whether the list changed.
    pub fn update_cache(&self, mode: DeviceMode) -> bool {
        let Some(fresh) = self.enumerate(mode) else {
            return false;
        };

        let changed = {
            let mut slot = self.slot(mode).lock();
            let changed = slot.as_deref() != Some(&*fresh);
            *slot = Some(fresh);
            changed
        };

        if changed {
            log::info!("{} device list changed", mode);
            self.events.emit(SonicPortEvent::devices_changed(mode));
        }
        changed
    }

    pub fn update_input_cache(&self) -> bool {
        self.update_cache(DeviceMode::Input)
    }

    pub fn update_output_cache(&self) -> bool {
        self.update_cache(DeviceMode::Output)
    }

    /// The device flagged as default, else the first one listed.
    pub fn default_device(&self, mode: DeviceMode) -> Option<AudioDevice> {
        let devices = self.devices(mode);
        devices
            .iter()
            .find(|d| d.is_default())
            .or_else(|| devices.first())
            .cloned()
    }

    pub fn default_audio_input(&self) -> Option<AudioDevice> {
        self.default_device(DeviceMode::Input)
    }

    pub fn default_audio_output(&self) -> Option<AudioDevice> {
        self.default_device(DeviceMode::Output)
    }

    /// Invalidates the matching list when an upstream monitor republishes,
    /// then relays the event to subscribers.
    pub fn on_upstream_event(&self, event: &SonicPortEvent) {
        match event {
            SonicPortEvent::AudioInputsChanged => self.on_inputs_changed(),
            SonicPortEvent::AudioOutputsChanged => self.on_outputs_changed(),
            SonicPortEvent::DefaultInputChanged => self.on_default_changed(DeviceMode::Input),
            SonicPortEvent::DefaultOutputChanged => self.on_default_changed(DeviceMode::Output),
            _ => {}
        }
    }

    fn on_default_changed(&self, mode: DeviceMode) {
        self.slot(mode).lock().take();
        log::debug!("Default {} device changed upstream", mode);
        self.events.emit(SonicPortEvent::default_changed(mode));
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.events.subscribe()
    }
}
