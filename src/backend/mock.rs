//! Software backend that renders on demand instead of on a hardware clock.
//!
//! Tests drive opened sinks with [`MockBackend::render`] and feed sources
//! with [`MockBackend::capture`]. Failures are scripted with
//! [`MockBackend::reject_when`] and [`MockBackend::inject_error`].
//!
//! A device registered without capabilities behaves like hardware that
//! cannot describe itself: enumeration fills them in by trial opens, once
//! per device and mode.

use super::{AudioBackend, BackendStream, CaptureCallback, RenderCallback};
use crate::device::{
    AudioDevice, DeviceEnumerator, DeviceMode, FormatCapabilities, ProbeCache, StreamProber,
};
use crate::error::{Result, SonicPortError};
use crate::format::{AudioFormat, ChannelConfig, SampleFormat};
use crate::stream::{ErrorSlot, ErrorState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Rejector = Box<dyn Fn(&AudioDevice, &AudioFormat) -> bool + Send + Sync>;

#[derive(Default)]
struct StreamFlags {
    playing: AtomicBool,
    closed: AtomicBool,
}

impl StreamFlags {
    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn is_playing(&self) -> bool {
        self.is_live() && self.playing.load(Ordering::Acquire)
    }
}

struct SinkSlot {
    device_id: String,
    format: AudioFormat,
    render: RenderCallback,
    errors: Arc<ErrorSlot>,
    flags: Arc<StreamFlags>,
}

struct SourceSlot {
    device_id: String,
    capture: CaptureCallback,
    errors: Arc<ErrorSlot>,
    flags: Arc<StreamFlags>,
}

#[derive(Default)]
struct MockState {
    inputs: Vec<AudioDevice>,
    outputs: Vec<AudioDevice>,
    rejector: Option<Rejector>,
    sinks: Vec<SinkSlot>,
    sources: Vec<SourceSlot>,
}

impl MockState {
    fn prune(&mut self) {
        self.sinks.retain(|slot| slot.flags.is_live());
        self.sources.retain(|slot| slot.flags.is_live());
    }

    fn find_device(&self, id: &str, mode: DeviceMode) -> Option<&AudioDevice> {
        let list = match mode {
            DeviceMode::Input => &self.inputs,
            DeviceMode::Output => &self.outputs,
        };
        list.iter().find(|d| d.id() == id)
    }

    fn check_open(&self, device: &AudioDevice, format: &AudioFormat) -> Result<()> {
        if !format.is_valid() {
            return Err(SonicPortError::AudioFormat(format!("Invalid format {}", format)));
        }
        if self.find_device(device.id(), device.mode()).is_none() {
            return Err(SonicPortError::AudioDevice(format!(
                "Device {} is not connected",
                device.id()
            )));
        }
        if self.rejector.as_ref().is_some_and(|reject| reject(device, format)) {
            return Err(SonicPortError::AudioFormat(format!(
                "Device {} rejected {}",
                device.id(),
                format
            )));
        }
        Ok(())
    }
}

pub struct MockStream {
    format: AudioFormat,
    flags: Arc<StreamFlags>,
}

impl BackendStream for MockStream {
    fn play(&mut self) -> Result<()> {
        self.flags.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.flags.playing.store(false, Ordering::Release);
        Ok(())
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.flags.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    open_attempts: AtomicUsize,
    probe_calls: AtomicUsize,
    trials: ProbeCache,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that accepts every sample format, 1-8 channels and 8-192 kHz.
    pub fn device(id: &str, description: &str, mode: DeviceMode, is_default: bool) -> AudioDevice {
        AudioDevice::new(id, description, mode)
            .with_capabilities(FormatCapabilities {
                supported_formats: SampleFormat::ALL.to_vec(),
                min_channels: 1,
                max_channels: 8,
                min_sample_rate: 8000,
                max_sample_rate: 192000,
                channel_config: ChannelConfig::STEREO,
            })
            .with_default(is_default)
    }

    pub fn with_outputs(self, outputs: Vec<AudioDevice>) -> Self {
        self.set_outputs(outputs);
        self
    }

    pub fn with_inputs(self, inputs: Vec<AudioDevice>) -> Self {
        self.set_inputs(inputs);
        self
    }

    pub fn set_outputs(&self, outputs: Vec<AudioDevice>) {
        self.state.lock().outputs = outputs;
        self.trials.clear();
    }

    pub fn set_inputs(&self, inputs: Vec<AudioDevice>) {
        self.state.lock().inputs = inputs;
        self.trials.clear();
    }

    /// Makes every open and probe matching `reject` fail.
    pub fn reject_when<F>(&self, reject: F)
    where
        F: Fn(&AudioDevice, &AudioFormat) -> bool + Send + Sync + 'static,
    {
        self.state.lock().rejector = Some(Box::new(reject));
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rejector = None;
    }

    /// Runs one period of the first playing sink on `device_id`.
    pub fn render(&self, device_id: &str, frames: usize) -> Option<Vec<f32>> {
        let mut state = self.state.lock();
        state.prune();
        let slot = state
            .sinks
            .iter_mut()
            .find(|slot| slot.device_id == device_id && slot.flags.is_playing())?;
        let mut buffer = vec![0.0f32; frames * slot.format.channel_count() as usize];
        (slot.render)(&mut buffer);
        Some(buffer)
    }

    /// Runs one period of every playing sink. Returns how many ran.
    pub fn render_all(&self, frames: usize) -> usize {
        let mut state = self.state.lock();
        state.prune();
        let mut rendered = 0;
        for slot in state.sinks.iter_mut().filter(|s| s.flags.is_playing()) {
            let mut buffer = vec![0.0f32; frames * slot.format.channel_count() as usize];
            (slot.render)(&mut buffer);
            rendered += 1;
        }
        rendered
    }

    /// Delivers captured samples to every playing source on `device_id`.
    pub fn capture(&self, device_id: &str, samples: &[f32]) -> usize {
        let mut state = self.state.lock();
        state.prune();
        let mut delivered = 0;
        for slot in state
            .sources
            .iter_mut()
            .filter(|s| s.device_id == device_id && s.flags.is_playing())
        {
            (slot.capture)(samples);
            delivered += 1;
        }
        delivered
    }

    /// Raises `error` on every open stream of `device_id`.
    pub fn inject_error(&self, device_id: &str, error: ErrorState) -> usize {
        let mut state = self.state.lock();
        state.prune();
        let sinks = state.sinks.iter().filter(|s| s.device_id == device_id).map(|s| &s.errors);
        let sources = state.sources.iter().filter(|s| s.device_id == device_id).map(|s| &s.errors);
        let mut raised = 0;
        for errors in sinks.chain(sources) {
            errors.raise(error);
            raised += 1;
        }
        raised
    }

    pub fn open_sinks(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.sinks.len()
    }

    pub fn open_sources(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.sources.len()
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

impl DeviceEnumerator for MockBackend {
    fn enumerate(&self, mode: DeviceMode) -> Result<Vec<AudioDevice>> {
        let devices = {
            let state = self.state.lock();
            match mode {
                DeviceMode::Input => state.inputs.clone(),
                DeviceMode::Output => state.outputs.clone(),
            }
        };

        Ok(devices
            .into_iter()
            .map(|device| {
                if !device.capabilities().is_empty() {
                    return device;
                }
                let caps = self.trials.get_or_probe(self, device.id(), mode);
                device.with_capabilities(caps.as_ref().clone())
            })
            .collect())
    }
}

impl AudioBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open_sink(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        render: RenderCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.check_open(device, format)?;

        let flags = Arc::new(StreamFlags::default());
        state.sinks.push(SinkSlot {
            device_id: device.id().to_string(),
            format: *format,
            render,
            errors,
            flags: flags.clone(),
        });
        log::debug!("Mock sink opened on {} with {}", device.id(), format);
        Ok(Box::new(MockStream {
            format: *format,
            flags,
        }))
    }

    fn open_source(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        capture: CaptureCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.check_open(device, format)?;

        let flags = Arc::new(StreamFlags::default());
        state.sources.push(SourceSlot {
            device_id: device.id().to_string(),
            capture,
            errors,
            flags: flags.clone(),
        });
        log::debug!("Mock source opened on {} with {}", device.id(), format);
        Ok(Box::new(MockStream {
            format: *format,
            flags,
        }))
    }
}

impl StreamProber for MockBackend {
    fn try_open(&self, device_id: &str, mode: DeviceMode, format: &AudioFormat) -> bool {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let Some(device) = state.find_device(device_id, mode) else {
            return false;
        };
        let described = !device.capabilities().is_empty();
        (!described || device.is_format_supported(format)) && state.check_open(device, format).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MockBackend {
        MockBackend::new().with_outputs(vec![MockBackend::device(
            "out",
            "Speakers",
            DeviceMode::Output,
            true,
        )])
    }

    #[test]
    fn test_render_reaches_playing_sink_only() {
        let backend = backend();
        let device = backend.default_device(DeviceMode::Output).unwrap();
        let format = AudioFormat::new(SampleFormat::Float, 48000, 2);

        let mut stream = backend
            .open_sink(
                &device,
                &format,
                Box::new(|buffer: &mut [f32]| buffer.fill(0.25)),
                Arc::new(ErrorSlot::new()),
            )
            .unwrap();

        assert!(backend.render("out", 4).is_none());
        stream.play().unwrap();
        assert_eq!(backend.render("out", 4), Some(vec![0.25; 8]));

        drop(stream);
        assert_eq!(backend.open_sinks(), 0);
    }

    #[test]
    fn test_rejection_and_unknown_device() {
        let backend = backend();
        let device = backend.default_device(DeviceMode::Output).unwrap();
        backend.reject_when(|_, format| format.channel_count() == 1);

        let mono = AudioFormat::new(SampleFormat::Float, 48000, 1);
        let result = backend.open_sink(&device, &mono, Box::new(|_| {}), Arc::new(ErrorSlot::new()));
        assert!(result.is_err());
        assert!(!backend.try_open("out", DeviceMode::Output, &mono));

        let gone = MockBackend::device("gone", "Gone", DeviceMode::Output, false);
        let stereo = AudioFormat::new(SampleFormat::Float, 48000, 2);
        let result = backend.open_sink(&gone, &stereo, Box::new(|_| {}), Arc::new(ErrorSlot::new()));
        assert!(matches!(result, Err(SonicPortError::AudioDevice(_))));
        assert_eq!(backend.open_attempts(), 2);
    }

    #[test]
    fn test_undescribed_device_gets_capabilities_by_trial() {
        let backend = MockBackend::new().with_outputs(vec![
            AudioDevice::new("usb", "USB Interface", DeviceMode::Output).with_default(true),
        ]);
        backend.reject_when(|_, format| {
            format.sample_format() != SampleFormat::Int16
                || format.channel_count() > 2
                || format.sample_rate() > 48000
        });

        let devices = backend.enumerate(DeviceMode::Output).unwrap();
        let caps = devices[0].capabilities();
        assert_eq!(caps.supported_formats, vec![SampleFormat::Int16]);
        assert_eq!((caps.min_channels, caps.max_channels), (1, 2));
        assert_eq!((caps.min_sample_rate, caps.max_sample_rate), (8000, 48000));
        let preferred = devices[0].preferred_format();
        assert_eq!(preferred.sample_format(), SampleFormat::Int16);
        assert_eq!((preferred.sample_rate(), preferred.channel_count()), (48000, 2));

        let trials = backend.probe_calls();
        assert!(trials > 0);
        backend.enumerate(DeviceMode::Output).unwrap();
        assert_eq!(backend.probe_calls(), trials);

        // Replacing the device list starts over.
        backend.set_outputs(vec![AudioDevice::new("usb", "USB Interface", DeviceMode::Output)]);
        backend.enumerate(DeviceMode::Output).unwrap();
        assert_eq!(backend.probe_calls(), trials * 2);
    }

    #[test]
    fn test_described_device_skips_trials() {
        let backend = backend();
        backend.enumerate(DeviceMode::Output).unwrap();
        assert_eq!(backend.probe_calls(), 0);
    }

    #[test]
    fn test_inject_error_reaches_slot() {
        let backend = backend();
        let device = backend.default_device(DeviceMode::Output).unwrap();
        let errors = Arc::new(ErrorSlot::new());
        let _stream = backend
            .open_sink(
                &device,
                &AudioFormat::new(SampleFormat::Int16, 44100, 2),
                Box::new(|_| {}),
                errors.clone(),
            )
            .unwrap();

        assert_eq!(backend.inject_error("out", ErrorState::IoError), 1);
        assert_eq!(errors.take(), ErrorState::IoError);
    }
}
