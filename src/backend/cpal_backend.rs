//! Native backend on top of cpal.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream is built
//! and owned by its own control thread. The returned handle only talks to
//! that thread over a channel. Device ids are the names cpal reports.
//!
//! Devices whose config ranges come back empty are described by trial
//! stream construction instead, memoized in a [`ProbeCache`].

use super::{AudioBackend, BackendStream, CaptureCallback, RenderCallback};
use crate::device::{
    AudioDevice, DeviceEnumerator, DeviceMode, FormatCapabilities, ProbeCache, StreamProber,
};
use crate::error::{Result, SonicPortError};
use crate::format::{AudioFormat, ChannelConfig, SampleFormat};
use crate::stream::{ErrorSlot, ErrorState};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Frames processed per render call when the device hands out larger buffers.
const SCRATCH_FRAMES: usize = 4096;

pub struct CpalBackend {
    host_id: cpal::HostId,
    trials: ProbeCache,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host_id: cpal::default_host().id(),
            trials: ProbeCache::new(),
        }
    }

    fn device_capabilities(
        &self,
        device: &cpal::Device,
        name: &str,
        mode: DeviceMode,
    ) -> FormatCapabilities {
        let caps = capabilities(device, mode);
        if !caps.is_empty() {
            return caps;
        }
        log::debug!("cpal has no config ranges for {} {}, trying streams", mode, name);
        self.trials.get_or_probe(self, name, mode).as_ref().clone()
    }

    fn host(&self) -> Result<cpal::Host> {
        cpal::host_from_id(self.host_id)
            .map_err(|e| SonicPortError::AudioDevice(format!("Host unavailable: {}", e)))
    }
}

fn device_list(host: &cpal::Host, mode: DeviceMode) -> Result<Vec<cpal::Device>> {
    let devices: Vec<cpal::Device> = match mode {
        DeviceMode::Input => host
            .input_devices()
            .map_err(|e| SonicPortError::AudioDevice(format!("Failed to list inputs: {}", e)))?
            .collect(),
        DeviceMode::Output => host
            .output_devices()
            .map_err(|e| SonicPortError::AudioDevice(format!("Failed to list outputs: {}", e)))?
            .collect(),
    };
    Ok(devices)
}

fn find_device(host: &cpal::Host, mode: DeviceMode, id: &str) -> Result<cpal::Device> {
    device_list(host, mode)?
        .into_iter()
        .find(|d| d.name().is_ok_and(|name| name == id))
        .ok_or_else(|| SonicPortError::AudioDevice(format!("Device {} not found", id)))
}

fn to_sample_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::U8 => Some(SampleFormat::UInt8),
        cpal::SampleFormat::I16 => Some(SampleFormat::Int16),
        cpal::SampleFormat::I32 => Some(SampleFormat::Int32),
        cpal::SampleFormat::F32 => Some(SampleFormat::Float),
        _ => None,
    }
}

fn config_ranges(
    device: &cpal::Device,
    mode: DeviceMode,
) -> Vec<cpal::SupportedStreamConfigRange> {
    let ranges: std::result::Result<Vec<_>, _> = match mode {
        DeviceMode::Input => device.supported_input_configs().map(|c| c.collect()),
        DeviceMode::Output => device.supported_output_configs().map(|c| c.collect()),
    };
    ranges.unwrap_or_default()
}

fn capabilities(device: &cpal::Device, mode: DeviceMode) -> FormatCapabilities {
    let mut caps = FormatCapabilities::empty();
    let mut first = true;

    for range in config_ranges(device, mode) {
        let Some(sample_format) = to_sample_format(range.sample_format()) else {
            continue;
        };
        if !caps.supported_formats.contains(&sample_format) {
            caps.supported_formats.push(sample_format);
        }
        let (channels, min_rate, max_rate) = (
            range.channels(),
            range.min_sample_rate().0,
            range.max_sample_rate().0,
        );
        if first {
            caps.min_channels = channels;
            caps.max_channels = channels;
            caps.min_sample_rate = min_rate;
            caps.max_sample_rate = max_rate;
            first = false;
        } else {
            caps.min_channels = caps.min_channels.min(channels);
            caps.max_channels = caps.max_channels.max(channels);
            caps.min_sample_rate = caps.min_sample_rate.min(min_rate);
            caps.max_sample_rate = caps.max_sample_rate.max(max_rate);
        }
    }

    caps.channel_config = ChannelConfig::default_for_channel_count(caps.max_channels);
    caps
}

fn describe(
    name: String,
    mode: DeviceMode,
    capabilities: FormatCapabilities,
    default_name: Option<&str>,
) -> AudioDevice {
    let is_default = default_name == Some(name.as_str());
    AudioDevice::new(name.clone(), name, mode)
        .with_capabilities(capabilities)
        .with_default(is_default)
}

fn stream_config(format: &AudioFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: format.channel_count(),
        sample_rate: cpal::SampleRate(format.sample_rate()),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn raise_stream_error(errors: &ErrorSlot, err: cpal::StreamError) {
    match err {
        cpal::StreamError::DeviceNotAvailable => errors.raise(ErrorState::FatalError),
        _ => errors.raise(ErrorState::IoError),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderCallback,
    errors: Arc<ErrorSlot>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let buffer = &mut scratch[..chunk.len()];
                    buffer.fill(0.0);
                    render(buffer);
                    for (out, sample) in chunk.iter_mut().zip(buffer.iter()) {
                        *out = T::from_sample(*sample);
                    }
                }
            },
            move |err| raise_stream_error(&errors, err),
            None,
        )
        .map_err(|e| SonicPortError::AudioDevice(format!("Failed to build stream: {}", e)))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut capture: CaptureCallback,
    errors: Arc<ErrorSlot>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(scratch.len()) {
                    let buffer = &mut scratch[..chunk.len()];
                    for (out, sample) in buffer.iter_mut().zip(chunk.iter()) {
                        *out = sample.to_sample::<f32>();
                    }
                    capture(buffer);
                }
            },
            move |err| raise_stream_error(&errors, err),
            None,
        )
        .map_err(|e| SonicPortError::AudioDevice(format!("Failed to build stream: {}", e)))
}

enum StreamCallback {
    Render(RenderCallback),
    Capture(CaptureCallback),
}

fn build_stream(
    host_id: cpal::HostId,
    device_id: &str,
    mode: DeviceMode,
    format: &AudioFormat,
    callback: StreamCallback,
    errors: Arc<ErrorSlot>,
) -> Result<cpal::Stream> {
    let host = cpal::host_from_id(host_id)
        .map_err(|e| SonicPortError::AudioDevice(format!("Host unavailable: {}", e)))?;
    let device = find_device(&host, mode, device_id)?;
    let config = stream_config(format);

    match (callback, format.sample_format()) {
        (StreamCallback::Render(render), SampleFormat::UInt8) => {
            build_output::<u8>(&device, &config, render, errors)
        }
        (StreamCallback::Render(render), SampleFormat::Int16) => {
            build_output::<i16>(&device, &config, render, errors)
        }
        (StreamCallback::Render(render), SampleFormat::Int32) => {
            build_output::<i32>(&device, &config, render, errors)
        }
        (StreamCallback::Render(render), SampleFormat::Float) => {
            build_output::<f32>(&device, &config, render, errors)
        }
        (StreamCallback::Capture(capture), SampleFormat::UInt8) => {
            build_input::<u8>(&device, &config, capture, errors)
        }
        (StreamCallback::Capture(capture), SampleFormat::Int16) => {
            build_input::<i16>(&device, &config, capture, errors)
        }
        (StreamCallback::Capture(capture), SampleFormat::Int32) => {
            build_input::<i32>(&device, &config, capture, errors)
        }
        (StreamCallback::Capture(capture), SampleFormat::Float) => {
            build_input::<f32>(&device, &config, capture, errors)
        }
        (_, SampleFormat::Unknown) => Err(SonicPortError::AudioFormat(
            "Unsupported sample format".into(),
        )),
    }
}

enum ControlCommand {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
    Shutdown,
}

/// Handle to a stream living on its control thread.
pub struct CpalStream {
    format: AudioFormat,
    commands: Sender<ControlCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn spawn<F>(format: AudioFormat, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (commands, command_rx) = crossbeam_channel::unbounded();

        let thread = std::thread::Builder::new()
            .name("sonicport-cpal".into())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_control_loop(stream, command_rx);
            })?;

        let ready = ready_rx
            .recv()
            .map_err(|_| SonicPortError::Engine("Stream thread exited during setup".into()))?;
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        Ok(Self {
            format,
            commands,
            thread: Some(thread),
        })
    }

    fn request(&self, make: fn(Sender<Result<()>>) -> ControlCommand) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| SonicPortError::Stream("Stream thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| SonicPortError::Stream("Stream thread is gone".into()))?
    }
}

fn run_control_loop(stream: cpal::Stream, commands: Receiver<ControlCommand>) {
    for command in commands.iter() {
        match command {
            ControlCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| SonicPortError::Stream(format!("Failed to start stream: {}", e)));
                let _ = reply.send(result);
            }
            ControlCommand::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| SonicPortError::Stream(format!("Failed to pause stream: {}", e)));
                let _ = reply.send(result);
            }
            ControlCommand::Shutdown => break,
        }
    }
}

impl BackendStream for CpalStream {
    fn play(&mut self) -> Result<()> {
        self.request(ControlCommand::Play)
    }

    fn pause(&mut self) -> Result<()> {
        self.request(ControlCommand::Pause)
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(ControlCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl DeviceEnumerator for CpalBackend {
    fn enumerate(&self, mode: DeviceMode) -> Result<Vec<AudioDevice>> {
        let host = self.host()?;
        let default = match mode {
            DeviceMode::Input => host.default_input_device(),
            DeviceMode::Output => host.default_output_device(),
        };
        let default_name = default.and_then(|d| d.name().ok());

        let devices: Vec<AudioDevice> = device_list(&host, mode)?
            .iter()
            .filter_map(|d| {
                let name = d.name().ok()?;
                let caps = self.device_capabilities(d, &name, mode);
                Some(describe(name, mode, caps, default_name.as_deref()))
            })
            .collect();
        log::debug!("cpal reported {} {} devices", devices.len(), mode);
        Ok(devices)
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open_sink(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        render: RenderCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>> {
        let host_id = self.host_id;
        let device_id = device.id().to_string();
        let requested = *format;
        let stream = CpalStream::spawn(requested, move || {
            build_stream(
                host_id,
                &device_id,
                DeviceMode::Output,
                &requested,
                StreamCallback::Render(render),
                errors,
            )
        })?;
        log::info!("Opened cpal sink on {} with {}", device.id(), format);
        Ok(Box::new(stream))
    }

    fn open_source(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        capture: CaptureCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>> {
        let host_id = self.host_id;
        let device_id = device.id().to_string();
        let requested = *format;
        let stream = CpalStream::spawn(requested, move || {
            build_stream(
                host_id,
                &device_id,
                DeviceMode::Input,
                &requested,
                StreamCallback::Capture(capture),
                errors,
            )
        })?;
        log::info!("Opened cpal source on {} with {}", device.id(), format);
        Ok(Box::new(stream))
    }
}

impl StreamProber for CpalBackend {
    fn try_open(&self, device_id: &str, mode: DeviceMode, format: &AudioFormat) -> bool {
        if !format.is_valid() {
            return false;
        }
        let callback = match mode {
            DeviceMode::Output => {
                StreamCallback::Render(Box::new(|buffer: &mut [f32]| buffer.fill(0.0)))
            }
            DeviceMode::Input => StreamCallback::Capture(Box::new(|_: &[f32]| {})),
        };
        let errors = Arc::new(ErrorSlot::new());
        // Built and dropped on this thread, never played.
        build_stream(self.host_id, device_id, mode, format, callback, errors).is_ok()
    }
}
