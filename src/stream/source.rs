//! Capture endpoint.

use super::state::{ErrorState, StreamState, StreamStateMachine};
use super::{Feeder, StreamShared, ring_capacity, whole_frames};
use crate::backend::{AudioBackend, BackendStream, CaptureCallback};
use crate::config::StreamDesc;
use crate::device::AudioDevice;
use crate::error::{Result, SonicPortError};
use crate::events::SonicPortEvent;
use crate::format::AudioFormat;
use crate::format::convert::encode_samples;
use crossbeam_channel::Receiver;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Receives captured bytes in push mode.
pub type PushWriter = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A capture stream on one device with one format. Mirrors
/// [`AudioSink`](super::AudioSink).
pub struct AudioSource {
    backend: Arc<dyn AudioBackend>,
    device: AudioDevice,
    format: AudioFormat,
    desc: StreamDesc,
    shared: Arc<StreamShared>,
    machine: StreamStateMachine,
    stream: Option<Box<dyn BackendStream>>,
    feeder: Option<Feeder>,
}

impl AudioSource {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        device: AudioDevice,
        format: AudioFormat,
        desc: StreamDesc,
    ) -> Self {
        Self {
            backend,
            device,
            format,
            desc,
            shared: StreamShared::new(),
            machine: StreamStateMachine::new(),
            stream: None,
            feeder: None,
        }
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Starts with `capture` called directly from the device thread.
    ///
    /// The volume is applied on a preallocated copy of each period.
    pub fn start_callback(&mut self, mut capture: CaptureCallback) -> Result<()> {
        self.stop();
        let shared = self.shared.clone();
        let channels = self.format.channel_count().max(1) as usize;
        let mut scaled = vec![0.0f32; self.desc.block_frames.max(1) * channels];

        self.open(Box::new(move |input: &[f32]| {
            let volume = shared.volume();
            if volume == 1.0 {
                capture(input);
            } else {
                for chunk in input.chunks(scaled.len()) {
                    let out = &mut scaled[..chunk.len()];
                    for (dst, src) in out.iter_mut().zip(chunk) {
                        *dst = src * volume;
                    }
                    capture(out);
                }
            }
            shared.add_frames(input.len() / channels);
        }))
    }

    /// Starts in pull mode and returns the reader half.
    pub fn start_pull(&mut self) -> Result<SourceReader> {
        self.stop();
        let (producer, consumer) = HeapRb::<u8>::new(ring_capacity(&self.format, &self.desc)).split();
        self.open(self.ring_writer(producer))?;
        Ok(SourceReader {
            consumer,
            shared: self.shared.clone(),
            format: self.format,
        })
    }

    /// Starts in push mode. Captured bytes are handed to `writer` every
    /// `poll_interval`.
    pub fn start_push(&mut self, mut writer: PushWriter) -> Result<()> {
        self.stop();
        let (producer, consumer) = HeapRb::<u8>::new(ring_capacity(&self.format, &self.desc)).split();
        self.open(self.ring_writer(producer))?;

        let mut reader = SourceReader {
            consumer,
            shared: self.shared.clone(),
            format: self.format,
        };
        let mut chunk = vec![0u8; reader.consumer.capacity().get()];
        match Feeder::spawn("sonicport-source-feeder", self.desc.poll_interval, move || {
            let read = reader.read(&mut chunk);
            if read > 0 {
                writer(&chunk[..read]);
            }
        }) {
            Ok(feeder) => {
                self.feeder = Some(feeder);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    /// Real-time side of push and pull mode: encodes captured frames into the
    /// ring. Frames that do not fit are dropped.
    fn ring_writer(&self, mut producer: HeapProd<u8>) -> CaptureCallback {
        let shared = self.shared.clone();
        let format = self.format;
        let channels = format.channel_count().max(1) as usize;
        let bytes_per_frame = format.bytes_per_frame();
        let block_samples = self.desc.block_frames.max(1) * channels;
        let mut scaled = vec![0.0f32; block_samples];
        let mut encoded = vec![0u8; format.bytes_for_frames(self.desc.block_frames.max(1))];

        Box::new(move |input: &[f32]| {
            let volume = shared.volume();
            let mut delivered = 0;
            for chunk in input.chunks(block_samples) {
                let samples = &mut scaled[..chunk.len()];
                for (dst, src) in samples.iter_mut().zip(chunk) {
                    *dst = src * volume;
                }
                let room = whole_frames(producer.vacant_len(), bytes_per_frame);
                let len = whole_frames(
                    encode_samples(format.sample_format(), samples, &mut encoded)
                        * format.bytes_per_sample(),
                    bytes_per_frame,
                )
                .min(room);
                delivered += producer.push_slice(&encoded[..len]);
            }

            let overflowed = delivered < whole_frames(input.len() * format.bytes_per_sample(), bytes_per_frame);
            shared.idle.store(overflowed, Ordering::Release);
            if bytes_per_frame > 0 {
                shared.add_frames(delivered / bytes_per_frame);
            }
        })
    }

    fn open(&mut self, capture: CaptureCallback) -> Result<()> {
        self.shared.errors.take();
        self.shared.idle.store(false, Ordering::Release);

        let opened = self
            .backend
            .open_source(&self.device, &self.format, capture, self.shared.errors.clone())
            .and_then(|mut stream| stream.play().map(|()| stream));

        match opened {
            Ok(stream) => {
                log::info!("Source started on {} with {}", self.device.id(), self.format);
                self.stream = Some(stream);
                self.shared.running.store(true, Ordering::Release);
                self.machine.transition(StreamState::Active, ErrorState::NoError);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to open source on {}: {}", self.device.id(), e);
                self.machine.transition(StreamState::Stopped, ErrorState::OpenError);
                Err(e)
            }
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        if !matches!(self.state(), StreamState::Active | StreamState::Idle) {
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or_else(not_started)?;
        stream.pause()?;
        let error = self.machine.error();
        self.machine.transition(StreamState::Suspended, error);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state() != StreamState::Suspended {
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or_else(not_started)?;
        stream.play()?;
        self.machine.transition(StreamState::Active, ErrorState::NoError);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(mut feeder) = self.feeder.take() {
            feeder.shutdown();
        }
        if self.stream.take().is_some() {
            log::info!("Source stopped on {}", self.device.id());
        }
        let error = self.machine.error();
        self.machine.transition(StreamState::Stopped, error);
    }

    pub fn reset(&mut self) {
        self.stop();
        self.shared.errors.take();
        self.shared.processed_frames.store(0, Ordering::Relaxed);
        self.machine.transition(StreamState::Stopped, ErrorState::NoError);
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    pub fn state(&self) -> StreamState {
        self.machine.state()
    }

    pub fn error(&self) -> ErrorState {
        self.machine.error()
    }

    pub fn processed_frames(&self) -> u64 {
        self.shared.processed_frames.load(Ordering::Relaxed)
    }

    /// Folds real-time status into the state machine.
    ///
    /// A source is `Idle` while captured frames are being dropped because
    /// the client is not reading.
    pub fn poll(&mut self) -> StreamState {
        let error = self.shared.errors.take();
        if error.is_terminal() {
            log::error!("Source on {} failed: {}", self.device.id(), error);
            self.shared.running.store(false, Ordering::Release);
            self.feeder.take();
            self.stream.take();
            self.machine.transition(StreamState::Stopped, error);
            return self.state();
        }

        let idle = self.shared.idle.load(Ordering::Acquire);
        self.machine.update_idle(idle, ErrorState::NoError);
        self.state()
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.machine.events().subscribe()
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn not_started() -> SonicPortError {
    SonicPortError::Stream("Source has not been started".into())
}

/// Client half of a pull-mode source.
pub struct SourceReader {
    consumer: HeapCons<u8>,
    shared: Arc<StreamShared>,
    format: AudioFormat,
}

impl SourceReader {
    /// Captured bytes waiting to be read, in whole frames.
    pub fn bytes_ready(&self) -> usize {
        whole_frames(self.consumer.occupied_len(), self.format.bytes_per_frame())
    }

    /// Reads whole frames into `out`. Returns the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let len = whole_frames(out.len().min(self.bytes_ready()), self.format.bytes_per_frame());
        let read = self.consumer.pop_slice(&mut out[..len]);
        if read > 0 {
            self.shared.idle.store(false, Ordering::Release);
        }
        read
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::device::DeviceMode;
    use crate::format::SampleFormat;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn setup(format: AudioFormat) -> (Arc<MockBackend>, AudioSource) {
        let backend = Arc::new(MockBackend::new().with_inputs(vec![MockBackend::device(
            "mic",
            "Microphone",
            DeviceMode::Input,
            true,
        )]));
        let device = backend.default_device(DeviceMode::Input).unwrap();
        let source = AudioSource::new(backend.clone(), device, format, StreamDesc::default());
        (backend, source)
    }

    #[test]
    fn test_pull_mode_reads_encoded_frames() {
        let (backend, mut source) = setup(AudioFormat::new(SampleFormat::Int16, 16000, 2));
        let mut reader = source.start_pull().unwrap();
        assert_eq!(reader.bytes_ready(), 0);

        assert_eq!(backend.capture("mic", &[0.5, -0.5, 0.25]), 1);
        assert_eq!(reader.bytes_ready(), 4);

        let mut out = [0u8; 16];
        assert_eq!(reader.read(&mut out), 4);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), 16383);
        assert_eq!(i16::from_ne_bytes([out[2], out[3]]), -16383);
        assert_eq!(source.processed_frames(), 1);
    }

    #[test]
    fn test_callback_mode_applies_volume() {
        let (backend, mut source) = setup(AudioFormat::new(SampleFormat::Float, 48000, 1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        source.set_volume(0.5);
        source
            .start_callback(Box::new(move |input| sink.lock().extend_from_slice(input)))
            .unwrap();

        backend.capture("mic", &[1.0, -1.0]);
        assert_eq!(*seen.lock(), vec![0.5, -0.5]);
    }

    #[test]
    fn test_push_mode_delivers_to_writer() {
        let (backend, mut source) = setup(AudioFormat::new(SampleFormat::UInt8, 8000, 1));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        source
            .start_push(Box::new(move |bytes| sink.lock().extend_from_slice(bytes)))
            .unwrap();

        backend.capture("mic", &[0.0, 0.0, 0.0]);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(*received.lock(), vec![0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_fatal_error_stops_source() {
        let (backend, mut source) = setup(AudioFormat::new(SampleFormat::Float, 48000, 1));
        let _reader = source.start_pull().unwrap();
        backend.inject_error("mic", ErrorState::FatalError);
        assert_eq!(source.poll(), StreamState::Stopped);
        assert_eq!(source.error(), ErrorState::FatalError);
        assert_eq!(backend.capture("mic", &[0.0]), 0);
    }
}
