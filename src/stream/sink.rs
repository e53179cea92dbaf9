//! Playback endpoint.

use super::{Feeder, StreamShared, ring_capacity, whole_frames};
use super::state::{ErrorState, StreamState, StreamStateMachine};
use crate::backend::{AudioBackend, BackendStream, RenderCallback};
use crate::config::StreamDesc;
use crate::device::AudioDevice;
use crate::error::{Result, SonicPortError};
use crate::events::SonicPortEvent;
use crate::format::AudioFormat;
use crate::format::convert::{apply_volume, decode_samples, scale_in_place};
use crossbeam_channel::Receiver;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Supplies bytes in pull mode. Returns how many bytes were written.
pub type PullReader = Box<dyn FnMut(&mut [u8]) -> usize + Send + 'static>;

/// A playback stream on one device with one format.
///
/// See the [module docs](super) for the three operating modes.
pub struct AudioSink {
    backend: Arc<dyn AudioBackend>,
    device: AudioDevice,
    format: AudioFormat,
    desc: StreamDesc,
    shared: Arc<StreamShared>,
    machine: StreamStateMachine,
    stream: Option<Box<dyn BackendStream>>,
    feeder: Option<Feeder>,
}

impl AudioSink {
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

    /// Starts with `render` called directly from the device thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open the device with this
    /// format. The stream is then `Stopped` with `OpenError`.
    pub fn start_callback(&mut self, mut render: RenderCallback) -> Result<()> {
        self.stop();
        let shared = self.shared.clone();
        let channels = self.format.channel_count().max(1) as usize;
        self.open(Box::new(move |buffer: &mut [f32]| {
            render(buffer);
            scale_in_place(shared.volume(), buffer);
            shared.add_frames(buffer.len() / channels);
        }))
    }

    /// Starts in push mode and returns the writer half.
    ///
    /// # Errors
    ///
    /// Same as [`start_callback`](Self::start_callback).
    pub fn start_push(&mut self) -> Result<SinkWriter> {
        self.stop();
        let (producer, consumer) = HeapRb::<u8>::new(ring_capacity(&self.format, &self.desc)).split();
        self.open(self.ring_reader(consumer))?;
        Ok(SinkWriter {
            producer,
            shared: self.shared.clone(),
            format: self.format,
            scratch: Vec::new(),
        })
    }

    /// Starts in pull mode. `reader` is called every `poll_interval` to top
    /// up the buffer.
    ///
    /// # Errors
    ///
    /// Same as [`start_callback`](Self::start_callback), plus a failure to
    /// spawn the feeder thread.
    pub fn start_pull(&mut self, mut reader: PullReader) -> Result<()> {
        self.stop();
        let (producer, consumer) = HeapRb::<u8>::new(ring_capacity(&self.format, &self.desc)).split();
        let mut writer = SinkWriter {
            producer,
            shared: self.shared.clone(),
            format: self.format,
            scratch: Vec::new(),
        };
        let mut chunk = vec![0u8; writer.producer.capacity().get()];

        self.open(self.ring_reader(consumer))?;
        // Prime the buffer before the first feeder tick.
        writer.fill_from(&mut reader, &mut chunk);
        match Feeder::spawn("sonicport-sink-feeder", self.desc.poll_interval, move || {
            writer.fill_from(&mut reader, &mut chunk);
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

    /// Real-time side of push and pull mode: drains the ring into the device
    /// buffer and zero-fills whatever is missing.
    fn ring_reader(&self, mut consumer: HeapCons<u8>) -> RenderCallback {
        let shared = self.shared.clone();
        let format = self.format;
        let bytes_per_sample = format.bytes_per_sample().max(1);
        let channels = format.channel_count().max(1) as usize;
        let mut scratch = vec![0u8; format.bytes_for_frames(self.desc.block_frames.max(1))];

        Box::new(move |buffer: &mut [f32]| {
            let mut filled = 0;
            while filled < buffer.len() {
                let want = ((buffer.len() - filled) * bytes_per_sample).min(scratch.len());
                let popped = consumer.pop_slice(&mut scratch[..want]);
                if popped == 0 {
                    break;
                }
                filled += decode_samples(format.sample_format(), &scratch[..popped], &mut buffer[filled..]);
            }
            buffer[filled..].fill(0.0);

            let starved = filled < buffer.len();
            shared.idle.store(starved, Ordering::Release);
            if starved {
                shared.errors.raise(ErrorState::UnderrunError);
            }
            shared.add_frames(filled / channels);
        })
    }

    fn open(&mut self, render: RenderCallback) -> Result<()> {
        self.shared.errors.take();
        self.shared.idle.store(false, Ordering::Release);

        let opened = self
            .backend
            .open_sink(&self.device, &self.format, render, self.shared.errors.clone())
            .and_then(|mut stream| stream.play().map(|()| stream));

        match opened {
            Ok(stream) => {
                log::info!("Sink started on {} with {}", self.device.id(), self.format);
                self.stream = Some(stream);
                self.shared.running.store(true, Ordering::Release);
                self.machine.transition(StreamState::Active, ErrorState::NoError);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to open sink on {}: {}", self.device.id(), e);
                self.machine.transition(StreamState::Stopped, ErrorState::OpenError);
                Err(e)
            }
        }
    }

    /// Pauses the device. Buffered data is kept.
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

    /// Closes the stream. Later writes are ignored.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(mut feeder) = self.feeder.take() {
            feeder.shutdown();
        }
        if self.stream.take().is_some() {
            log::info!("Sink stopped on {}", self.device.id());
        }
        let error = match self.machine.error() {
            ErrorState::UnderrunError => ErrorState::NoError,
            other => other,
        };
        self.machine.transition(StreamState::Stopped, error);
    }

    /// Stops and drops buffered data and the error state.
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

    /// Frames delivered to the device since the last reset.
    pub fn processed_frames(&self) -> u64 {
        self.shared.processed_frames.load(Ordering::Relaxed)
    }

    /// Folds real-time status into the state machine and returns the state.
    ///
    /// A terminal error closes the stream. Call this periodically from the
    /// owning thread.
    pub fn poll(&mut self) -> StreamState {
        let error = self.shared.errors.take();
        if error.is_terminal() {
            log::error!("Sink on {} failed: {}", self.device.id(), error);
            self.shared.running.store(false, Ordering::Release);
            self.feeder.take();
            self.stream.take();
            self.machine.transition(StreamState::Stopped, error);
            return self.state();
        }

        let idle = self.shared.idle.load(Ordering::Acquire);
        let error = if idle {
            ErrorState::UnderrunError
        } else {
            ErrorState::NoError
        };
        self.machine.update_idle(idle, error);
        self.state()
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.machine.events().subscribe()
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn not_started() -> SonicPortError {
    SonicPortError::Stream("Sink has not been started".into())
}

/// Client half of a push-mode sink.
pub struct SinkWriter {
    producer: HeapProd<u8>,
    shared: Arc<StreamShared>,
    format: AudioFormat,
    scratch: Vec<u8>,
}

impl SinkWriter {
    /// Bytes that can be written now, in whole frames. Zero once stopped.
    pub fn bytes_free(&self) -> usize {
        if !self.shared.is_running() {
            return 0;
        }
        whole_frames(self.producer.vacant_len(), self.format.bytes_per_frame())
    }

    /// Writes as many whole frames of `data` as fit, scaled by the sink
    /// volume. Returns the number of bytes consumed.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let len = whole_frames(data.len().min(self.bytes_free()), self.format.bytes_per_frame());
        if len == 0 {
            return 0;
        }

        self.scratch.resize(len, 0);
        apply_volume(
            self.shared.volume(),
            self.format.sample_format(),
            &data[..len],
            &mut self.scratch,
        );
        self.producer.push_slice(&self.scratch)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    fn fill_from(&mut self, reader: &mut PullReader, chunk: &mut [u8]) {
        let free = self.bytes_free().min(chunk.len());
        if free == 0 {
            return;
        }
        let read = reader(&mut chunk[..free]).min(free);
        self.write(&chunk[..read]);
    }
}
