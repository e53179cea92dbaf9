use crate::error::{Result, SonicPortError};
use crate::format::{AudioFormat, SampleFormat};
use crossbeam_channel::Receiver;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct SampleData {
    format: AudioFormat,
    samples: Vec<f32>,
}

/// A decoded, immutable sample. Cloning shares the data.
#[derive(Debug, Clone)]
pub struct AudioSample {
    inner: Arc<SampleData>,
}

impl AudioSample {
    /// Wraps interleaved `samples` described by `format`.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is invalid or the data does not hold a
    /// whole number of frames.
    pub fn new(format: AudioFormat, samples: Vec<f32>) -> Result<Self> {
        if format.sample_rate() == 0 || format.channel_count() == 0 {
            return Err(SonicPortError::AudioFormat(format!(
                "Sample format {} has no rate or channels",
                format
            )));
        }
        if samples.len() % format.channel_count() as usize != 0 {
            return Err(SonicPortError::AudioFormat(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                format.channel_count()
            )));
        }
        Ok(Self {
            inner: Arc::new(SampleData { format, samples }),
        })
    }

    /// A sine tone, mainly for tests and demos.
    pub fn tone(frequency: f32, sample_rate: u32, channels: u16, duration: Duration) -> Result<Self> {
        let format = AudioFormat::new(SampleFormat::Float, sample_rate, channels);
        let frames = format.frames_for_duration(duration);
        let samples = (0..frames)
            .flat_map(|frame| {
                let value = (TAU * frequency * frame as f32 / sample_rate as f32).sin() * 0.5;
                std::iter::repeat_n(value, channels as usize)
            })
            .collect();
        Self::new(format, samples)
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.format
    }

    pub fn channel_count(&self) -> u16 {
        self.inner.format.channel_count()
    }

    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn frame_count(&self) -> usize {
        self.inner.samples.len() / self.channel_count() as usize
    }

    pub fn duration(&self) -> Duration {
        self.inner.format.duration_for_frames(self.frame_count())
    }

    /// Whether both handles share the same decoded data.
    pub fn ptr_eq(&self, other: &AudioSample) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Outcome of an asynchronous load.
pub type SampleResult = Result<AudioSample>;

/// Resolves a locator to a decoded sample. Decoding itself lives outside
/// this crate.
pub trait SampleLoader: Send + Sync {
    fn load(&self, locator: &str) -> SampleResult;
}

impl<F> SampleLoader for F
where
    F: Fn(&str) -> SampleResult + Send + Sync,
{
    fn load(&self, locator: &str) -> SampleResult {
        self(locator)
    }
}

/// Loads `locator` on a worker thread. The result arrives on the returned
/// channel exactly once.
pub fn request_sample(loader: Arc<dyn SampleLoader>, locator: &str) -> Receiver<SampleResult> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    let owned = locator.to_string();
    let worker_sender = sender.clone();

    let spawned = thread::Builder::new()
        .name("sonicport-sample-loader".into())
        .spawn(move || {
            log::debug!("Loading sample {}", owned);
            let _ = worker_sender.send(loader.load(&owned));
        });

    if let Err(e) = spawned {
        log::error!("Failed to spawn sample loader for {}: {}", locator, e);
        let _ = sender.send(Err(SonicPortError::Io(e)));
    }
    receiver
}
