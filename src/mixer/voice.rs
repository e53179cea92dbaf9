use super::sample::AudioSample;
use crate::error::{Result, SonicPortError};
use crate::format::AudioFormat;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

static NEXT_VOICE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(u64);

impl VoiceId {
    /// Allocates a process-unique id.
    pub fn allocate() -> Self {
        Self(NEXT_VOICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    Finite(u32),
    Infinite,
}

impl LoopCount {
    /// Atomic representation of [`LoopCount::Infinite`].
    pub const INFINITE_RAW: i32 = -2;

    /// Zero plays once, like one.
    pub fn normalized(self) -> Self {
        match self {
            Self::Finite(0) => Self::Finite(1),
            other => other,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self.normalized() {
            Self::Finite(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Self::Infinite => Self::INFINITE_RAW,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            Self::INFINITE_RAW => Self::Infinite,
            n => Self::Finite(u32::try_from(n).unwrap_or(0)),
        }
    }
}

impl Default for LoopCount {
    fn default() -> Self {
        Self::Finite(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePlayResult {
    Playing,
    Finished,
}

/// One playing instance of a sample.
///
/// Volume, mute and the loop counter are atomics so the owning thread can
/// change them while the render thread plays the voice. The cursor is only
/// written by the render thread.
#[derive(Debug)]
pub struct Voice {
    id: VoiceId,
    sample: AudioSample,
    output_channels: usize,
    volume: AtomicU32,
    muted: AtomicBool,
    loops_remaining: AtomicI32,
    cursor: AtomicUsize,
    loop_changed: AtomicBool,
}

impl Voice {
    /// Creates a voice that plays `sample` into buffers of `output` format.
    ///
    /// # Errors
    ///
    /// Only equal channel counts, mono to stereo and stereo to mono are
    /// supported. Any other combination is rejected here rather than at
    /// render time.
    pub fn new(sample: AudioSample, output: &AudioFormat) -> Result<Self> {
        let input_channels = sample.channel_count() as usize;
        let output_channels = output.channel_count() as usize;
        if !channels_supported(input_channels, output_channels) {
            return Err(SonicPortError::AudioFormat(format!(
                "Cannot play a {}-channel sample into {} channels",
                input_channels, output_channels
            )));
        }
        Ok(Self {
            id: VoiceId::allocate(),
            sample,
            output_channels,
            volume: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            loops_remaining: AtomicI32::new(LoopCount::default().to_raw()),
            cursor: AtomicUsize::new(0),
            loop_changed: AtomicBool::new(false),
        })
    }

    pub fn with_volume(self, volume: f32) -> Self {
        self.set_volume(volume);
        self
    }

    pub fn with_muted(self, muted: bool) -> Self {
        self.set_muted(muted);
        self
    }

    pub fn with_loop_count(self, loops: LoopCount) -> Self {
        self.set_loop_count(loops);
        self
    }

    /// A new voice for `output` that resumes where this one is.
    pub fn clone_for(&self, output: &AudioFormat) -> Result<Self> {
        let clone = Self::new(self.sample.clone(), output)?;
        clone.volume.store(self.volume.load(Ordering::Relaxed), Ordering::Relaxed);
        clone.muted.store(self.is_muted(), Ordering::Relaxed);
        clone
            .loops_remaining
            .store(self.loops_remaining(), Ordering::Relaxed);
        clone.cursor.store(self.current_frame(), Ordering::Relaxed);
        Ok(clone)
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn sample(&self) -> &AudioSample {
        &self.sample
    }

    /// Channel count of the buffers this voice mixes into.
    pub fn output_channels(&self) -> u16 {
        self.output_channels as u16
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_loop_count(&self, loops: LoopCount) {
        self.loops_remaining.store(loops.to_raw(), Ordering::Release);
    }

    /// Remaining loops, or [`LoopCount::INFINITE_RAW`].
    pub fn loops_remaining(&self) -> i32 {
        self.loops_remaining.load(Ordering::Acquire)
    }

    pub fn current_frame(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> usize {
        self.sample.frame_count()
    }

    pub fn is_active(&self) -> bool {
        self.current_frame() != self.total_frames() || self.loops_remaining() != 0
    }

    /// Whether the loop counter moved since the last call.
    pub fn take_loop_changed(&self) -> bool {
        self.loop_changed.swap(false, Ordering::AcqRel)
    }

    /// Mixes the voice into `output`, adding to what is already there.
    ///
    /// Real-time safe: no allocation, no locks. When the end of the sample is
    /// reached with loops left, playback wraps and continues into the rest
    /// of `output` within the same call.
    pub fn play(&self, output: &mut [f32]) -> VoicePlayResult {
        let total = self.total_frames();
        if total == 0 || !self.is_active() {
            return VoicePlayResult::Finished;
        }

        let mut output = output;
        loop {
            let cursor = self.cursor.load(Ordering::Relaxed);
            let frames = (total - cursor.min(total)).min(output.len() / self.output_channels);
            let (head, tail) = std::mem::take(&mut output).split_at_mut(frames * self.output_channels);
            self.mix(cursor, head);

            let cursor = cursor + frames;
            self.cursor.store(cursor, Ordering::Release);
            if cursor < total {
                return VoicePlayResult::Playing;
            }

            if !self.advance_loop() {
                return VoicePlayResult::Finished;
            }
            self.cursor.store(0, Ordering::Release);
            if tail.len() < self.output_channels {
                return VoicePlayResult::Playing;
            }
            output = tail;
        }
    }

    /// Consumes one loop. Returns whether playback continues.
    ///
    /// An exhausted counter stays at zero, so a finished voice never wraps
    /// around into [`LoopCount::INFINITE_RAW`].
    fn advance_loop(&self) -> bool {
        let consumed = self
            .loops_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |loops| match loops {
                LoopCount::INFINITE_RAW => None,
                n if n > 0 => Some(n - 1),
                _ => None,
            });
        match consumed {
            Ok(previous) => {
                self.loop_changed.store(true, Ordering::Release);
                previous > 1
            }
            Err(loops) => loops == LoopCount::INFINITE_RAW,
        }
    }

    /// Adds frames starting at `cursor` into `output`. Silent voices only
    /// advance.
    fn mix(&self, cursor: usize, output: &mut [f32]) {
        let volume = if self.is_muted() { 0.0 } else { self.volume() };
        if volume == 0.0 {
            return;
        }

        let input_channels = self.sample.channel_count() as usize;
        let frames = output.len() / self.output_channels;
        let start = cursor * input_channels;
        let input = &self.sample.samples()[start..start + frames * input_channels];

        match (input_channels, self.output_channels) {
            (1, 2) => {
                for (out, &x) in output.chunks_exact_mut(2).zip(input) {
                    out[0] += x * volume;
                    out[1] += x * volume;
                }
            }
            (2, 1) => {
                for (out, frame) in output.iter_mut().zip(input.chunks_exact(2)) {
                    *out += (frame[0] + frame[1]) * 0.5 * volume;
                }
            }
            _ => {
                for (out, &x) in output.iter_mut().zip(input) {
                    *out += x * volume;
                }
            }
        }
    }
}

fn channels_supported(input: usize, output: usize) -> bool {
    input > 0 && (input == output || matches!((input, output), (1, 2) | (2, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn sample(channels: u16, frames: usize, value: f32) -> AudioSample {
        let format = AudioFormat::new(SampleFormat::Float, 48000, channels);
        AudioSample::new(format, vec![value; frames * channels as usize]).unwrap()
    }

    fn stereo() -> AudioFormat {
        AudioFormat::new(SampleFormat::Float, 48000, 2)
    }

    #[test]
    fn test_loop_wraps_within_one_call() {
        let voice = Voice::new(sample(2, 1000, 0.1), &stereo())
            .unwrap()
            .with_loop_count(LoopCount::Finite(3));

        let mut buffer = vec![0.0; 600 * 2];
        assert_eq!(voice.play(&mut buffer), VoicePlayResult::Playing);
        assert_eq!(voice.current_frame(), 600);
        assert_eq!(voice.loops_remaining(), 3);

        let mut buffer = vec![0.0; 800 * 2];
        assert_eq!(voice.play(&mut buffer), VoicePlayResult::Playing);
        assert_eq!(voice.current_frame(), 400);
        assert_eq!(voice.loops_remaining(), 2);
        assert!(voice.take_loop_changed());
        assert!(!voice.take_loop_changed());
        assert!(buffer.iter().all(|s| (*s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_finishes_after_last_loop() {
        let voice = Voice::new(sample(1, 100, 1.0), &AudioFormat::new(SampleFormat::Float, 48000, 1))
            .unwrap()
            .with_loop_count(LoopCount::Finite(2));

        let mut buffer = vec![0.0; 256];
        assert_eq!(voice.play(&mut buffer), VoicePlayResult::Finished);
        assert_eq!(voice.loops_remaining(), 0);
        assert!(!voice.is_active());
        assert_eq!(buffer[199], 1.0);
        assert_eq!(buffer[200], 0.0);
    }

    #[test]
    fn test_finished_voice_stays_inert() {
        let mono = AudioFormat::new(SampleFormat::Float, 48000, 1);
        let voice = Voice::new(sample(1, 4, 1.0), &mono).unwrap();

        let mut buffer = vec![0.0; 8];
        assert_eq!(voice.play(&mut buffer), VoicePlayResult::Finished);
        assert_eq!(voice.loops_remaining(), 0);
        assert!(voice.take_loop_changed());

        for _ in 0..4 {
            let mut buffer = vec![0.0; 8];
            assert_eq!(voice.play(&mut buffer), VoicePlayResult::Finished);
            assert!(buffer.iter().all(|s| *s == 0.0));
            assert_eq!(voice.loops_remaining(), 0);
            assert_eq!(voice.current_frame(), 4);
        }
        assert!(!voice.take_loop_changed());
    }

    #[test]
    fn test_infinite_loop_never_finishes() {
        let voice = Voice::new(sample(2, 10, 0.5), &stereo())
            .unwrap()
            .with_loop_count(LoopCount::Infinite);
        let mut buffer = vec![0.0; 2 * 95];
        assert_eq!(voice.play(&mut buffer), VoicePlayResult::Playing);
        assert_eq!(voice.current_frame(), 5);
        assert_eq!(voice.loops_remaining(), LoopCount::INFINITE_RAW);
    }

    #[test]
    fn test_mono_to_stereo_at_half_volume() {
        let voice = Voice::new(sample(1, 4, 0.8), &stereo())
            .unwrap()
            .with_volume(0.5);
        let mut buffer = vec![0.0; 8];
        voice.play(&mut buffer);
        assert!(buffer.iter().all(|s| (*s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let format = AudioFormat::new(SampleFormat::Float, 48000, 2);
        let input = AudioSample::new(format, vec![1.0, 0.0, 0.5, 0.5]).unwrap();
        let voice = Voice::new(input, &AudioFormat::new(SampleFormat::Float, 48000, 1)).unwrap();
        let mut buffer = vec![0.0; 2];
        voice.play(&mut buffer);
        assert_eq!(buffer, vec![0.5, 0.5]);
    }

    #[test]
    fn test_muted_voice_advances_silently() {
        let voice = Voice::new(sample(2, 100, 1.0), &stereo()).unwrap().with_muted(true);
        let mut buffer = vec![0.25; 2 * 40];
        voice.play(&mut buffer);
        assert_eq!(voice.current_frame(), 40);
        assert!(buffer.iter().all(|s| *s == 0.25));
    }

    #[test]
    fn test_unsupported_channel_combination() {
        let surround = AudioFormat::new(SampleFormat::Float, 48000, 6);
        assert!(Voice::new(sample(1, 10, 0.0), &surround).is_err());
        assert!(Voice::new(sample(6, 10, 0.0), &surround).is_ok());
    }

    #[test]
    fn test_clone_keeps_progress_with_new_id() {
        let voice = Voice::new(sample(1, 100, 0.2), &stereo())
            .unwrap()
            .with_volume(0.3)
            .with_loop_count(LoopCount::Finite(4));
        voice.play(&mut vec![0.0; 2 * 30]);

        let mono = AudioFormat::new(SampleFormat::Float, 48000, 1);
        let clone = voice.clone_for(&mono).unwrap();
        assert_ne!(clone.id(), voice.id());
        assert_eq!(clone.current_frame(), 30);
        assert_eq!(clone.loops_remaining(), 4);
        assert!((clone.volume() - 0.3).abs() < 1e-6);
        assert!(clone.sample().ptr_eq(voice.sample()));
    }

    #[test]
    fn test_zero_loop_count_plays_once() {
        assert_eq!(LoopCount::Finite(0).to_raw(), 1);
        assert_eq!(LoopCount::from_raw(-2), LoopCount::Infinite);
    }
}
