//! Sample representations, audio formats and channel layouts.

pub mod channel;
pub mod convert;

pub use channel::{ChannelConfig, ChannelPosition};

use std::fmt;
use std::time::Duration;

/// Binary encoding of one channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    #[default]
    Unknown,
    UInt8,
    Int16,
    Int32,
    Float,
}

impl SampleFormat {
    /// Every known representation, in probing order.
    pub const ALL: [SampleFormat; 4] = [
        SampleFormat::UInt8,
        SampleFormat::Int16,
        SampleFormat::Int32,
        SampleFormat::Float,
    ];

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::UInt8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float => 4,
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::UInt8 => "UInt8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Float => "Float",
        };
        f.write_str(name)
    }
}

/// A complete description of an interleaved PCM stream.
///
/// When a channel configuration is set, its population always equals the
/// channel count. Bytes per sample depend only on the sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AudioFormat {
    sample_format: SampleFormat,
    sample_rate: u32,
    channel_count: u16,
    channel_config: ChannelConfig,
}

impl AudioFormat {
    pub fn new(sample_format: SampleFormat, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            sample_format,
            sample_rate,
            channel_count,
            channel_config: ChannelConfig::UNKNOWN,
        }
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn channel_config(&self) -> ChannelConfig {
        self.channel_config
    }

    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = sample_format;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Changes the channel count, dropping a configuration that no longer fits.
    pub fn with_channel_count(mut self, channel_count: u16) -> Self {
        self.channel_count = channel_count;
        if self.channel_config.channel_count() != channel_count {
            self.channel_config = ChannelConfig::UNKNOWN;
        }
        self
    }

    /// Sets the speaker layout. A known layout also fixes the channel count.
    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        if !config.is_unknown() {
            self.channel_count = config.channel_count();
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channel_count > 0 && self.sample_format.is_known()
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channel_count as usize
    }

    pub fn frames_for_bytes(&self, bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            bpf => bytes / bpf,
        }
    }

    pub fn bytes_for_frames(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }

    pub fn duration_for_frames(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    pub fn frames_for_duration(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64) as usize
    }

    pub fn bytes_for_duration(&self, duration: Duration) -> usize {
        self.bytes_for_frames(self.frames_for_duration(duration))
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.sample_format, self.sample_rate, self.channel_count
        )?;
        if !self.channel_config.is_unknown() {
            write!(f, " ({})", self.channel_config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(SampleFormat::Unknown.bytes_per_sample(), 0);
        assert_eq!(SampleFormat::UInt8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::Int16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Int32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Float.bytes_per_sample(), 4);
    }

    #[test]
    fn test_frame_conversions() {
        let format = AudioFormat::new(SampleFormat::Int16, 48000, 2);
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.frames_for_bytes(4801), 1200);
        assert_eq!(format.bytes_for_frames(480), 1920);
        assert_eq!(format.frames_for_duration(Duration::from_millis(10)), 480);
        assert_eq!(format.bytes_for_duration(Duration::from_millis(10)), 1920);
        assert_eq!(format.duration_for_frames(48000), Duration::from_secs(1));
    }

    #[test]
    fn test_validity() {
        assert!(AudioFormat::new(SampleFormat::Float, 44100, 1).is_valid());
        assert!(!AudioFormat::new(SampleFormat::Unknown, 44100, 1).is_valid());
        assert!(!AudioFormat::new(SampleFormat::Float, 0, 1).is_valid());
        assert!(!AudioFormat::default().is_valid());
        assert_eq!(AudioFormat::default().frames_for_bytes(100), 0);
    }

    #[test]
    fn test_channel_config_keeps_count_consistent() {
        let format = AudioFormat::new(SampleFormat::Float, 48000, 2)
            .with_channel_config(ChannelConfig::SURROUND_5_1);
        assert_eq!(format.channel_count(), 6);

        let downmixed = format.with_channel_count(2);
        assert!(downmixed.channel_config().is_unknown());

        let same = format.with_channel_count(6);
        assert_eq!(same.channel_config(), ChannelConfig::SURROUND_5_1);
    }

    #[test]
    fn test_display() {
        let format = AudioFormat::new(SampleFormat::Int16, 48000, 2)
            .with_channel_config(ChannelConfig::STEREO);
        assert_eq!(format.to_string(), "Int16 48000Hz 2ch (Stereo)");
    }
}
