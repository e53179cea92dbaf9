//! Audio device descriptions and their format capabilities.
//!
//! An [`AudioDevice`] is an immutable snapshot produced by a backend probe or
//! by the device monitor. When the hardware set changes the owning registry
//! replaces its devices wholesale; nothing is ever edited in place.

pub mod probe;
pub mod registry;

pub use probe::{ProbeCache, StreamProber, probe_capabilities};
pub use registry::{AudioDevices, DeviceEnumerator};

use crate::format::{AudioFormat, ChannelConfig, SampleFormat};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Channel count used when picking a preferred format.
pub const NOMINAL_CHANNEL_COUNT: u16 = 2;
/// Sample rate used when picking a preferred format.
pub const NOMINAL_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceMode {
    Input,
    Output,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// What a device accepts, as reported or probed from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatCapabilities {
    pub supported_formats: Vec<SampleFormat>,
    pub min_channels: u16,
    pub max_channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub channel_config: ChannelConfig,
}

impl FormatCapabilities {
    /// Capabilities of a device that reports nothing usable.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.supported_formats.is_empty() || self.max_channels == 0 || self.max_sample_rate == 0
    }

    /// Derives the single format a client should try first.
    ///
    /// The nominal channel count and rate are clamped into the supported
    /// ranges. `Int16` wins when supported, otherwise the first listed sample
    /// format, otherwise `Unknown`.
    pub fn preferred_format(&self) -> AudioFormat {
        let channels = bound(self.min_channels, NOMINAL_CHANNEL_COUNT, self.max_channels);
        let rate = bound(self.min_sample_rate, NOMINAL_SAMPLE_RATE, self.max_sample_rate);

        let sample_format = if self.supported_formats.contains(&SampleFormat::Int16) {
            SampleFormat::Int16
        } else {
            self.supported_formats
                .first()
                .copied()
                .unwrap_or(SampleFormat::Unknown)
        };

        let config = if self.channel_config.channel_count() == channels {
            self.channel_config
        } else {
            ChannelConfig::default_for_channel_count(channels)
        };

        AudioFormat::new(sample_format, rate, channels).with_channel_config(config)
    }

    pub fn is_format_supported(&self, format: &AudioFormat) -> bool {
        format.is_valid()
            && self.supported_formats.contains(&format.sample_format())
            && (self.min_channels..=self.max_channels).contains(&format.channel_count())
            && (self.min_sample_rate..=self.max_sample_rate).contains(&format.sample_rate())
    }
}

/// `max(min, min(value, max))`, which favours `min` when the range is inverted.
fn bound<T: Ord>(min: T, value: T, max: T) -> T {
    min.max(value.min(max))
}

/// A capture or playback endpoint.
///
/// Two devices are equal when they share an id and a mode. The default flag
/// and capabilities are deliberately left out so a device stays the same
/// device across capability refreshes.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    id: String,
    description: String,
    mode: DeviceMode,
    is_default: bool,
    capabilities: FormatCapabilities,
    preferred_format: AudioFormat,
    sysfs_path: Option<String>,
}

impl AudioDevice {
    pub fn new(id: impl Into<String>, description: impl Into<String>, mode: DeviceMode) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            mode,
            is_default: false,
            capabilities: FormatCapabilities::empty(),
            preferred_format: AudioFormat::default(),
            sysfs_path: None,
        }
    }

    /// Sets the capabilities and derives the preferred format from them.
    pub fn with_capabilities(mut self, capabilities: FormatCapabilities) -> Self {
        self.preferred_format = capabilities.preferred_format();
        self.capabilities = capabilities;
        self
    }

    /// Overrides the derived preferred format.
    pub fn with_preferred_format(mut self, format: AudioFormat) -> Self {
        self.preferred_format = format;
        self
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_sysfs_path(mut self, path: Option<String>) -> Self {
        self.sysfs_path = path;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn capabilities(&self) -> &FormatCapabilities {
        &self.capabilities
    }

    pub fn supported_sample_formats(&self) -> &[SampleFormat] {
        &self.capabilities.supported_formats
    }

    pub fn minimum_channel_count(&self) -> u16 {
        self.capabilities.min_channels
    }

    pub fn maximum_channel_count(&self) -> u16 {
        self.capabilities.max_channels
    }

    pub fn minimum_sample_rate(&self) -> u32 {
        self.capabilities.min_sample_rate
    }

    pub fn maximum_sample_rate(&self) -> u32 {
        self.capabilities.max_sample_rate
    }

    pub fn channel_config(&self) -> ChannelConfig {
        self.capabilities.channel_config
    }

    pub fn preferred_format(&self) -> AudioFormat {
        self.preferred_format
    }

    pub fn sysfs_path(&self) -> Option<&str> {
        self.sysfs_path.as_deref()
    }

    pub fn is_format_supported(&self, format: &AudioFormat) -> bool {
        self.capabilities.is_format_supported(format)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.mode == other.mode
    }
}

impl Eq for AudioDevice {}

impl Hash for AudioDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.mode.hash(state);
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.description, self.id, self.mode)?;
        if self.is_default {
            f.write_str(" [default]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(formats: &[SampleFormat], channels: (u16, u16), rates: (u32, u32)) -> FormatCapabilities {
        FormatCapabilities {
            supported_formats: formats.to_vec(),
            min_channels: channels.0,
            max_channels: channels.1,
            min_sample_rate: rates.0,
            max_sample_rate: rates.1,
            channel_config: ChannelConfig::UNKNOWN,
        }
    }

    #[test]
    fn test_preferred_channels_clamped_into_range() {
        let preferred = caps(&[SampleFormat::Int16], (1, 2), (8000, 96000)).preferred_format();
        assert_eq!(preferred.channel_count(), 2);

        let mono_only = caps(&[SampleFormat::Int16], (1, 1), (8000, 96000)).preferred_format();
        assert_eq!(mono_only.channel_count(), 1);

        let surround = caps(&[SampleFormat::Int16], (6, 8), (8000, 96000)).preferred_format();
        assert_eq!(surround.channel_count(), 6);
    }

    #[test]
    fn test_preferred_rate_clamped_into_range() {
        let fixed = caps(&[SampleFormat::Int16], (1, 2), (44100, 44100)).preferred_format();
        assert_eq!(fixed.sample_rate(), 44100);

        let wide = caps(&[SampleFormat::Int16], (1, 2), (8000, 192000)).preferred_format();
        assert_eq!(wide.sample_rate(), 48000);

        let high = caps(&[SampleFormat::Int16], (1, 2), (88200, 192000)).preferred_format();
        assert_eq!(high.sample_rate(), 88200);
    }

    #[test]
    fn test_preferred_sample_format_policy() {
        let with_int16 = caps(&[SampleFormat::Float, SampleFormat::Int16], (1, 2), (48000, 48000));
        assert_eq!(with_int16.preferred_format().sample_format(), SampleFormat::Int16);

        let float_first = caps(&[SampleFormat::Float, SampleFormat::Int32], (1, 2), (48000, 48000));
        assert_eq!(float_first.preferred_format().sample_format(), SampleFormat::Float);

        let nothing = caps(&[], (1, 2), (48000, 48000));
        assert_eq!(nothing.preferred_format().sample_format(), SampleFormat::Unknown);
    }

    #[test]
    fn test_preferred_format_carries_matching_layout() {
        let preferred = caps(&[SampleFormat::Int16], (1, 2), (48000, 48000)).preferred_format();
        assert_eq!(preferred.channel_config(), ChannelConfig::STEREO);
    }

    #[test]
    fn test_device_equality_ignores_default_flag() {
        let a = AudioDevice::new("hw:0", "Speakers", DeviceMode::Output).with_default(true);
        let b = AudioDevice::new("hw:0", "Speakers (renamed)", DeviceMode::Output);
        let c = AudioDevice::new("hw:0", "Mic", DeviceMode::Input);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_format_support_check() {
        let device = AudioDevice::new("hw:0", "Speakers", DeviceMode::Output).with_capabilities(
            caps(&[SampleFormat::Int16], (1, 2), (44100, 48000)),
        );
        assert!(device.is_format_supported(&AudioFormat::new(SampleFormat::Int16, 48000, 2)));
        assert!(!device.is_format_supported(&AudioFormat::new(SampleFormat::Float, 48000, 2)));
        assert!(!device.is_format_supported(&AudioFormat::new(SampleFormat::Int16, 96000, 2)));
        assert!(!device.is_format_supported(&AudioFormat::new(SampleFormat::Int16, 48000, 6)));
    }
}
