//! Capability probing by trial stream construction.
//!
//! Some platforms cannot describe what a device accepts. For those, every
//! candidate combination is tried by constructing a throwaway stream. A
//! rejected combination is a negative answer, not an error. Probing is slow
//! and has side effects, so results are memoized per device and mode.

use super::{DeviceMode, FormatCapabilities};
use crate::format::{AudioFormat, ChannelConfig, SampleFormat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Rates tried during probing.
pub const PROBE_SAMPLE_RATES: [u32; 11] = [
    8000, 11025, 16000, 22050, 24000, 32000, 44100, 48000, 88200, 96000, 192000,
];

/// Highest channel count tried during probing.
pub const PROBE_MAX_CHANNELS: u16 = 8;

/// Platform hook that tries to construct a stream.
pub trait StreamProber: Send + Sync {
    /// Returns whether a stream with `format` could be constructed.
    ///
    /// Implementations release the trial stream before returning.
    fn try_open(&self, device_id: &str, mode: DeviceMode, format: &AudioFormat) -> bool;
}

/// Determines capabilities by trying every candidate combination.
pub fn probe_capabilities(
    prober: &dyn StreamProber,
    device_id: &str,
    mode: DeviceMode,
) -> FormatCapabilities {
    let mut formats = Vec::new();
    let mut channels: Option<(u16, u16)> = None;
    let mut rates: Option<(u32, u32)> = None;

    for sample_format in SampleFormat::ALL {
        let mut accepted = false;
        for rate in PROBE_SAMPLE_RATES {
            for channel_count in 1..=PROBE_MAX_CHANNELS {
                let format = AudioFormat::new(sample_format, rate, channel_count);
                if !prober.try_open(device_id, mode, &format) {
                    continue;
                }
                accepted = true;
                channels = Some(match channels {
                    Some((lo, hi)) => (lo.min(channel_count), hi.max(channel_count)),
                    None => (channel_count, channel_count),
                });
                rates = Some(match rates {
                    Some((lo, hi)) => (lo.min(rate), hi.max(rate)),
                    None => (rate, rate),
                });
            }
        }
        if accepted {
            formats.push(sample_format);
        }
    }

    let (Some((min_channels, max_channels)), Some((min_sample_rate, max_sample_rate))) =
        (channels, rates)
    else {
        log::debug!("Probe found no usable format for {} {}", mode, device_id);
        return FormatCapabilities::empty();
    };

    log::debug!(
        "Probed {} {}: {:?}, {}-{} channels, {}-{} Hz",
        mode,
        device_id,
        formats,
        min_channels,
        max_channels,
        min_sample_rate,
        max_sample_rate
    );

    FormatCapabilities {
        supported_formats: formats,
        min_channels,
        max_channels,
        min_sample_rate,
        max_sample_rate,
        channel_config: ChannelConfig::default_for_channel_count(max_channels),
    }
}

/// Memoized probe results, one entry per device and mode.
#[derive(Default)]
pub struct ProbeCache {
    entries: Mutex<HashMap<(String, DeviceMode), Arc<FormatCapabilities>>>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns cached capabilities, probing at most once per key.
    ///
    /// The cache lock is held while probing so concurrent callers for the
    /// same device wait instead of probing twice.
    pub fn get_or_probe(
        &self,
        prober: &dyn StreamProber,
        device_id: &str,
        mode: DeviceMode,
    ) -> Arc<FormatCapabilities> {
        let mut entries = self.entries.lock();
        entries
            .entry((device_id.to_string(), mode))
            .or_insert_with(|| Arc::new(probe_capabilities(prober, device_id, mode)))
            .clone()
    }

    pub fn invalidate(&self, device_id: &str, mode: DeviceMode) {
        self.entries.lock().remove(&(device_id.to_string(), mode));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
