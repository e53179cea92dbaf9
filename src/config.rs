//! Configuration for SonicPort

use std::time::Duration;

/// Settings for the asynchronous device monitor.
#[derive(Debug, Clone)]
pub struct MonitorDesc {
    /// Delay used to coalesce bursts of registry events into one publish.
    pub compression_delay: Duration,
    /// Sleep between `sync()` pumps in the blocking device-list query.
    pub sync_poll_interval: Duration,
}

impl Default for MonitorDesc {
    fn default() -> Self {
        Self {
            compression_delay: Duration::from_millis(50),
            sync_poll_interval: Duration::from_millis(1),
        }
    }
}

impl MonitorDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression_delay(mut self, delay: Duration) -> Self {
        self.compression_delay = delay;
        self
    }

    pub fn sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = interval;
        self
    }
}

/// Settings for the voice mixing engines.
#[derive(Debug, Clone)]
pub struct MixerDesc {
    pub max_voices: usize,
    /// Depth of the bounded command queue feeding the render thread.
    pub command_capacity: usize,
    /// How long an engine with no owner is kept alive for reuse.
    pub engine_release_delay: Duration,
    pub block_frames: usize,
}

impl Default for MixerDesc {
    fn default() -> Self {
        Self {
            max_voices: 64,
            command_capacity: 256,
            engine_release_delay: Duration::from_secs(1),
            block_frames: 512,
        }
    }
}

impl MixerDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_voices(mut self, max: usize) -> Self {
        self.max_voices = max;
        self
    }

    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity;
        self
    }

    pub fn engine_release_delay(mut self, delay: Duration) -> Self {
        self.engine_release_delay = delay;
        self
    }

    pub fn block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames;
        self
    }
}

/// Settings for push/pull sinks and sources.
#[derive(Debug, Clone)]
pub struct StreamDesc {
    /// Capacity of the byte ring buffer between the client and the device.
    pub buffer_duration: Duration,
    /// Period of the feeder thread in pull mode.
    pub poll_interval: Duration,
    pub block_frames: usize,
}

impl Default for StreamDesc {
    fn default() -> Self {
        Self {
            buffer_duration: Duration::from_millis(250),
            poll_interval: Duration::from_millis(10),
            block_frames: 512,
        }
    }
}

impl StreamDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_duration(mut self, duration: Duration) -> Self {
        self.buffer_duration = duration;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames;
        self
    }
}

/// Aggregate configuration for a whole SonicPort setup.
#[derive(Debug, Clone, Default)]
pub struct SonicPortDesc {
    pub monitor: MonitorDesc,
    pub mixer: MixerDesc,
    pub stream: StreamDesc,
}

impl SonicPortDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor(mut self, desc: MonitorDesc) -> Self {
        self.monitor = desc;
        self
    }

    pub fn mixer(mut self, desc: MixerDesc) -> Self {
        self.mixer = desc;
        self
    }

    pub fn stream(mut self, desc: StreamDesc) -> Self {
        self.stream = desc;
        self
    }
}
