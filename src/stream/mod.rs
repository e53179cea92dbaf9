//! Sinks and sources over backend streams.
//!
//! Both endpoints run in one of three modes:
//! - callback: the device thread calls straight into client code with `f32`
//!   frames;
//! - push: the client writes raw bytes into a ring buffer the device drains;
//! - pull: a feeder thread moves bytes between a client callback and the ring
//!   every `poll_interval`.
//!
//! Real-time code never reports errors directly. It raises them into an
//! [`ErrorSlot`] which `poll()` folds into the [`StreamStateMachine`].

pub mod recovery;
pub mod sink;
pub mod source;
pub mod state;

pub use recovery::{
    EndpointOpener, FormatRecovery, Pairing, RecoverableEndpoint, RecoveringSink, RecoveringSource,
    RecoveringStream, open_with_fallback,
};
pub use sink::{AudioSink, PullReader, SinkWriter};
pub use source::{AudioSource, PushWriter, SourceReader};
pub use state::{ErrorSlot, ErrorState, StreamState, StreamStateMachine};

use crate::config::StreamDesc;
use crate::error::Result;
use crate::format::AudioFormat;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// State shared between an endpoint and its real-time callback.
#[derive(Debug)]
struct StreamShared {
    errors: Arc<ErrorSlot>,
    volume: AtomicU32,
    idle: AtomicBool,
    running: AtomicBool,
    processed_frames: AtomicU64,
}

impl StreamShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            errors: Arc::new(ErrorSlot::new()),
            volume: AtomicU32::new(1.0f32.to_bits()),
            idle: AtomicBool::new(false),
            running: AtomicBool::new(false),
            processed_frames: AtomicU64::new(0),
        })
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn add_frames(&self, frames: usize) {
        self.processed_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// Ring buffer size in bytes: `buffer_duration` worth of whole frames, but
/// never less than one block.
fn ring_capacity(format: &AudioFormat, desc: &StreamDesc) -> usize {
    let frames = format
        .frames_for_duration(desc.buffer_duration)
        .max(desc.block_frames)
        .max(1);
    format.bytes_for_frames(frames).max(1)
}

fn whole_frames(bytes: usize, bytes_per_frame: usize) -> usize {
    if bytes_per_frame == 0 {
        0
    } else {
        bytes - bytes % bytes_per_frame
    }
}

/// Periodic worker used by pull-mode sinks and push-mode sources.
struct Feeder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Feeder {
    fn spawn(
        name: &str,
        interval: std::time::Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    tick();
                    thread::sleep(interval);
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
