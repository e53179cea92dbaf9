//! Asynchronous format resolution for registry nodes.

use super::ObjectId;
use super::node_format::{NodeAudioFormat, NodeFormatPayload};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The registry side of format resolution.
///
/// `enumerate_formats` runs on whichever thread delivered the registry
/// event to [`DeviceMonitor::handle_event`](super::DeviceMonitor::handle_event),
/// usually the registry's own event loop. `sync` runs on the thread blocked
/// in [`DeviceMonitor::device_lists`](super::DeviceMonitor::device_lists).
/// Implementations must therefore tolerate calls from both. The promise may
/// be fulfilled from any thread.
pub trait FormatRequester: Send + Sync {
    /// Starts a format enumeration for `node_id`.
    ///
    /// Every answer is pushed into `promise`. The promise is finished, or
    /// dropped, once the registry's done barrier for the request arrives.
    fn enumerate_formats(&self, node_id: ObjectId, promise: FormatPromise);

    /// Pumps the registry so outstanding requests make progress.
    fn sync(&self);
}

#[derive(Default)]
struct FormatSlot {
    formats: Mutex<Vec<NodeAudioFormat>>,
    finished: AtomicBool,
}

type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Write half of a pending format request.
pub struct FormatPromise {
    slot: Arc<FormatSlot>,
    on_ready: Option<ReadyCallback>,
}

impl FormatPromise {
    /// Records one answer. Malformed payloads are ignored.
    pub fn push(&self, payload: &NodeFormatPayload) {
        match NodeAudioFormat::parse(payload) {
            Some(format) => self.slot.formats.lock().push(format),
            None => log::debug!("Ignoring unusable node format: {:?}", payload),
        }
    }

    /// Completes the request. Called for the done barrier.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if let Some(on_ready) = self.on_ready.take() {
            self.slot.finished.store(true, Ordering::Release);
            on_ready();
        }
    }
}

impl Drop for FormatPromise {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Read half of a pending format request.
#[derive(Clone)]
pub struct FormatFuture {
    slot: Arc<FormatSlot>,
}

impl FormatFuture {
    pub fn is_finished(&self) -> bool {
        self.slot.finished.load(Ordering::Acquire)
    }

    /// The usable format, once finished.
    ///
    /// `None` both while pending and when the node offered nothing usable.
    pub fn resolve(&self) -> Option<NodeAudioFormat> {
        if !self.is_finished() {
            return None;
        }
        NodeAudioFormat::select(&self.slot.formats.lock())
    }
}

impl std::fmt::Debug for FormatFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatFuture")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Creates a connected promise/future pair.
///
/// `on_ready` runs once, on whichever thread completes the promise.
pub fn format_channel(on_ready: impl FnOnce() + Send + 'static) -> (FormatPromise, FormatFuture) {
    let slot = Arc::new(FormatSlot::default());
    (
        FormatPromise {
            slot: slot.clone(),
            on_ready: Some(Box::new(on_ready)),
        },
        FormatFuture { slot },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_future_resolves_after_done_barrier() {
        let (promise, future) = format_channel(|| {});
        promise.push(&NodeFormatPayload::raw("S16LE", 48000, 2));
        assert!(!future.is_finished());
        assert_eq!(future.resolve(), None);

        promise.finish();
        assert!(future.is_finished());
        assert!(future.resolve().is_some());
    }

    #[test]
    fn test_dropped_promise_finishes_without_format() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (promise, future) = format_channel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(promise);
        assert!(future.is_finished());
        assert_eq!(future.resolve(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_promise_completes_across_threads() {
        let (promise, future) = format_channel(|| {});
        std::thread::spawn(move || {
            promise.push(&NodeFormatPayload::raw("F32LE", 44100, 1));
            promise.finish();
        })
        .join()
        .unwrap();

        let format = future.resolve().unwrap().to_audio_format();
        assert_eq!(format.sample_rate(), 44100);
    }
}
