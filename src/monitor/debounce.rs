//! Trailing-edge debounce timer.

use crate::error::Result;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum DebounceMessage {
    Kick,
    Shutdown,
}

/// Cloneable handle that restarts the timer. Usable from any thread.
#[derive(Clone)]
pub struct DebounceHandle {
    sender: Sender<DebounceMessage>,
}

impl DebounceHandle {
    pub fn kick(&self) {
        let _ = self.sender.send(DebounceMessage::Kick);
    }
}

/// Runs `fire` on a worker thread once no kick has arrived for `delay`.
///
/// Every kick restarts the window, so a steady stream of kicks postpones the
/// callback until the stream stops.
pub struct Debouncer {
    handle: DebounceHandle,
    worker: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn spawn(
        name: &str,
        delay: Duration,
        fire: impl Fn() + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(DebounceMessage::Kick) = receiver.recv() {
                    loop {
                        match receiver.recv_timeout(delay) {
                            Ok(DebounceMessage::Kick) => continue,
                            Ok(DebounceMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                                return;
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                log::debug!("Debounce window elapsed");
                                fire();
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            handle: DebounceHandle { sender },
            worker: Some(worker),
        })
    }

    pub fn kick(&self) {
        self.handle.kick();
    }

    pub fn handle(&self) -> DebounceHandle {
        self.handle.clone()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(DebounceMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
