//! Platform backends.
//!
//! A backend enumerates devices and opens real-time sink and source streams.
//! Exactly one native backend is chosen at build time by
//! [`default_backend`]. [`MockBackend`] is a deterministic software backend
//! for tests and headless runs.

#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod mock;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;
pub use mock::MockBackend;

use crate::device::{AudioDevice, DeviceEnumerator, DeviceMode};
use crate::error::Result;
use crate::format::AudioFormat;
use crate::stream::ErrorSlot;
use std::sync::Arc;

/// Real-time render callback. Receives an interleaved buffer in the opened
/// format's channel layout and must fill it without blocking.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Real-time capture callback. Receives interleaved captured samples.
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An open platform stream. Dropping it closes the stream.
pub trait BackendStream: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn format(&self) -> AudioFormat;
}

pub trait AudioBackend: DeviceEnumerator {
    fn name(&self) -> &'static str;

    /// Opens a playback stream that pulls audio from `render`.
    ///
    /// Runtime failures are raised into `errors` instead of being returned.
    fn open_sink(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        render: RenderCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>>;

    /// Opens a capture stream that pushes audio into `capture`.
    fn open_source(
        &self,
        device: &AudioDevice,
        format: &AudioFormat,
        capture: CaptureCallback,
        errors: Arc<ErrorSlot>,
    ) -> Result<Box<dyn BackendStream>>;

    fn default_device(&self, mode: DeviceMode) -> Option<AudioDevice> {
        let devices = self.enumerate(mode).ok()?;
        devices
            .iter()
            .find(|d| d.is_default())
            .or_else(|| devices.first())
            .cloned()
    }
}

/// Returns the native backend for this build.
pub fn default_backend() -> Result<Arc<dyn AudioBackend>> {
    #[cfg(feature = "cpal")]
    {
        let backend = CpalBackend::new();
        log::info!("Using audio backend: {}", backend.name());
        Ok(Arc::new(backend))
    }

    #[cfg(not(feature = "cpal"))]
    {
        Err(crate::error::SonicPortError::Configuration(
            "No native audio backend compiled in; enable the `cpal` feature".into(),
        ))
    }
}
