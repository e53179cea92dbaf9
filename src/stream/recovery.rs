//! Fallback to known-good device and format pairings.

use super::sink::AudioSink;
use super::source::AudioSource;
use super::state::{ErrorState, StreamState};
use crate::device::AudioDevice;
use crate::error::{Result, SonicPortError};
use crate::format::AudioFormat;

#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub device: AudioDevice,
    pub format: AudioFormat,
}

impl Pairing {
    pub fn new(device: AudioDevice, format: AudioFormat) -> Self {
        Self { device, format }
    }
}

/// Remembers which pairings have worked so failures can revert to them.
///
/// Each failure may revert once. A second failure before the next success,
/// or a failure with nothing to revert to, is terminal.
#[derive(Debug, Default)]
pub struct FormatRecovery {
    last_good: Option<Pairing>,
    previous: Option<Pairing>,
    reverted: bool,
}

impl FormatRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, device: &AudioDevice, format: &AudioFormat) {
        let pairing = Pairing::new(device.clone(), *format);
        if self.last_good.as_ref() != Some(&pairing) {
            self.previous = self.last_good.replace(pairing);
        }
        self.reverted = false;
    }

    pub fn last_known_good(&self) -> Option<&Pairing> {
        self.last_good.as_ref()
    }

    /// Pairing to try after `attempted` failed to open.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when a revert already happened or when the only
    /// known-good pairing is the one that just failed.
    pub fn on_open_failure(&mut self, attempted: &Pairing) -> Result<Pairing> {
        if self.reverted {
            return Err(unavailable(attempted));
        }
        let candidate = match &self.last_good {
            Some(good) if good != attempted => good,
            _ => match &self.previous {
                Some(previous) if previous != attempted => previous,
                _ => return Err(unavailable(attempted)),
            },
        };
        let fallback = candidate.clone();
        self.reverted = true;
        log::warn!(
            "Opening {} with {} failed, reverting to {} with {}",
            attempted.device.id(),
            attempted.format,
            fallback.device.id(),
            fallback.format
        );
        Ok(fallback)
    }

    /// Pairing to restore after the current one failed while streaming.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when there is no earlier pairing or a revert
    /// already happened.
    pub fn on_runtime_failure(&mut self) -> Result<Pairing> {
        let failed = self.last_good.clone();
        match (&self.previous, self.reverted) {
            (Some(previous), false) => {
                let fallback = previous.clone();
                self.reverted = true;
                log::warn!(
                    "Stream failed, restoring {} with {}",
                    fallback.device.id(),
                    fallback.format
                );
                Ok(fallback)
            }
            _ => Err(SonicPortError::DeviceUnavailable(match failed {
                Some(pairing) => format!("{} failed and no fallback is left", pairing.device.id()),
                None => "Stream failed before any device worked".to_string(),
            })),
        }
    }
}

fn unavailable(attempted: &Pairing) -> SonicPortError {
    log::error!(
        "No working pairing left for {} with {}",
        attempted.device.id(),
        attempted.format
    );
    SonicPortError::DeviceUnavailable(format!(
        "{} cannot be opened with {}",
        attempted.device.id(),
        attempted.format
    ))
}

/// Opens with `device` and `format`, reverting once on failure.
///
/// # Errors
///
/// `DeviceUnavailable` when both the requested and the fallback pairing fail.
pub fn open_with_fallback<T>(
    recovery: &mut FormatRecovery,
    device: &AudioDevice,
    format: &AudioFormat,
    mut open: impl FnMut(&AudioDevice, &AudioFormat) -> Result<T>,
) -> Result<T> {
    match open(device, format) {
        Ok(opened) => {
            recovery.record_success(device, format);
            Ok(opened)
        }
        Err(e) => {
            log::warn!("Failed to open {}: {}", device.id(), e);
            let fallback = recovery.on_open_failure(&Pairing::new(device.clone(), *format))?;
            match open(&fallback.device, &fallback.format) {
                Ok(opened) => {
                    recovery.record_success(&fallback.device, &fallback.format);
                    Ok(opened)
                }
                Err(e) => Err(SonicPortError::DeviceUnavailable(format!(
                    "Fallback {} failed: {}",
                    fallback.device.id(),
                    e
                ))),
            }
        }
    }
}

/// An endpoint whose runtime failures can be recovered from.
pub trait RecoverableEndpoint {
    /// Folds real-time status in, as [`AudioSink::poll`] does.
    fn poll(&mut self) -> StreamState;
    fn state(&self) -> StreamState;
    fn error(&self) -> ErrorState;
    fn device(&self) -> &AudioDevice;
    fn format(&self) -> AudioFormat;
}

impl RecoverableEndpoint for AudioSink {
    fn poll(&mut self) -> StreamState {
        AudioSink::poll(self)
    }

    fn state(&self) -> StreamState {
        AudioSink::state(self)
    }

    fn error(&self) -> ErrorState {
        AudioSink::error(self)
    }

    fn device(&self) -> &AudioDevice {
        AudioSink::device(self)
    }

    fn format(&self) -> AudioFormat {
        AudioSink::format(self)
    }
}

impl RecoverableEndpoint for AudioSource {
    fn poll(&mut self) -> StreamState {
        AudioSource::poll(self)
    }

    fn state(&self) -> StreamState {
        AudioSource::state(self)
    }

    fn error(&self) -> ErrorState {
        AudioSource::error(self)
    }

    fn device(&self) -> &AudioDevice {
        AudioSource::device(self)
    }

    fn format(&self) -> AudioFormat {
        AudioSource::format(self)
    }
}

/// Opens and starts an endpoint for one pairing.
pub type EndpointOpener<E> = Box<dyn FnMut(&AudioDevice, &AudioFormat) -> Result<E> + Send>;

/// An endpoint that reopens itself on a known-good pairing.
///
/// Opening goes through [`open_with_fallback`]. When [`poll`](Self::poll)
/// sees the running endpoint die with an IO or fatal error, the previous
/// pairing is reopened once. A restored pairing is not recorded as a new
/// success, so a second runtime failure is terminal.
pub struct RecoveringStream<E> {
    recovery: FormatRecovery,
    opener: EndpointOpener<E>,
    endpoint: Option<E>,
}

pub type RecoveringSink = RecoveringStream<AudioSink>;
pub type RecoveringSource = RecoveringStream<AudioSource>;

impl<E: RecoverableEndpoint> RecoveringStream<E> {
    pub fn new(
        opener: impl FnMut(&AudioDevice, &AudioFormat) -> Result<E> + Send + 'static,
    ) -> Self {
        Self {
            recovery: FormatRecovery::new(),
            opener: Box::new(opener),
            endpoint: None,
        }
    }

    /// Starts from pairings that are already known to work.
    pub fn with_recovery(mut self, recovery: FormatRecovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Closes the current endpoint and opens `device` with `format`,
    /// reverting once to the last known-good pairing.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when neither pairing can be opened.
    pub fn open(&mut self, device: &AudioDevice, format: &AudioFormat) -> Result<()> {
        self.endpoint = None;
        let endpoint = open_with_fallback(&mut self.recovery, device, format, &mut self.opener)?;
        self.endpoint = Some(endpoint);
        Ok(())
    }

    pub fn endpoint(&self) -> Option<&E> {
        self.endpoint.as_ref()
    }

    pub fn endpoint_mut(&mut self) -> Option<&mut E> {
        self.endpoint.as_mut()
    }

    pub fn recovery(&self) -> &FormatRecovery {
        &self.recovery
    }

    pub fn close(&mut self) {
        self.endpoint = None;
    }

    /// Polls the endpoint and restores the previous pairing after a runtime
    /// failure.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when there is nothing left to restore or the
    /// restored pairing fails to open. The stream is closed in that case.
    pub fn poll(&mut self) -> Result<StreamState> {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return Ok(StreamState::Stopped);
        };
        let state = endpoint.poll();
        let failed = state == StreamState::Stopped
            && matches!(endpoint.error(), ErrorState::IoError | ErrorState::FatalError);
        if !failed {
            return Ok(state);
        }

        self.endpoint = None;
        let fallback = self.recovery.on_runtime_failure()?;
        let endpoint = (self.opener)(&fallback.device, &fallback.format).map_err(|e| {
            log::error!("Restoring {} failed: {}", fallback.device.id(), e);
            SonicPortError::DeviceUnavailable(format!(
                "Restoring {} with {} failed: {}",
                fallback.device.id(),
                fallback.format,
                e
            ))
        })?;
        log::info!(
            "Stream restored on {} with {}",
            endpoint.device().id(),
            endpoint.format()
        );
        let state = endpoint.state();
        self.endpoint = Some(endpoint);
        Ok(state)
    }
}
