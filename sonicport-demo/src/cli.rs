use anyhow::{Context, Result};
use sonicport::{
    AudioBackend, AudioDevices, AudioSample, DeviceMode, EnginePool, LoopCount, MixerDesc,
    MockBackend, SoundEffect, SoundEffectStatus, default_backend,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn mock_backend() -> Arc<MockBackend> {
    Arc::new(
        MockBackend::new()
            .with_outputs(vec![MockBackend::device(
                "mock-out",
                "Mock Speakers",
                DeviceMode::Output,
                true,
            )])
            .with_inputs(vec![MockBackend::device(
                "mock-in",
                "Mock Microphone",
                DeviceMode::Input,
                true,
            )]),
    )
}

/// Drives every open mock sink in 10 ms periods until `running` clears.
fn spawn_mock_clock(backend: Arc<MockBackend>, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Acquire) {
            backend.render_all(480);
            thread::sleep(Duration::from_millis(10));
        }
    })
}

pub fn list_devices(mock: bool) -> Result<()> {
    let backend: Arc<dyn AudioBackend> = if mock {
        mock_backend()
    } else {
        default_backend()?
    };
    log::info!("Backend: {}", backend.name());

    let devices = AudioDevices::new(backend);
    for mode in [DeviceMode::Output, DeviceMode::Input] {
        log::info!("{} devices:", mode);
        for device in devices.devices(mode).iter() {
            log::info!(
                "  {}{} [{}] preferred {}",
                if device.is_default() { "* " } else { "  " },
                device.description(),
                device.id(),
                device.preferred_format()
            );
        }
    }
    Ok(())
}

pub fn play_beep(mock: bool) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let (backend, clock) = if mock {
        let backend = mock_backend();
        let clock = spawn_mock_clock(backend.clone(), running.clone());
        (backend as Arc<dyn AudioBackend>, Some(clock))
    } else {
        (default_backend()?, None)
    };

    let pool = Arc::new(EnginePool::new(backend.clone(), MixerDesc::default())?);
    let devices = Arc::new(AudioDevices::new(backend));
    let mut effect = SoundEffect::new(pool, devices);

    let tone = AudioSample::tone(660.0, 48000, 1, Duration::from_millis(250))?;
    effect.set_source(tone).context("Failed to prepare the beep")?;
    effect.set_loop_count(LoopCount::Finite(4));
    effect.set_volume(0.5);
    effect.play();
    log::info!("Playing beep on {:?}", effect.resolved_audio_device().map(|d| d.description()));

    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        for event in effect.poll() {
            log::info!("Event: {:?}", event);
        }
        if !effect.is_playing() || effect.status() == SoundEffectStatus::Error {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    effect.stop();

    running.store(false, Ordering::Release);
    if let Some(clock) = clock {
        let _ = clock.join();
    }
    log::info!("Beep finished");
    Ok(())
}
