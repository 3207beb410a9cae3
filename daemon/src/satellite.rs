use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::audio::capture::AudioCapture;
use crate::audio::enhance::EnhancementChain;
use crate::audio::playback::PlaybackSink;
use crate::audio::record::RecordingTap;
use crate::audio::AudioFrame;
use crate::config::Config;
use crate::error::SatelliteError;
use crate::protocol::engine;
use crate::vad::{build_detector, GateOutput, VoiceGate};

/// Shared view of the satellite for the control server.
pub struct SatelliteStatus {
    pub connected: AtomicBool,
    pub pipeline_runs: AtomicU64,
    pub recording: AtomicBool,
    session_state: Mutex<String>,
}

impl SatelliteStatus {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            pipeline_runs: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            session_state: Mutex::new("disconnected".to_string()),
        }
    }

    pub fn set_state(&self, state: &str) {
        *self.session_state.lock().unwrap() = state.to_string();
    }

    pub fn state(&self) -> String {
        self.session_state.lock().unwrap().clone()
    }
}

impl Default for SatelliteStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential reconnect backoff, reset after any successful
/// authentication.
struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms.max(1)),
            max: Duration::from_millis(max_ms.max(initial_ms.max(1))),
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self
            .initial
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Checks everything that must be right before the satellite loop is
/// allowed to start. Misconfiguration is reported to the caller, not
/// retried.
pub fn validate(config: &Config) -> Result<(), SatelliteError> {
    build_detector(&config.vad)?;
    EnhancementChain::new(&config.enhancement, config.audio.sample_rate)?;

    match config.remote.start_stage.as_str() {
        "wake_word" | "stt" => {}
        other => {
            return Err(SatelliteError::Config(format!(
                "unknown start_stage '{}' (expected wake_word or stt)",
                other
            )));
        }
    }
    if config.remote.token.is_empty() {
        return Err(SatelliteError::Config(
            "remote.token must be set".to_string(),
        ));
    }
    Ok(())
}

/// The top-level satellite loop: connect, run the protocol engine
/// until the session dies, back off, reconnect, forever, until the
/// shutdown flag flips.
pub async fn run(
    config: Config,
    status: Arc<SatelliteStatus>,
    record_enabled: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        config.satellite.reconnect_initial_ms,
        config.satellite.reconnect_max_ms,
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_connection(&config, &status, &record_enabled, shutdown.clone()).await {
            Ok(()) => break, // shutdown requested
            Err(e) => {
                error!("Session ended: {}", e);
            }
        }

        // A session that authenticated earns a fresh backoff schedule.
        if status.connected.swap(false, Ordering::SeqCst) {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    status.set_state("stopped");
    info!("Satellite stopped");
}

/// One connection cycle. Capture and playback devices are opened for
/// the lifetime of this attempt and released before returning.
async fn run_connection(
    config: &Config,
    status: &Arc<SatelliteStatus>,
    record_enabled: &Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SatelliteError> {
    let (frame_tx, _) = broadcast::channel::<AudioFrame>(config.buffer.broadcast_capacity);
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(&config.audio)?;

    let mut playback = PlaybackSink::new(&config.playback)?;
    playback.start()?;
    let (playback_handle, playback_future) = playback.into_task(config.buffer.playback_queue);
    let playback_task = tokio::spawn(playback_future);

    if config.playback.echo_cancel {
        playback_handle.set_echo_cancellation(true).await;
    }

    // Debug taps are plain extra receivers; they can lag and lose
    // frames but never hold up the capture path.
    let recording = record_enabled.load(Ordering::SeqCst);
    status.recording.store(recording, Ordering::SeqCst);
    let recording_dir = config
        .recording
        .dir
        .as_ref()
        .filter(|_| recording)
        .map(PathBuf::from);
    let mut taps = Vec::new();
    let gated_tap_tx = if let Some(dir) = &recording_dir {
        if config.recording.raw {
            taps.push(RecordingTap::spawn(
                dir,
                "raw",
                config.audio.sample_rate,
                frame_tx.subscribe(),
            ));
        }
        if config.recording.gated {
            let (tap_tx, tap_rx) = broadcast::channel(config.buffer.broadcast_capacity);
            taps.push(RecordingTap::spawn(
                dir,
                "gated",
                crate::audio::enhance::TARGET_RATE,
                tap_rx,
            ));
            Some(tap_tx)
        } else {
            None
        }
    } else {
        None
    };

    // Enhancement state and the gate live exactly one session.
    let chain = EnhancementChain::new(&config.enhancement, config.audio.sample_rate)?;
    let gate = VoiceGate::new(
        build_detector(&config.vad)?,
        config.vad.trigger_level,
        config.vad.buffer_chunks,
    );

    let (gated_tx, gated_rx) = mpsc::channel(config.buffer.broadcast_capacity);
    let (gate_reset_tx, gate_reset_rx) = watch::channel(0u64);
    let conditioning_task = tokio::spawn(condition_loop(
        frame_tx.subscribe(),
        chain,
        gate,
        gated_tx,
        gate_reset_rx,
        gated_tap_tx,
    ));

    // Everything downstream is subscribed; let frames flow.
    capture.start(frame_tx.clone(), fail_tx)?;

    let result = tokio::select! {
        result = engine::run_session(
            config,
            gated_rx,
            playback_handle.clone(),
            gate_reset_tx,
            Arc::clone(status),
            shutdown,
        ) => result,
        Some(device_error) = fail_rx.recv() => Err(SatelliteError::Device(device_error)),
    };

    // Teardown: close every channel so the other activities unblock,
    // then give playback a moment to restore the output path.
    capture.stop();
    conditioning_task.abort();
    drop(playback_handle);
    let playback_abort = playback_task.abort_handle();
    if tokio::time::timeout(Duration::from_secs(2), playback_task)
        .await
        .is_err()
    {
        warn!("Playback task did not stop in time, aborting");
        playback_abort.abort();
    }
    for tap in taps {
        let _ = tokio::time::timeout(Duration::from_secs(2), tap).await;
    }

    result
}

/// The capture-side activity: enhancement and gating between the
/// device callback and the protocol engine. Backpressure from a
/// stalled network path fills the gated queue, which in turn lets the
/// capture broadcast lag and shed its oldest frames; the device
/// callback itself never waits.
async fn condition_loop(
    mut frame_rx: broadcast::Receiver<AudioFrame>,
    mut chain: EnhancementChain,
    mut gate: VoiceGate,
    gated_tx: mpsc::Sender<AudioFrame>,
    mut gate_reset_rx: watch::Receiver<u64>,
    gated_tap_tx: Option<broadcast::Sender<AudioFrame>>,
) {
    loop {
        tokio::select! {
            changed = gate_reset_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                gate.reset();
            }
            received = frame_rx.recv() => match received {
                Ok(frame) => {
                    let frame = chain.process(frame);
                    if frame.pcm.is_empty() {
                        continue;
                    }
                    match gate.push(frame) {
                        GateOutput::Stream(frames) => {
                            for frame in frames {
                                if let Some(tap) = &gated_tap_tx {
                                    let _ = tap.send(frame.clone());
                                }
                                if gated_tx.send(frame).await.is_err() {
                                    debug!("Gated channel closed, stopping conditioning");
                                    return;
                                }
                            }
                        }
                        GateOutput::Hold => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Capture queue full, dropped {} oldest frames", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
