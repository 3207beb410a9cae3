use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::duck::{DuckingState, OutputPathControl};
use crate::config::PlaybackConfig;
use crate::error::DeviceError;

/// Work items for the playback task. Each command appends to the
/// output queue as one unit, so a notification sound serializes with a
/// TTS stream instead of interleaving inside a chunk.
#[derive(Debug)]
pub enum PlaybackCommand {
    TtsChunk(Bytes),
    TtsEnd,
    Awake,
    Done,
    SetEchoCancellation(bool),
}

/// Cloneable control surface handed to the protocol engine.
#[derive(Clone)]
pub struct PlaybackHandle {
    cmd_tx: mpsc::Sender<PlaybackCommand>,
    duck_tx: Arc<watch::Sender<DuckingState>>,
    ducking_volume: f32,
}

impl PlaybackHandle {
    pub async fn tts_chunk(&self, bytes: Bytes) {
        if self.cmd_tx.send(PlaybackCommand::TtsChunk(bytes)).await.is_err() {
            warn!("Playback task gone, dropping TTS chunk");
        }
    }

    pub async fn tts_end(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::TtsEnd).await;
    }

    pub async fn notify_awake(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Awake).await;
    }

    pub async fn notify_done(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Done).await;
    }

    /// Atomic publish of the latest desired ducking state; the
    /// playback task is the only reader.
    pub fn set_ducking(&self, active: bool) {
        let state = if active {
            DuckingState {
                active: true,
                target_volume: self.ducking_volume,
            }
        } else {
            DuckingState::inactive()
        };
        let _ = self.duck_tx.send(state);
    }

    pub async fn set_echo_cancellation(&self, enable: bool) {
        let _ = self
            .cmd_tx
            .send(PlaybackCommand::SetEchoCancellation(enable))
            .await;
    }
}

/// Writes synthesized audio and notification sounds to the output
/// device. The cpal callback drains a shared sample queue, padding
/// with silence when it runs dry.
pub struct PlaybackSink {
    device: Device,
    stream: Option<Box<Stream>>,
    queue: Arc<Mutex<VecDeque<i16>>>,
    volume_bits: Arc<AtomicU32>,
    sample_rate: u32,
    awake_sound: Option<Vec<i16>>,
    done_sound: Option<Vec<i16>>,
    ducking_volume: f32,
}

/// Upper bound on buffered output audio; a stream longer than this is
/// trimmed rather than allowed to grow without bound.
const MAX_QUEUE_SECONDS: usize = 60;

impl PlaybackSink {
    pub fn new(config: &PlaybackConfig) -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let device = if config.device == "default" {
            host.default_output_device()
                .ok_or_else(|| DeviceError::Unavailable("no default output device".to_string()))?
        } else {
            host.output_devices()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == config.device).unwrap_or(false))
                .ok_or_else(|| {
                    DeviceError::Unavailable(format!("output device '{}' not found", config.device))
                })?
        };

        debug!(
            "Playback device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let awake_sound = config
            .awake_sound
            .as_deref()
            .and_then(|path| load_wav(path, config.sample_rate));
        let done_sound = config
            .done_sound
            .as_deref()
            .and_then(|path| load_wav(path, config.sample_rate));

        Ok(Self {
            device,
            stream: None,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            volume_bits: Arc::new(AtomicU32::new(config.volume.to_bits())),
            sample_rate: config.sample_rate,
            awake_sound,
            done_sound,
            ducking_volume: config.ducking_volume,
        })
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        let supported = self
            .device
            .supported_output_configs()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(self.sample_rate)
                    && c.max_sample_rate() >= SampleRate(self.sample_rate)
            })
            .or_else(|| {
                // Fallback: stereo, both channels fed the same sample.
                self.device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(self.sample_rate)
                        && c.max_sample_rate() >= SampleRate(self.sample_rate)
                })
            })
            .ok_or_else(|| {
                DeviceError::Unavailable("no suitable output configuration found".to_string())
            })?;

        let config: StreamConfig = supported.with_sample_rate(SampleRate(self.sample_rate)).into();
        let channels = config.channels as usize;
        let queue = Arc::clone(&self.queue);
        let volume_bits = Arc::clone(&self.volume_bits);

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let volume = f32::from_bits(volume_bits.load(Ordering::Relaxed));
                    let mut queue = queue.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let sample = queue
                            .pop_front()
                            .map(|s| s as f32 / i16::MAX as f32 * volume)
                            .unwrap_or(0.0);
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        self.stream = Some(Box::new(stream));

        info!("Audio playback started ({}Hz)", self.sample_rate);
        Ok(())
    }

    /// Splits off the control handle and returns the command loop
    /// future. The loop ends when every handle is dropped; teardown
    /// releases ducking and the echo-cancel module.
    pub fn into_task(
        self,
        queue_depth: usize,
    ) -> (PlaybackHandle, impl std::future::Future<Output = ()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(queue_depth.max(1));
        let (duck_tx, duck_rx) = watch::channel(DuckingState::inactive());

        let handle = PlaybackHandle {
            cmd_tx,
            duck_tx: Arc::new(duck_tx),
            ducking_volume: self.ducking_volume,
        };

        (handle, self.run(cmd_rx, duck_rx))
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<PlaybackCommand>,
        mut duck_rx: watch::Receiver<DuckingState>,
    ) {
        let mut output_path = OutputPathControl::new();

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command, &mut output_path).await;
                }
                changed = duck_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *duck_rx.borrow_and_update();
                    if let Err(e) = output_path.set_ducking(state).await {
                        // Degraded: keep playing without ducking.
                        warn!("Failed to apply ducking: {}", e);
                    }
                }
            }
        }

        output_path.release().await;
        debug!("Playback task finished");
    }

    async fn handle_command(&self, command: PlaybackCommand, output_path: &mut OutputPathControl) {
        match command {
            PlaybackCommand::TtsChunk(bytes) => {
                self.enqueue(decode_s16le(&bytes));
            }
            PlaybackCommand::TtsEnd => {
                debug!("TTS stream finished");
            }
            PlaybackCommand::Awake => {
                if let Some(sound) = &self.awake_sound {
                    self.enqueue(sound.clone());
                }
            }
            PlaybackCommand::Done => {
                if let Some(sound) = &self.done_sound {
                    self.enqueue(sound.clone());
                }
            }
            PlaybackCommand::SetEchoCancellation(enable) => {
                if let Err(e) = output_path.set_echo_cancellation(enable).await {
                    warn!("Failed to toggle echo cancellation: {}", e);
                }
            }
        }
    }

    /// One append per command, under a single lock acquisition, so
    /// concurrent sources can never interleave inside a chunk.
    fn enqueue(&self, samples: Vec<i16>) {
        let max_samples = MAX_QUEUE_SECONDS * self.sample_rate as usize;
        let mut queue = self.queue.lock().unwrap();
        if queue.len() + samples.len() > max_samples {
            warn!("Playback queue full, dropping {} samples", samples.len());
            return;
        }
        queue.extend(samples);
    }
}

unsafe impl Send for PlaybackSink {}

fn decode_s16le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn load_wav(path: &str, expected_rate: u32) -> Option<Vec<i16>> {
    let reader = match hound::WavReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Failed to load sound {}: {}", path, e);
            return None;
        }
    };

    let spec = reader.spec();
    if spec.sample_rate != expected_rate {
        warn!(
            "Sound {} is {}Hz, playback runs at {}Hz; it will play off-speed",
            path, spec.sample_rate, expected_rate
        );
    }

    let samples: Result<Vec<i16>, _> = reader.into_samples::<i16>().collect();
    match samples {
        Ok(samples) => {
            debug!("Loaded sound {} ({} samples)", path, samples.len());
            Some(samples)
        }
        Err(e) => {
            warn!("Failed to decode sound {}: {}", path, e);
            None
        }
    }
}
