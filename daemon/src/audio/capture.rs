use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

use crate::audio::AudioFrame;
use crate::config::AudioConfig;
use crate::error::DeviceError;

pub struct AudioCapture {
    device: Device,
    stream: Option<Box<Stream>>,
    is_running: Arc<Mutex<bool>>,
    sample_rate: u32,
    channels: u16,
    samples_per_chunk: usize,
}

/// Accumulates device buffers of arbitrary size and emits exact
/// fixed-size frames. Publishing is a non-blocking broadcast send; a
/// full channel drops the oldest frames on the receiver side, never
/// stalling the audio callback.
struct FrameChunker {
    pending: Vec<i16>,
    samples_per_chunk: usize,
    frame_tx: broadcast::Sender<AudioFrame>,
}

impl FrameChunker {
    fn new(samples_per_chunk: usize, frame_tx: broadcast::Sender<AudioFrame>) -> Self {
        Self {
            pending: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            frame_tx,
        }
    }

    fn push(&mut self, samples: &[i16]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.samples_per_chunk {
            let rest = self.pending.split_off(self.samples_per_chunk);
            let pcm = std::mem::replace(&mut self.pending, rest);
            // No receivers is fine; the session may still be wiring up.
            let _ = self.frame_tx.send(AudioFrame::new(pcm));
        }
    }
}

impl AudioCapture {
    pub fn new(config: &AudioConfig) -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let device = if config.device == "default" {
            host.default_input_device()
                .ok_or_else(|| DeviceError::Unavailable("no default input device".to_string()))?
        } else {
            host.input_devices()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == config.device).unwrap_or(false))
                .ok_or_else(|| {
                    DeviceError::Unavailable(format!("input device '{}' not found", config.device))
                })?
        };

        tracing::info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        Ok(Self {
            device,
            stream: None,
            is_running: Arc::new(Mutex::new(false)),
            sample_rate: config.sample_rate,
            channels: config.channels,
            samples_per_chunk: config.samples_per_chunk,
        })
    }

    pub fn start(
        &mut self,
        frame_tx: broadcast::Sender<AudioFrame>,
        fail_tx: mpsc::UnboundedSender<DeviceError>,
    ) -> Result<(), DeviceError> {
        *self.is_running.lock().unwrap() = true;

        tracing::info!(
            "Configuring audio stream: {}Hz, {} channel(s), {} samples/chunk",
            self.sample_rate,
            self.channels,
            self.samples_per_chunk
        );

        let supported_configs = self
            .device
            .supported_input_configs()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        let mut config: Option<StreamConfig> = None;

        for supported in supported_configs {
            tracing::debug!("Supported config: {:?}", supported);
            if supported.channels() == self.channels
                && supported.min_sample_rate().0 <= self.sample_rate
                && supported.max_sample_rate().0 >= self.sample_rate
            {
                config = Some(
                    supported
                        .with_sample_rate(cpal::SampleRate(self.sample_rate))
                        .into(),
                );
                break;
            }
        }

        let final_config = config.ok_or_else(|| {
            DeviceError::Unavailable("no suitable audio configuration found".to_string())
        })?;

        let chunker = Arc::new(Mutex::new(FrameChunker::new(
            self.samples_per_chunk,
            frame_tx,
        )));
        let is_running = Arc::clone(&self.is_running);

        let error_callback = move |err: cpal::StreamError| {
            tracing::error!("Audio stream error: {}", err);
            let _ = fail_tx.send(DeviceError::ReadError(err.to_string()));
        };

        let sample_format = self
            .device
            .default_input_config()
            .map(|c| c.sample_format())
            .unwrap_or(SampleFormat::I16);

        let stream: Box<Stream> = match sample_format {
            SampleFormat::I16 => {
                let chunker = Arc::clone(&chunker);
                let stream = self
                    .device
                    .build_input_stream(
                        &final_config,
                        move |data: &[i16], _: &_| {
                            Self::process_audio_chunk(data, &chunker, &is_running);
                        },
                        error_callback,
                        None,
                    )
                    .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
                Box::new(stream)
            }
            SampleFormat::F32 => {
                let chunker = Arc::clone(&chunker);
                let stream = self
                    .device
                    .build_input_stream(
                        &final_config,
                        move |data: &[f32], _: &_| {
                            let converted: Vec<i16> = data
                                .iter()
                                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                                .collect();
                            Self::process_audio_chunk(&converted, &chunker, &is_running);
                        },
                        error_callback,
                        None,
                    )
                    .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
                Box::new(stream)
            }
            SampleFormat::U16 => {
                let chunker = Arc::clone(&chunker);
                let stream = self
                    .device
                    .build_input_stream(
                        &final_config,
                        move |data: &[u16], _: &_| {
                            let converted: Vec<i16> = data
                                .iter()
                                .map(|&s| (s as i32 - (i16::MAX as i32 + 1)) as i16)
                                .collect();
                            Self::process_audio_chunk(&converted, &chunker, &is_running);
                        },
                        error_callback,
                        None,
                    )
                    .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
                Box::new(stream)
            }
            format => {
                return Err(DeviceError::Unavailable(format!(
                    "unsupported sample format: {:?}",
                    format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::info!("Audio capture started");
        Ok(())
    }

    fn process_audio_chunk(
        data: &[i16],
        chunker: &Arc<Mutex<FrameChunker>>,
        is_running: &Arc<Mutex<bool>>,
    ) {
        if !is_running.try_lock().map(|g| *g).unwrap_or(false) {
            return;
        }
        if let Ok(mut chunker) = chunker.try_lock() {
            chunker.push(data);
        }
    }

    pub fn stop(&mut self) {
        *self.is_running.lock().unwrap() = false;
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        tracing::info!("Audio capture stopped");
    }
}

unsafe impl Send for AudioCapture {}
