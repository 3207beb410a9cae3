use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::audio::AudioFrame;

/// Side-tap that persists frames to a WAV file for debugging.
///
/// A tap is just one more broadcast receiver: it can lag and lose
/// frames under load, but it can never block or slow the capture path.
/// One file per session, named by start time.
pub struct RecordingTap;

impl RecordingTap {
    pub fn spawn(
        dir: &Path,
        prefix: &str,
        sample_rate: u32,
        mut rx: broadcast::Receiver<AudioFrame>,
    ) -> JoinHandle<()> {
        let path = wav_path(dir, prefix);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            if let Err(e) = std::fs::create_dir_all(path.parent().unwrap_or(Path::new("."))) {
                error!("Cannot create recording directory: {}", e);
                return;
            }

            let spec = hound::WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer = match hound::WavWriter::create(&path, spec) {
                Ok(writer) => writer,
                Err(e) => {
                    error!("Cannot create recording {}: {}", path.display(), e);
                    return;
                }
            };
            debug!("Recording {} frames to {}", prefix, path.display());

            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        for sample in &frame.pcm {
                            if let Err(e) = writer.write_sample(*sample) {
                                warn!("Error writing to {}: {}", path.display(), e);
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Recording tap lagged, lost {} frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            if let Err(e) = writer.finalize() {
                warn!("Error finalizing {}: {}", path.display(), e);
            } else {
                debug!("Recording saved to {}", path.display());
            }
        })
    }
}

fn wav_path(dir: &Path, prefix: &str) -> PathBuf {
    let ts = Utc::now().format("%y%m%d-%H%M%S").to_string();
    dir.join(format!("{}_{}.wav", prefix, ts))
}
