use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Desired state of the output path's ducking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuckingState {
    pub active: bool,
    pub target_volume: f32,
}

impl DuckingState {
    pub fn inactive() -> Self {
        Self {
            active: false,
            target_volume: 1.0,
        }
    }
}

/// Controls the PulseAudio output path: lowers other playback streams
/// while the user is speaking and loads/unloads the echo-cancel
/// module. Every operation is idempotent and best-effort; a missing
/// `pactl` just means the satellite runs without these enhancements.
pub struct OutputPathControl {
    /// sink-input index -> volume percent before ducking
    saved_volumes: HashMap<u32, u32>,
    echo_module: Option<u32>,
    ducked: bool,
    own_app_name: String,
}

impl OutputPathControl {
    pub fn new() -> Self {
        Self {
            saved_volumes: HashMap::new(),
            echo_module: None,
            ducked: false,
            own_app_name: "farfieldd".to_string(),
        }
    }

    pub async fn set_ducking(&mut self, state: DuckingState) -> Result<()> {
        if state.active == self.ducked {
            return Ok(());
        }

        if state.active {
            let target_pct = (state.target_volume.clamp(0.0, 1.0) * 100.0) as u32;
            let inputs = self.list_sink_inputs().await?;

            for input in inputs {
                if input.app_name.as_deref() == Some(self.own_app_name.as_str()) {
                    continue;
                }
                // Don't overwrite an already-saved volume.
                self.saved_volumes
                    .entry(input.index)
                    .or_insert(input.volume_pct);
                self.set_sink_input_volume(input.index, target_pct).await?;
            }
            info!("Ducked {} output stream(s)", self.saved_volumes.len());
        } else {
            for (index, volume_pct) in std::mem::take(&mut self.saved_volumes) {
                if let Err(e) = self.set_sink_input_volume(index, volume_pct).await {
                    warn!("Failed to restore volume of sink input {}: {}", index, e);
                }
            }
            debug!("Ducking released");
        }

        self.ducked = state.active;
        Ok(())
    }

    pub async fn set_echo_cancellation(&mut self, enable: bool) -> Result<()> {
        if enable == self.echo_module.is_some() {
            return Ok(());
        }

        if enable {
            let output = Command::new("pactl")
                .args(["load-module", "module-echo-cancel"])
                .output()
                .await
                .context("running pactl load-module")?;
            if !output.status.success() {
                anyhow::bail!(
                    "pactl load-module failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            let index: u32 = String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .context("parsing module index")?;
            self.echo_module = Some(index);
            info!("Echo cancellation enabled (module {})", index);
        } else if let Some(index) = self.echo_module.take() {
            let status = Command::new("pactl")
                .args(["unload-module", &index.to_string()])
                .status()
                .await
                .context("running pactl unload-module")?;
            if !status.success() {
                anyhow::bail!("pactl unload-module {} failed", index);
            }
            info!("Echo cancellation disabled");
        }

        Ok(())
    }

    /// Restores everything on teardown.
    pub async fn release(&mut self) {
        if self.ducked {
            if let Err(e) = self.set_ducking(DuckingState::inactive()).await {
                warn!("Failed to release ducking: {}", e);
            }
        }
        if self.echo_module.is_some() {
            if let Err(e) = self.set_echo_cancellation(false).await {
                warn!("Failed to unload echo cancellation: {}", e);
            }
        }
    }

    async fn set_sink_input_volume(&self, index: u32, volume_pct: u32) -> Result<()> {
        let status = Command::new("pactl")
            .args([
                "set-sink-input-volume",
                &index.to_string(),
                &format!("{}%", volume_pct),
            ])
            .status()
            .await
            .context("running pactl set-sink-input-volume")?;
        if !status.success() {
            anyhow::bail!("pactl set-sink-input-volume {} failed", index);
        }
        Ok(())
    }

    async fn list_sink_inputs(&self) -> Result<Vec<SinkInput>> {
        let output = Command::new("pactl")
            .args(["list", "sink-inputs"])
            .output()
            .await
            .context("running pactl list sink-inputs")?;
        if !output.status.success() {
            anyhow::bail!(
                "pactl list sink-inputs failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(parse_sink_inputs(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Default for OutputPathControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq)]
struct SinkInput {
    index: u32,
    volume_pct: u32,
    app_name: Option<String>,
}

fn parse_sink_inputs(output: &str) -> Vec<SinkInput> {
    let mut inputs = Vec::new();
    let mut current: Option<SinkInput> = None;

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("Sink Input #") {
            if let Some(done) = current.take() {
                inputs.push(done);
            }
            if let Ok(index) = rest.parse() {
                current = Some(SinkInput {
                    index,
                    volume_pct: 100,
                    app_name: None,
                });
            }
        } else if let Some(input) = current.as_mut() {
            if trimmed.starts_with("Volume:") {
                if let Some(pct) = trimmed
                    .split_whitespace()
                    .find(|t| t.ends_with('%'))
                    .and_then(|t| t.trim_end_matches('%').parse().ok())
                {
                    input.volume_pct = pct;
                }
            } else if let Some(rest) = trimmed.strip_prefix("application.name = ") {
                input.app_name = Some(rest.trim_matches('"').to_string());
            }
        }
    }
    if let Some(done) = current.take() {
        inputs.push(done);
    }
    inputs
}
