use rubato::{FftFixedInOut, Resampler};

use crate::audio::AudioFrame;
use crate::config::EnhancementConfig;
use crate::error::SatelliteError;

/// Rate every frame leaving the chain is delivered at; this is what
/// the remote pipeline expects.
pub const TARGET_RATE: u32 = 16000;

const MAX_NOISE_LEVEL: u8 = 4;
const MAX_GAIN_LEVEL: u8 = 31;

/// Per-frame conditioning applied between capture and the voice gate,
/// in fixed order: resample, noise suppression, auto gain, volume.
///
/// The volume multiplier runs last so distorted samples are never fed
/// into the suppression stage. With every stage disabled the chain is
/// the identity transform.
pub struct EnhancementChain {
    resampler: Option<ResampleStage>,
    noise_gate: Option<NoiseGate>,
    auto_gain: Option<AutoGain>,
    volume_multiplier: f32,
}

impl EnhancementChain {
    pub fn new(config: &EnhancementConfig, input_rate: u32) -> Result<Self, SatelliteError> {
        if config.noise_suppression > MAX_NOISE_LEVEL {
            return Err(SatelliteError::Config(format!(
                "noise_suppression must be 0-{}, got {}",
                MAX_NOISE_LEVEL, config.noise_suppression
            )));
        }
        if config.auto_gain > MAX_GAIN_LEVEL {
            return Err(SatelliteError::Config(format!(
                "auto_gain must be 0-{}, got {}",
                MAX_GAIN_LEVEL, config.auto_gain
            )));
        }
        if config.volume_multiplier <= 0.0 {
            return Err(SatelliteError::Config(format!(
                "volume_multiplier must be positive, got {}",
                config.volume_multiplier
            )));
        }

        let resampler = if input_rate != TARGET_RATE {
            Some(ResampleStage::new(input_rate)?)
        } else {
            None
        };

        let noise_gate = (config.noise_suppression > 0).then(|| NoiseGate::new(config.noise_suppression));
        let auto_gain = (config.auto_gain > 0).then(|| AutoGain::new(config.auto_gain));

        Ok(Self {
            resampler,
            noise_gate,
            auto_gain,
            volume_multiplier: config.volume_multiplier,
        })
    }

    /// Runs one frame through the chain. With resampling active the
    /// output length follows the target rate; a frame may come back
    /// empty while the resampler accumulates input.
    pub fn process(&mut self, frame: AudioFrame) -> AudioFrame {
        let AudioFrame { pcm, captured_at } = frame;

        let mut pcm = match &mut self.resampler {
            Some(stage) => stage.process(pcm),
            None => pcm,
        };

        if let Some(gate) = &mut self.noise_gate {
            gate.process(&mut pcm);
        }
        if let Some(agc) = &mut self.auto_gain {
            agc.process(&mut pcm);
        }
        if (self.volume_multiplier - 1.0).abs() > f32::EPSILON {
            for sample in &mut pcm {
                *sample = clamp_i16(*sample as f32 * self.volume_multiplier);
            }
        }

        AudioFrame { pcm, captured_at }
    }
}

fn clamp_i16(value: f32) -> i16 {
    value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn rms(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / pcm.len() as f64).sqrt() as f32
}

struct ResampleStage {
    inner: FftFixedInOut<f32>,
    pending: Vec<f32>,
    input_frames: usize,
}

impl ResampleStage {
    fn new(input_rate: u32) -> Result<Self, SatelliteError> {
        // Chunk near 30ms of input; rubato rounds to what its FFT needs.
        let chunk = (input_rate as usize * 30) / 1000;
        let inner = FftFixedInOut::<f32>::new(input_rate as usize, TARGET_RATE as usize, chunk, 1)
            .map_err(|e| SatelliteError::Config(format!("resampler setup failed: {}", e)))?;
        let input_frames = inner.input_frames_next();

        Ok(Self {
            inner,
            pending: Vec::with_capacity(input_frames * 2),
            input_frames,
        })
    }

    fn process(&mut self, pcm: Vec<i16>) -> Vec<i16> {
        self.pending
            .extend(pcm.iter().map(|&s| s as f32 / i16::MAX as f32));

        let mut out: Vec<i16> = Vec::new();
        while self.pending.len() >= self.input_frames {
            let rest = self.pending.split_off(self.input_frames);
            let input = std::mem::replace(&mut self.pending, rest);

            match self.inner.process(&[input], None) {
                Ok(resampled) => {
                    out.extend(
                        resampled[0]
                            .iter()
                            .map(|&s| clamp_i16(s * i16::MAX as f32)),
                    );
                }
                Err(e) => {
                    // Degraded, not fatal: pass silence for this block.
                    tracing::warn!("Resampling failed, dropping block: {}", e);
                }
            }
            self.input_frames = self.inner.input_frames_next();
        }
        out
    }
}

/// Attenuates frames whose level sits near the tracked noise floor.
/// Levels 1-4 map to progressively heavier attenuation.
struct NoiseGate {
    attenuation: f32,
    floor: f32,
}

impl NoiseGate {
    fn new(level: u8) -> Self {
        let attenuation = match level {
            1 => 0.5,
            2 => 0.3,
            3 => 0.15,
            _ => 0.05,
        };
        Self {
            attenuation,
            floor: 0.01,
        }
    }

    fn process(&mut self, pcm: &mut [i16]) {
        let level = rms(pcm);

        // Fast tracking downward, slow upward, so speech does not drag
        // the floor up.
        let alpha = if level < self.floor { 0.3 } else { 0.005 };
        self.floor += (level - self.floor) * alpha;

        if level < self.floor * 2.0 {
            for sample in pcm.iter_mut() {
                *sample = (*sample as f32 * self.attenuation) as i16;
            }
        }
    }
}

/// Slowly steers frame RMS toward a target level derived from the
/// configured gain setting. Gain is smoothed and clamped so a single
/// loud frame cannot slam the level.
struct AutoGain {
    target: f32,
    gain: f32,
}

const AGC_MIN_GAIN: f32 = 0.1;
const AGC_MAX_GAIN: f32 = 10.0;
const AGC_SMOOTHING: f32 = 0.1;
const AGC_SILENCE_FLOOR: f32 = 0.001;

impl AutoGain {
    fn new(level: u8) -> Self {
        // level 1 -> ~0.06 RMS target, level 31 -> ~0.3
        let target = 0.05 + (level as f32 / MAX_GAIN_LEVEL as f32) * 0.25;
        Self { target, gain: 1.0 }
    }

    fn process(&mut self, pcm: &mut [i16]) {
        let level = rms(pcm);
        if level > AGC_SILENCE_FLOOR {
            let desired = (self.target / level).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            self.gain += (desired - self.gain) * AGC_SMOOTHING;
        }

        for sample in pcm.iter_mut() {
            *sample = clamp_i16(*sample as f32 * self.gain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(config: &EnhancementConfig) -> EnhancementChain {
        EnhancementChain::new(config, TARGET_RATE).unwrap()
    }

    #[test]
    fn test_all_stages_disabled_is_identity() {
        let mut chain = chain(&EnhancementConfig::default());

        let pcm: Vec<i16> = (0..480).map(|i| (i as i16).wrapping_mul(37)).collect();
        let frame = AudioFrame::new(pcm.clone());
        let out = chain.process(frame);

        assert_eq!(out.pcm, pcm);
    }

    #[test]
    fn test_identity_over_many_frames() {
        let mut chain = chain(&EnhancementConfig::default());

        for seed in 0..20i16 {
            let pcm: Vec<i16> = (0..480).map(|i| (i as i16).wrapping_add(seed * 100)).collect();
            let out = chain.process(AudioFrame::new(pcm.clone()));
            assert_eq!(out.pcm, pcm);
        }
    }

    #[test]
    fn test_volume_multiplier_scales() {
        let config = EnhancementConfig {
            volume_multiplier: 2.0,
            ..Default::default()
        };
        let mut chain = chain(&config);

        let out = chain.process(AudioFrame::new(vec![100, -200, 300]));
        assert_eq!(out.pcm, vec![200, -400, 600]);
    }

    #[test]
    fn test_volume_multiplier_clamps_to_i16() {
        let config = EnhancementConfig {
            volume_multiplier: 100.0,
            ..Default::default()
        };
        let mut chain = chain(&config);

        let out = chain.process(AudioFrame::new(vec![10000, -10000]));
        assert_eq!(out.pcm, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_noise_gate_attenuates_quiet_frames() {
        let config = EnhancementConfig {
            noise_suppression: 4,
            ..Default::default()
        };
        let mut chain = chain(&config);

        // Constant low-level noise well under the initial floor margin.
        let noise: Vec<i16> = vec![20; 480];
        let out = chain.process(AudioFrame::new(noise.clone()));

        let energy_in: i64 = noise.iter().map(|&s| (s as i64).abs()).sum();
        let energy_out: i64 = out.pcm.iter().map(|&s| (s as i64).abs()).sum();
        assert!(energy_out < energy_in);
    }

    #[test]
    fn test_noise_gate_passes_loud_frames() {
        let config = EnhancementConfig {
            noise_suppression: 4,
            ..Default::default()
        };
        let mut chain = chain(&config);

        let speech: Vec<i16> = (0..480)
            .map(|i| if i % 2 == 0 { 12000 } else { -12000 })
            .collect();
        let out = chain.process(AudioFrame::new(speech.clone()));
        assert_eq!(out.pcm, speech);
    }

    #[test]
    fn test_auto_gain_raises_quiet_signal() {
        let config = EnhancementConfig {
            auto_gain: 31,
            ..Default::default()
        };
        let mut chain = chain(&config);

        let quiet: Vec<i16> = (0..480)
            .map(|i| if i % 2 == 0 { 500 } else { -500 })
            .collect();

        // Feed several frames so the smoothed gain converges upward.
        let mut last = Vec::new();
        for _ in 0..50 {
            last = chain.process(AudioFrame::new(quiet.clone())).pcm;
        }

        let energy_in: i64 = quiet.iter().map(|&s| (s as i64).abs()).sum();
        let energy_out: i64 = last.iter().map(|&s| (s as i64).abs()).sum();
        assert!(energy_out > energy_in);
    }

    #[test]
    fn test_auto_gain_ignores_silence() {
        let config = EnhancementConfig {
            auto_gain: 31,
            ..Default::default()
        };
        let mut chain = chain(&config);

        // Pure silence must not pump the gain.
        for _ in 0..10 {
            let out = chain.process(AudioFrame::new(vec![0; 480]));
            assert_eq!(out.pcm, vec![0; 480]);
        }
    }

    #[test]
    fn test_invalid_noise_level_rejected() {
        let config = EnhancementConfig {
            noise_suppression: 5,
            ..Default::default()
        };
        assert!(EnhancementChain::new(&config, TARGET_RATE).is_err());
    }

    #[test]
    fn test_invalid_gain_level_rejected() {
        let config = EnhancementConfig {
            auto_gain: 32,
            ..Default::default()
        };
        assert!(EnhancementChain::new(&config, TARGET_RATE).is_err());
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let config = EnhancementConfig {
            volume_multiplier: 0.0,
            ..Default::default()
        };
        assert!(EnhancementChain::new(&config, TARGET_RATE).is_err());
    }

    #[test]
    fn test_resampler_produces_target_rate_output() {
        let mut chain = EnhancementChain::new(&EnhancementConfig::default(), 48000).unwrap();

        // 48kHz -> 16kHz is a 3:1 reduction. Feed a second of audio and
        // expect roughly a third back once the resampler has flushed.
        let mut total_out = 0usize;
        for _ in 0..100 {
            let frame = AudioFrame::new(vec![1000; 1440]);
            total_out += chain.process(frame).pcm.len();
        }
        let total_in = 100 * 1440;
        let ratio = total_out as f64 / total_in as f64;
        assert!(ratio > 0.25 && ratio < 0.4, "ratio was {}", ratio);
    }
}
