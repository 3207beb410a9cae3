use std::time::Instant;

use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub captured_at: Instant,
    pub is_speech: bool,
    pub confidence: f32,
}

/// A speech/non-speech classifier. Implementations are interchangeable
/// behind this single capability; swapping one for another changes no
/// other component.
pub trait VadDetector: Send {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision;

    /// Clears any internal recurrent state. Called when a gate opens so
    /// the next utterance starts fresh.
    fn reset(&mut self) {}
}

/// Fast heuristic detector: frame RMS scaled into a 0-1 confidence.
pub struct EnergyDetector {
    threshold: f32,
}

/// RMS of roughly 0.1 (normalized) maps to full confidence; quiet
/// rooms sit well under 0.01.
const FULL_SCALE_RMS: f32 = 0.1;

impl EnergyDetector {
    pub fn new(threshold: f32) -> Self {
        tracing::info!("Energy VAD initialized with threshold: {}", threshold);
        Self { threshold }
    }

    fn level(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum / samples.len() as f64).sqrt() as f32
    }
}

impl VadDetector for EnergyDetector {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        let confidence = (Self::level(&frame.pcm) / FULL_SCALE_RMS).min(1.0);
        let is_speech = confidence >= self.threshold;

        tracing::trace!(
            "Energy VAD: confidence {:.4}, threshold {:.4}, is_speech {}",
            confidence,
            self.threshold,
            is_speech
        );

        VadDecision {
            captured_at: frame.captured_at,
            is_speech,
            confidence,
        }
    }
}
