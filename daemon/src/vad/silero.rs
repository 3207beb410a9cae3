use ndarray::{Array1, Array2, Array3};
use ort::session::{builder::GraphOptimizationLevel, Session};

use crate::audio::AudioFrame;
use crate::error::SatelliteError;
use crate::vad::detector::{VadDecision, VadDetector};

const SAMPLE_RATE: i64 = 16000;
const STATE_SHAPE: (usize, usize, usize) = (2, 1, 64);

/// Silero VAD (v4 ONNX), run through onnxruntime with its recurrent
/// h/c state carried between frames.
pub struct SileroDetector {
    session: Session,
    h: Array3<f32>,
    c: Array3<f32>,
    threshold: f32,
}

impl SileroDetector {
    pub fn new(model_path: &str, threshold: f32) -> Result<Self, SatelliteError> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| {
                SatelliteError::Config(format!("failed to load vad model {}: {}", model_path, e))
            })?;

        tracing::info!("Silero VAD loaded from {}", model_path);

        Ok(Self {
            session,
            h: Array3::zeros(STATE_SHAPE),
            c: Array3::zeros(STATE_SHAPE),
            threshold,
        })
    }

    fn run(&mut self, frame: &AudioFrame) -> ort::Result<f32> {
        let samples: Vec<f32> = frame
            .pcm
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();
        let len = samples.len();
        let input = Array2::from_shape_vec((1, len), samples).expect("shape matches sample count");
        let sr = Array1::from_elem(1, SAMPLE_RATE);
        let h_in = self.h.clone();
        let c_in = self.c.clone();

        let outputs = self.session.run(ort::inputs![
            "input" => input.view(),
            "sr" => sr.view(),
            "h" => h_in.view(),
            "c" => c_in.view(),
        ]?)?;

        let probability = outputs["output"]
            .try_extract_tensor::<f32>()?
            .iter()
            .copied()
            .next()
            .unwrap_or(0.0);

        self.h = outputs["hn"]
            .try_extract_tensor::<f32>()?
            .to_owned()
            .into_shape_with_order(STATE_SHAPE)
            .unwrap_or_else(|_| Array3::zeros(STATE_SHAPE));
        self.c = outputs["cn"]
            .try_extract_tensor::<f32>()?
            .to_owned()
            .into_shape_with_order(STATE_SHAPE)
            .unwrap_or_else(|_| Array3::zeros(STATE_SHAPE));

        Ok(probability)
    }
}

impl VadDetector for SileroDetector {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        let confidence = match self.run(frame) {
            Ok(probability) => probability,
            Err(e) => {
                // Degraded, not fatal: report silence for this frame.
                tracing::warn!("Silero inference failed: {}", e);
                0.0
            }
        };

        VadDecision {
            captured_at: frame.captured_at,
            is_speech: confidence >= self.threshold,
            confidence,
        }
    }

    fn reset(&mut self) {
        self.h = Array3::zeros(STATE_SHAPE);
        self.c = Array3::zeros(STATE_SHAPE);
    }
}
