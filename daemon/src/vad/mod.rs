pub mod detector;
pub mod gate;
pub mod silero;

pub use detector::{EnergyDetector, VadDecision, VadDetector};
pub use gate::{GateOutput, VoiceGate};
pub use silero::SileroDetector;

use crate::config::VadConfig;
use crate::error::SatelliteError;

/// Builds the configured detector. `None` means gating is disabled and
/// every frame streams (the server decides turn boundaries).
pub fn build_detector(config: &VadConfig) -> Result<Option<Box<dyn VadDetector>>, SatelliteError> {
    match config.detector.as_str() {
        "disabled" => Ok(None),
        "energy" => Ok(Some(Box::new(EnergyDetector::new(config.threshold)))),
        "silero" => {
            let model_path = config.model_path.as_deref().ok_or_else(|| {
                SatelliteError::Config("vad.model_path is required for the silero detector".to_string())
            })?;
            Ok(Some(Box::new(SileroDetector::new(
                model_path,
                config.threshold,
            )?)))
        }
        other => Err(SatelliteError::Config(format!(
            "unknown vad detector '{}' (expected disabled, energy or silero)",
            other
        ))),
    }
}
