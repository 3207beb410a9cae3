pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod satellite;
pub mod server;
pub mod state;
pub mod vad;

pub use audio::capture::AudioCapture;
pub use audio::enhance::EnhancementChain;
pub use audio::playback::PlaybackSink;
pub use audio::AudioFrame;
pub use protocol::session::Session;
pub use vad::{EnergyDetector, VoiceGate};
