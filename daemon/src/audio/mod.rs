pub mod capture;
pub mod duck;
pub mod enhance;
pub mod playback;
pub mod record;

use std::time::Instant;

/// One fixed-size chunk of mono S16LE microphone audio.
///
/// Frames are moved from stage to stage; only the broadcast fan-out
/// (protocol forwarder, debug tap) clones them.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(pcm: Vec<i16>) -> Self {
        Self {
            pcm,
            captured_at: Instant::now(),
        }
    }

    /// Wire encoding: little-endian 16-bit samples.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pcm.len() * 2);
        for sample in &self.pcm {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}
