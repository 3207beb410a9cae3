use std::collections::VecDeque;
use tracing::{debug, info};

use crate::audio::AudioFrame;
use crate::vad::detector::{VadDecision, VadDetector};

/// What the gate decided to do with a pushed frame.
#[derive(Debug)]
pub enum GateOutput {
    /// Frames to stream now, in capture order. More than one when the
    /// pre-roll buffer flushes at speech-start.
    Stream(Vec<AudioFrame>),
    /// Frame withheld; no speech detected yet.
    Hold,
}

/// Decides, per frame, whether audio is transmitted.
///
/// Without a detector the gate is a pass-through that reports speech
/// for every frame. With one, a rolling window of recent decisions
/// provides hysteresis: the gate opens only after `trigger_level`
/// consecutive speech frames, so raw flicker cannot toggle streaming
/// frame-by-frame. Frames seen while closed are kept in a bounded
/// pre-roll ring and flushed ahead of the live stream at speech-start,
/// preserving the leading edge of the utterance.
///
/// Once open the gate stays open until `reset()`; end-of-speech is the
/// remote pipeline's call (or the listening timeout), not the gate's.
pub struct VoiceGate {
    detector: Option<Box<dyn VadDetector>>,
    trigger_level: usize,
    window: VecDeque<VadDecision>,
    preroll: VecDeque<AudioFrame>,
    buffer_chunks: usize,
    open: bool,
}

impl VoiceGate {
    pub fn new(
        detector: Option<Box<dyn VadDetector>>,
        trigger_level: u32,
        buffer_chunks: usize,
    ) -> Self {
        let trigger_level = trigger_level.max(1) as usize;
        info!(
            "Voice gate initialized: detector={}, trigger_level={}, buffer_chunks={}",
            if detector.is_some() { "enabled" } else { "disabled" },
            trigger_level,
            buffer_chunks
        );

        Self {
            detector,
            trigger_level,
            window: VecDeque::with_capacity(trigger_level),
            preroll: VecDeque::with_capacity(buffer_chunks),
            buffer_chunks,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open || self.detector.is_none()
    }

    /// Classifies one frame and returns what should be streamed.
    pub fn push(&mut self, frame: AudioFrame) -> GateOutput {
        let detector = match &mut self.detector {
            None => return GateOutput::Stream(vec![frame]),
            Some(detector) => detector,
        };

        if self.open {
            return GateOutput::Stream(vec![frame]);
        }

        let decision = detector.classify(&frame);
        self.window.push_back(decision);
        if self.window.len() > self.trigger_level {
            self.window.pop_front();
        }

        let triggered = self.window.len() == self.trigger_level
            && self.window.iter().all(|d| d.is_speech);

        if triggered {
            self.open = true;
            detector.reset();
            self.window.clear();
            info!("Speech detected, gate open");

            let mut frames: Vec<AudioFrame> = self.preroll.drain(..).collect();
            frames.push(frame);
            debug!("Flushing {} pre-roll frames", frames.len() - 1);
            return GateOutput::Stream(frames);
        }

        if self.buffer_chunks > 0 {
            if self.preroll.len() == self.buffer_chunks {
                self.preroll.pop_front();
            }
            self.preroll.push_back(frame);
        }
        GateOutput::Hold
    }

    /// Returns the gate to its armed state for the next turn.
    pub fn reset(&mut self) {
        if self.open {
            debug!("Gate closed");
        }
        self.open = false;
        self.window.clear();
        self.preroll.clear();
        if let Some(detector) = &mut self.detector {
            detector.reset();
        }
    }
}
