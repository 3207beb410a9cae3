use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::events::ProtocolEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    AwaitingWake,
    Listening,
    Processing,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Idle,
    RunActive { stage: RunStage },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::RunActive {
                stage: RunStage::AwaitingWake,
            } => "awaiting_wake",
            SessionState::RunActive {
                stage: RunStage::Listening,
            } => "listening",
            SessionState::RunActive {
                stage: RunStage::Processing,
            } => "processing",
            SessionState::RunActive {
                stage: RunStage::Speaking,
            } => "speaking",
        }
    }
}

/// One remote voice-interaction turn.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: u64,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    error: Option<(String, String)>,
}

/// Side effects the caller must carry out after feeding the machine.
/// The machine itself never touches IO.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Enable/disable output ducking.
    SetDucking(bool),
    /// Begin forwarding gated audio as binary messages with this
    /// handler prefix.
    StartForwarding { stt_handler_id: u8 },
    /// Stop accepting audio frames from the gate.
    StopForwarding,
    PlayAwakeSound,
    PlayDoneSound,
    PlayTtsChunk(Bytes),
    EndTtsStream,
    /// The active run finished; `error` is set when the run failed.
    RunFinished { error: Option<(String, String)> },
}

/// Explicit transition table for the remote pipeline protocol.
///
/// Events legal only in certain stages are rejected here; an illegal
/// or stale sequence is a logged protocol violation, not undefined
/// behavior. Transport failures are not events: the driving loop calls
/// [`Session::on_disconnected`] and the active run is discarded.
pub struct Session {
    state: SessionState,
    run: Option<PipelineRun>,
    /// Most recently finished run, kept so a late `Error` for it can
    /// still take precedence over its observed `RunEnd`.
    last_finished: Option<PipelineRun>,
    ducked: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            run: None,
            last_finished: None,
            ducked: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_run(&self) -> Option<&PipelineRun> {
        self.run.as_ref()
    }

    /// Audio frames are accepted only while a run is waiting for the
    /// wake word or listening; wake detection is remote and consumes
    /// the same stream.
    pub fn accepts_audio(&self) -> bool {
        matches!(
            self.state,
            SessionState::RunActive {
                stage: RunStage::AwaitingWake
            } | SessionState::RunActive {
                stage: RunStage::Listening
            }
        )
    }

    pub fn on_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn on_connected(&mut self) {
        debug!("Session connected");
        self.state = SessionState::Idle;
    }

    /// Transport failure from any state. The in-flight run is
    /// discarded wholesale; the connection is never reused.
    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(mut run) = self.run.take() {
            warn!("Discarding in-flight run {} on disconnect", run.run_id);
            run.ended_at = Some(Instant::now());
            self.last_finished = Some(run);
            effects.push(Effect::StopForwarding);
        }
        if self.ducked {
            self.ducked = false;
            effects.push(Effect::SetDucking(false));
        }
        self.state = SessionState::Disconnected;
        effects
    }

    /// Starts a new turn. `awaiting_wake` selects whether the run
    /// opens waiting for a remote wake word or goes straight to
    /// listening.
    pub fn start_run(&mut self, run_id: u64, awaiting_wake: bool) -> Vec<Effect> {
        if self.state != SessionState::Idle {
            warn!(
                "Protocol violation: start_run in state {}",
                self.state.name()
            );
            return Vec::new();
        }

        let stage = if awaiting_wake {
            RunStage::AwaitingWake
        } else {
            RunStage::Listening
        };
        self.state = SessionState::RunActive { stage };
        self.run = Some(PipelineRun {
            run_id,
            started_at: Instant::now(),
            ended_at: None,
            error: None,
        });
        info!("Run {} started ({})", run_id, self.state.name());
        Vec::new()
    }

    /// Forces `Listening -> Processing` when the silence budget runs
    /// out without an explicit end-of-speech from the server.
    pub fn on_listening_timeout(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::RunActive {
                stage: RunStage::Listening,
            } => {
                info!("Listening timeout, moving to processing");
                self.state = SessionState::RunActive {
                    stage: RunStage::Processing,
                };
                vec![Effect::StopForwarding]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_event(&mut self, run_id: u64, event: ProtocolEvent) -> Vec<Effect> {
        // Stale run id: the only event that still matters is an Error
        // for the run that just finished, which takes precedence over
        // the RunEnd already observed for it.
        let current_id = self.run.as_ref().map(|r| r.run_id);
        if current_id != Some(run_id) {
            if let ProtocolEvent::Error { code, message } = &event {
                if let Some(finished) = &mut self.last_finished {
                    if finished.run_id == run_id && finished.error.is_none() {
                        warn!(
                            "Run {} failed after run-end: {} ({})",
                            run_id, message, code
                        );
                        finished.error = Some((code.clone(), message.clone()));
                        return vec![Effect::RunFinished {
                            error: Some((code.clone(), message.clone())),
                        }];
                    }
                }
            }
            warn!(
                "Protocol violation: event {:?} for stale run {} (current {:?})",
                kind_of(&event),
                run_id,
                current_id
            );
            return Vec::new();
        }

        let stage = match self.state {
            SessionState::RunActive { stage } => stage,
            _ => {
                warn!(
                    "Protocol violation: event {:?} in state {}",
                    kind_of(&event),
                    self.state.name()
                );
                return Vec::new();
            }
        };

        match (stage, event) {
            (_, ProtocolEvent::RunStarted { stt_handler_id, .. }) => {
                vec![Effect::StartForwarding { stt_handler_id }]
            }

            (RunStage::AwaitingWake, ProtocolEvent::WakeWordDetected) => {
                info!("Wake word detected");
                self.state = SessionState::RunActive {
                    stage: RunStage::Listening,
                };
                self.ducked = true;
                vec![Effect::SetDucking(true), Effect::PlayAwakeSound]
            }

            (RunStage::Listening, ProtocolEvent::SttStart) => Vec::new(),

            (RunStage::Listening, ProtocolEvent::SttEnd { text }) => {
                info!("Speech to text finished: {:?}", text);
                self.state = SessionState::RunActive {
                    stage: RunStage::Processing,
                };
                vec![Effect::StopForwarding, Effect::PlayDoneSound]
            }

            (RunStage::Listening | RunStage::Processing, ProtocolEvent::TtsStart) => {
                self.state = SessionState::RunActive {
                    stage: RunStage::Speaking,
                };
                // TtsStart while nominally listening means the server
                // ended the stt stage without us seeing stt-end.
                if stage == RunStage::Listening {
                    vec![Effect::StopForwarding]
                } else {
                    Vec::new()
                }
            }

            (RunStage::Speaking, ProtocolEvent::TtsAudioChunk(bytes)) => {
                vec![Effect::PlayTtsChunk(bytes)]
            }

            (RunStage::Speaking, ProtocolEvent::TtsEnd) => vec![Effect::EndTtsStream],

            (_, ProtocolEvent::RunEnd) => self.finish_run(None),

            (_, ProtocolEvent::Error { code, message }) => {
                warn!("Run {} failed: {} ({})", run_id, message, code);
                self.finish_run(Some((code, message)))
            }

            (stage, event) => {
                warn!(
                    "Protocol violation: event {:?} out of order in stage {:?}",
                    kind_of(&event),
                    stage
                );
                Vec::new()
            }
        }
    }

    fn finish_run(&mut self, error: Option<(String, String)>) -> Vec<Effect> {
        let mut effects = vec![Effect::StopForwarding];
        if self.ducked {
            self.ducked = false;
            effects.push(Effect::SetDucking(false));
        }
        if let Some(mut run) = self.run.take() {
            run.ended_at = Some(Instant::now());
            run.error = error.clone();
            info!(
                "Run {} ended after {:?}",
                run.run_id,
                run.started_at.elapsed()
            );
            self.last_finished = Some(run);
        }
        self.state = SessionState::Idle;
        effects.push(Effect::RunFinished { error });
        effects
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_of(event: &ProtocolEvent) -> &'static str {
    match event {
        ProtocolEvent::RunStarted { .. } => "run-started",
        ProtocolEvent::WakeWordDetected => "wake-word-detected",
        ProtocolEvent::SttStart => "stt-start",
        ProtocolEvent::SttEnd { .. } => "stt-end",
        ProtocolEvent::TtsStart => "tts-start",
        ProtocolEvent::TtsAudioChunk(_) => "tts-audio-chunk",
        ProtocolEvent::TtsEnd => "tts-end",
        ProtocolEvent::RunEnd => "run-end",
        ProtocolEvent::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: u64 = 10;

    fn session_in_run(awaiting_wake: bool) -> Session {
        let mut session = Session::new();
        session.on_connecting();
        session.on_connected();
        session.start_run(RUN, awaiting_wake);
        session.on_event(
            RUN,
            ProtocolEvent::RunStarted {
                stt_handler_id: 1,
                tts_handler_id: 2,
            },
        );
        session
    }

    fn chunk(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn test_connect_transitions() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.on_connecting();
        assert_eq!(session.state(), SessionState::Connecting);

        session.on_connected();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_start_run_awaiting_wake() {
        let session = session_in_run(true);
        assert_eq!(
            session.state(),
            SessionState::RunActive {
                stage: RunStage::AwaitingWake
            }
        );
        assert!(session.accepts_audio());
    }

    #[test]
    fn test_start_run_listening_without_wake() {
        let session = session_in_run(false);
        assert_eq!(
            session.state(),
            SessionState::RunActive {
                stage: RunStage::Listening
            }
        );
    }

    #[test]
    fn test_start_run_outside_idle_is_rejected() {
        let mut session = Session::new();
        session.start_run(RUN, true);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.current_run().is_none());
    }

    #[test]
    fn test_wake_word_moves_to_listening_and_ducks() {
        let mut session = session_in_run(true);
        let effects = session.on_event(RUN, ProtocolEvent::WakeWordDetected);

        assert_eq!(
            session.state(),
            SessionState::RunActive {
                stage: RunStage::Listening
            }
        );
        assert!(effects.contains(&Effect::SetDucking(true)));
        assert!(effects.contains(&Effect::PlayAwakeSound));
    }

    #[test]
    fn test_stt_end_moves_to_processing_and_stops_audio() {
        let mut session = session_in_run(false);
        let effects = session.on_event(
            RUN,
            ProtocolEvent::SttEnd {
                text: "hello".to_string(),
            },
        );

        assert_eq!(
            session.state(),
            SessionState::RunActive {
                stage: RunStage::Processing
            }
        );
        assert!(effects.contains(&Effect::StopForwarding));
        assert!(!session.accepts_audio());
    }

    #[test]
    fn test_full_run_trace_matches_transition_table() {
        let mut session = session_in_run(true);

        session.on_event(RUN, ProtocolEvent::WakeWordDetected);
        assert_eq!(session.state().name(), "listening");

        session.on_event(RUN, ProtocolEvent::SttStart);
        assert_eq!(session.state().name(), "listening");

        session.on_event(
            RUN,
            ProtocolEvent::SttEnd {
                text: "test".to_string(),
            },
        );
        assert_eq!(session.state().name(), "processing");

        session.on_event(RUN, ProtocolEvent::TtsStart);
        assert_eq!(session.state().name(), "speaking");

        session.on_event(RUN, ProtocolEvent::TtsAudioChunk(chunk(1)));
        assert_eq!(session.state().name(), "speaking");

        session.on_event(RUN, ProtocolEvent::TtsEnd);
        assert_eq!(session.state().name(), "speaking");

        session.on_event(RUN, ProtocolEvent::RunEnd);
        assert_eq!(session.state().name(), "idle");
    }

    #[test]
    fn test_tts_chunks_forwarded_in_order_with_ducking_bracket() {
        // Scenario: wake word, tts start, three chunks, tts end, run end.
        let mut session = session_in_run(true);

        let wake_effects = session.on_event(RUN, ProtocolEvent::WakeWordDetected);
        assert!(wake_effects.contains(&Effect::SetDucking(true)));

        session.on_event(RUN, ProtocolEvent::TtsStart);

        let mut chunks = Vec::new();
        for tag in 1..=3u8 {
            for effect in session.on_event(RUN, ProtocolEvent::TtsAudioChunk(chunk(tag))) {
                if let Effect::PlayTtsChunk(bytes) = effect {
                    chunks.push(bytes[0]);
                }
            }
        }
        assert_eq!(chunks, vec![1, 2, 3]);

        session.on_event(RUN, ProtocolEvent::TtsEnd);
        let end_effects = session.on_event(RUN, ProtocolEvent::RunEnd);
        assert!(end_effects.contains(&Effect::SetDucking(false)));
    }

    #[test]
    fn test_ducking_returns_to_pre_run_value() {
        let mut session = session_in_run(true);
        session.on_event(RUN, ProtocolEvent::WakeWordDetected);
        let effects = session.on_event(RUN, ProtocolEvent::RunEnd);
        assert!(effects.contains(&Effect::SetDucking(false)));

        // A run that never ducked must not unduck.
        session.start_run(RUN + 1, false);
        let effects = session.on_event(RUN + 1, ProtocolEvent::RunEnd);
        assert!(!effects.iter().any(|e| matches!(e, Effect::SetDucking(_))));
    }

    #[test]
    fn test_stale_run_id_produces_no_state_change() {
        let mut session = session_in_run(true);
        let before = session.state();

        let effects = session.on_event(RUN + 5, ProtocolEvent::WakeWordDetected);
        assert!(effects.is_empty());
        assert_eq!(session.state(), before);

        let effects = session.on_event(RUN - 5, ProtocolEvent::RunEnd);
        assert!(effects.is_empty());
        assert_eq!(session.state(), before);
    }

    #[test]
    fn test_error_takes_precedence_over_run_end() {
        let mut session = session_in_run(false);

        let effects = session.on_event(RUN, ProtocolEvent::RunEnd);
        assert!(effects.contains(&Effect::RunFinished { error: None }));

        // A late error for the same run id is still reported.
        let effects = session.on_event(
            RUN,
            ProtocolEvent::Error {
                code: "stt-failed".to_string(),
                message: "backend died".to_string(),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::RunFinished {
                error: Some(("stt-failed".to_string(), "backend died".to_string()))
            }]
        );
        // But it does not resurrect the run.
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.current_run().is_none());
    }

    #[test]
    fn test_late_error_for_unknown_run_is_ignored() {
        let mut session = session_in_run(false);
        session.on_event(RUN, ProtocolEvent::RunEnd);

        let effects = session.on_event(
            RUN + 99,
            ProtocolEvent::Error {
                code: "x".to_string(),
                message: "y".to_string(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_error_ends_run_and_unducks() {
        let mut session = session_in_run(true);
        session.on_event(RUN, ProtocolEvent::WakeWordDetected);

        let effects = session.on_event(
            RUN,
            ProtocolEvent::Error {
                code: "wake-word-timeout".to_string(),
                message: "timeout".to_string(),
            },
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(effects.contains(&Effect::SetDucking(false)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RunFinished { error: Some(_) })));
    }

    #[test]
    fn test_tts_chunk_outside_speaking_is_ignored() {
        let mut session = session_in_run(false);
        let before = session.state();

        let effects = session.on_event(RUN, ProtocolEvent::TtsAudioChunk(chunk(1)));
        assert!(effects.is_empty());
        assert_eq!(session.state(), before);
    }

    #[test]
    fn test_wake_word_while_listening_is_violation() {
        let mut session = session_in_run(false);
        let effects = session.on_event(RUN, ProtocolEvent::WakeWordDetected);
        assert!(effects.is_empty());
        assert_eq!(session.state().name(), "listening");
    }

    #[test]
    fn test_disconnect_discards_run_from_any_state() {
        // Scenario: transport closes mid-listening.
        let mut session = session_in_run(true);
        session.on_event(RUN, ProtocolEvent::WakeWordDetected);
        assert_eq!(session.state().name(), "listening");

        let effects = session.on_disconnected();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.current_run().is_none());
        assert!(effects.contains(&Effect::StopForwarding));
        assert!(effects.contains(&Effect::SetDucking(false)));
    }

    #[test]
    fn test_listening_timeout_forces_processing() {
        let mut session = session_in_run(false);
        let effects = session.on_listening_timeout();
        assert_eq!(session.state().name(), "processing");
        assert!(effects.contains(&Effect::StopForwarding));

        // No-op anywhere else.
        let effects = session.on_listening_timeout();
        assert!(effects.is_empty());
        assert_eq!(session.state().name(), "processing");
    }

    #[test]
    fn test_run_started_enables_forwarding() {
        let mut session = Session::new();
        session.on_connecting();
        session.on_connected();
        session.start_run(RUN, true);

        let effects = session.on_event(
            RUN,
            ProtocolEvent::RunStarted {
                stt_handler_id: 7,
                tts_handler_id: 8,
            },
        );
        assert_eq!(effects, vec![Effect::StartForwarding { stt_handler_id: 7 }]);
    }

    #[test]
    fn test_tts_start_straight_from_listening() {
        let mut session = session_in_run(false);
        let effects = session.on_event(RUN, ProtocolEvent::TtsStart);
        assert_eq!(session.state().name(), "speaking");
        assert!(effects.contains(&Effect::StopForwarding));
    }

    #[test]
    fn test_events_in_idle_are_violations() {
        let mut session = Session::new();
        session.on_connecting();
        session.on_connected();

        let effects = session.on_event(RUN, ProtocolEvent::RunEnd);
        assert!(effects.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
