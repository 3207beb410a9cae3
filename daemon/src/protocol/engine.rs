use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::playback::PlaybackHandle;
use crate::audio::AudioFrame;
use crate::config::Config;
use crate::error::{SatelliteError, TransportError};
use crate::protocol::connection::{Connection, ConnectionReader, ConnectionWriter, Incoming};
use crate::protocol::events::{
    is_opaque_event, ClientMessage, ProtocolEvent, RunInput, ServerMessage,
};
use crate::protocol::session::{Effect, Session, SessionState};
use crate::satellite::SatelliteStatus;

/// Wake-word stage timeout passed to the server with each run.
const WAKE_WORD_TIMEOUT_SECS: u32 = 3;

/// Bound on frames held between requesting a run and the server
/// handing us the audio handler. At 30ms per frame this is several
/// seconds of slack.
const MAX_PENDING_FRAMES: usize = 256;

/// What the audio send path does with gated frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ForwardMode {
    /// Run left `Listening`; further frames are refused.
    Refuse,
    /// Armed for the next turn: frames are held in order so the start
    /// of the utterance survives run-start latency.
    Buffer,
    /// Stream frames with this handler prefix.
    Forward(u8),
}

/// Order-preserving frame staging for the sender task. Frames accepted
/// here go out in strict capture order, never reordered; buffered
/// frames flush ahead of live ones when forwarding starts.
pub(crate) struct AudioForwarder {
    mode: ForwardMode,
    pending: VecDeque<AudioFrame>,
    max_pending: usize,
}

impl AudioForwarder {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            mode: ForwardMode::Buffer,
            pending: VecDeque::new(),
            max_pending,
        }
    }

    pub(crate) fn set_mode(&mut self, mode: ForwardMode) -> Vec<(u8, Vec<u8>)> {
        self.mode = mode;
        match mode {
            ForwardMode::Forward(handler_id) => self
                .pending
                .drain(..)
                .map(|frame| (handler_id, frame.to_le_bytes()))
                .collect(),
            ForwardMode::Refuse => {
                self.pending.clear();
                Vec::new()
            }
            ForwardMode::Buffer => Vec::new(),
        }
    }

    /// Returns messages to send plus whether this frame is the first
    /// audio of a new turn.
    pub(crate) fn on_frame(&mut self, frame: AudioFrame) -> (Vec<(u8, Vec<u8>)>, bool) {
        match self.mode {
            ForwardMode::Refuse => (Vec::new(), false),
            ForwardMode::Buffer => {
                let first = self.pending.is_empty();
                if self.pending.len() == self.max_pending {
                    warn!("Run-start backlog full, dropping oldest frame");
                    self.pending.pop_front();
                }
                self.pending.push_back(frame);
                (Vec::new(), first)
            }
            ForwardMode::Forward(handler_id) => (vec![(handler_id, frame.to_le_bytes())], false),
        }
    }
}

/// Runs one connection worth of protocol work: connect, authenticate,
/// then turn after turn until the transport fails or shutdown is
/// requested. `Ok(())` means shutdown was requested.
pub async fn run_session(
    config: &Config,
    gated_rx: mpsc::Receiver<AudioFrame>,
    playback: PlaybackHandle,
    gate_reset_tx: watch::Sender<u64>,
    status: Arc<SatelliteStatus>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SatelliteError> {
    let mut session = Session::new();
    session.on_connecting();
    status.set_state(session.state().name());

    let connect_timeout = Duration::from_secs(config.timeouts.connect_seconds);
    let connection = match Connection::connect(&config.remote, connect_timeout).await {
        Ok(connection) => connection,
        Err(e) => {
            session.on_disconnected();
            status.set_state(session.state().name());
            return Err(e.into());
        }
    };
    status.connected.store(true, Ordering::SeqCst);
    session.on_connected();
    status.set_state(session.state().name());

    let mut connection = connection;
    let mut next_id: u64 = 1;

    let pipeline_id = match &config.remote.pipeline {
        Some(name) => {
            let id = next_id;
            next_id += 1;
            match connection.resolve_pipeline(name, id).await {
                Ok(pipeline_id) => pipeline_id,
                Err(e) => {
                    session.on_disconnected();
                    status.set_state(session.state().name());
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    let (writer, reader) = connection.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<ClientMessage>(8);
    let (mode_tx, mode_rx) = watch::channel(ForwardMode::Buffer);
    let (speech_tx, speech_rx) = mpsc::channel::<()>(1);

    let mut sender_task = tokio::spawn(sender_loop(
        writer,
        gated_rx,
        outbound_rx,
        mode_rx,
        speech_tx,
    ));

    let mut driver = SessionDriver {
        config,
        session,
        reader,
        speech_rx,
        outbound_tx,
        mode_tx,
        gate_reset_tx,
        playback,
        status: Arc::clone(&status),
        pipeline_id,
        next_id,
        pending_run: None,
        tts_handler: None,
        listening_deadline: None,
    };

    let result = driver.event_loop(shutdown, &mut sender_task).await;
    sender_task.abort();

    // Transport gone (or shutdown): discard the in-flight run and
    // restore ducking before handing control back.
    let effects = driver.session.on_disconnected();
    driver.apply_effects(effects).await;

    status.connected.store(false, Ordering::SeqCst);
    status.set_state("disconnected");
    result
}

async fn sender_loop(
    mut writer: ConnectionWriter,
    mut gated_rx: mpsc::Receiver<AudioFrame>,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    mut mode_rx: watch::Receiver<ForwardMode>,
    speech_tx: mpsc::Sender<()>,
) -> Result<(), TransportError> {
    let mut forwarder = AudioForwarder::new(MAX_PENDING_FRAMES);

    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                let Some(message) = message else { return Ok(()) };
                writer.send(&message).await?;
            }
            changed = mode_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let mode = *mode_rx.borrow_and_update();
                for (handler_id, payload) in forwarder.set_mode(mode) {
                    writer.send_audio(handler_id, &payload).await?;
                }
            }
            frame = gated_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                let (messages, speech_started) = forwarder.on_frame(frame);
                if speech_started {
                    let _ = speech_tx.try_send(());
                }
                for (handler_id, payload) in messages {
                    writer.send_audio(handler_id, &payload).await?;
                }
            }
        }
    }
}

/// One completed `select!` round in the event loop.
enum Step {
    Shutdown,
    SpeechStarted,
    Incoming(Result<Incoming, TransportError>),
    ListeningTimeout,
    SenderDone(Result<(), TransportError>),
}

struct SessionDriver<'a> {
    config: &'a Config,
    session: Session,
    reader: ConnectionReader,
    speech_rx: mpsc::Receiver<()>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    mode_tx: watch::Sender<ForwardMode>,
    gate_reset_tx: watch::Sender<u64>,
    playback: PlaybackHandle,
    status: Arc<SatelliteStatus>,
    pipeline_id: Option<String>,
    next_id: u64,
    pending_run: Option<u64>,
    tts_handler: Option<u8>,
    listening_deadline: Option<tokio::time::Instant>,
}

impl SessionDriver<'_> {
    async fn event_loop(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        sender_task: &mut JoinHandle<Result<(), TransportError>>,
    ) -> Result<(), SatelliteError> {
        loop {
            let turn_ready =
                self.session.state() == SessionState::Idle && self.pending_run.is_none();

            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                result = &mut *sender_task => {
                    Step::SenderDone(result.unwrap_or(Err(TransportError::Closed)))
                }
                incoming = self.reader.recv() => Step::Incoming(incoming),
                notified = self.speech_rx.recv(), if turn_ready => {
                    match notified {
                        Some(()) => Step::SpeechStarted,
                        None => Step::SenderDone(Err(TransportError::Closed)),
                    }
                }
                _ = tokio::time::sleep_until(self.listening_deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if self.listening_deadline.is_some() => Step::ListeningTimeout,
            };

            match step {
                Step::Shutdown => {
                    debug!("Session shutting down");
                    return Ok(());
                }
                Step::SenderDone(result) => {
                    return match result {
                        Ok(()) => Err(TransportError::Closed.into()),
                        Err(e) => Err(e.into()),
                    };
                }
                Step::SpeechStarted => self.start_turn().await?,
                Step::Incoming(incoming) => {
                    let incoming = incoming.map_err(SatelliteError::from)?;
                    self.handle_incoming(incoming).await?;
                }
                Step::ListeningTimeout => {
                    let effects = self.session.on_listening_timeout();
                    self.apply_effects(effects).await;
                    self.after_transition();
                }
            }
        }
    }

    async fn start_turn(&mut self) -> Result<(), SatelliteError> {
        let id = self.next_id;
        self.next_id += 1;

        let start_stage = self.config.remote.start_stage.clone();
        debug!("Requesting pipeline run {} (start stage {})", id, start_stage);

        let message = ClientMessage::RunPipeline {
            id,
            start_stage,
            end_stage: "tts".to_string(),
            input: RunInput {
                sample_rate: crate::audio::enhance::TARGET_RATE,
                timeout: WAKE_WORD_TIMEOUT_SECS,
                audio_seconds_to_buffer: self.config.remote.wake_buffer_seconds,
            },
            pipeline: self.pipeline_id.clone(),
        };
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| SatelliteError::Transport(TransportError::Closed))?;
        self.pending_run = Some(id);
        Ok(())
    }

    async fn handle_incoming(&mut self, incoming: Incoming) -> Result<(), SatelliteError> {
        match incoming {
            Incoming::Message(ServerMessage::Result {
                id,
                success,
                error,
                ..
            }) if self.pending_run == Some(id) => {
                self.pending_run = None;
                if !success {
                    let reason = error
                        .map(|e| format!("{} ({})", e.message, e.code))
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(TransportError::Malformed(format!(
                        "pipeline run refused: {}",
                        reason
                    ))
                    .into());
                }
                let awaiting_wake = self.config.remote.start_stage == "wake_word";
                let effects = self.session.start_run(id, awaiting_wake);
                self.apply_effects(effects).await;
                self.after_transition();
            }
            Incoming::Message(ServerMessage::Result { id, .. }) => {
                debug!("Ignoring result for message {}", id);
            }
            Incoming::Message(ServerMessage::Event { id, event }) => {
                match ProtocolEvent::from_wire(&event) {
                    Some(decoded) => {
                        if let ProtocolEvent::RunStarted { tts_handler_id, .. } = &decoded {
                            self.tts_handler = Some(*tts_handler_id);
                        }
                        let effects = self.session.on_event(id, decoded);
                        self.apply_effects(effects).await;
                        self.after_transition();
                    }
                    None if is_opaque_event(&event.kind) => {
                        debug!("Opaque pipeline event: {}", event.kind);
                    }
                    None => {
                        warn!("Protocol violation: unknown event kind {:?}", event.kind);
                    }
                }
            }
            Incoming::Message(ServerMessage::Pong { .. }) => {}
            Incoming::Message(other) => {
                warn!("Protocol violation: unexpected message {:?}", other);
            }
            Incoming::Binary {
                handler_id,
                payload,
            } => {
                let run_id = self.session.current_run().map(|r| r.run_id);
                match (run_id, self.tts_handler) {
                    (Some(run_id), Some(tts_handler)) if handler_id == tts_handler => {
                        let effects = self
                            .session
                            .on_event(run_id, ProtocolEvent::TtsAudioChunk(payload));
                        self.apply_effects(effects).await;
                    }
                    _ => {
                        warn!(
                            "Protocol violation: binary payload with handler {} outside a run",
                            handler_id
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Keeps the listening deadline and published state in step with
    /// the machine after every transition.
    fn after_transition(&mut self) {
        let listening = self.session.state()
            == SessionState::RunActive {
                stage: crate::protocol::session::RunStage::Listening,
            };
        if listening {
            if self.listening_deadline.is_none() {
                let timeout = Duration::from_secs(self.config.timeouts.listening_seconds);
                self.listening_deadline = Some(tokio::time::Instant::now() + timeout);
            }
        } else {
            self.listening_deadline = None;
        }
        self.status.set_state(self.session.state().name());
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SetDucking(active) => self.playback.set_ducking(active),
                Effect::StartForwarding { stt_handler_id } => {
                    let _ = self.mode_tx.send(ForwardMode::Forward(stt_handler_id));
                }
                Effect::StopForwarding => {
                    let _ = self.mode_tx.send(ForwardMode::Refuse);
                }
                Effect::PlayAwakeSound => self.playback.notify_awake().await,
                Effect::PlayDoneSound => self.playback.notify_done().await,
                Effect::PlayTtsChunk(bytes) => self.playback.tts_chunk(bytes).await,
                Effect::EndTtsStream => self.playback.tts_end().await,
                Effect::RunFinished { error } => {
                    self.status.pipeline_runs.fetch_add(1, Ordering::Relaxed);
                    match error {
                        Some((code, _)) if code == "wake-word-timeout" => {
                            debug!("Run ended waiting for wake word, restarting");
                        }
                        Some((code, message)) => {
                            warn!("Pipeline run failed: {} ({})", message, code);
                        }
                        None => debug!("Pipeline run completed"),
                    }
                    self.tts_handler = None;
                    self.gate_reset_tx.send_modify(|n| *n += 1);
                    let _ = self.mode_tx.send(ForwardMode::Buffer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 2])
    }

    #[test]
    fn test_forwarder_streams_all_frames_in_order_when_forwarding() {
        let mut forwarder = AudioForwarder::new(256);
        forwarder.set_mode(ForwardMode::Forward(1));

        let mut sent = Vec::new();
        for i in 0..50 {
            let (messages, _) = forwarder.on_frame(frame(i));
            sent.extend(messages);
        }

        assert_eq!(sent.len(), 50);
        for (i, (handler_id, payload)) in sent.iter().enumerate() {
            assert_eq!(*handler_id, 1);
            assert_eq!(payload.as_slice(), frame(i as i16).to_le_bytes().as_slice());
        }
    }

    #[test]
    fn test_forwarder_buffers_then_flushes_in_order() {
        let mut forwarder = AudioForwarder::new(256);

        let (messages, first) = forwarder.on_frame(frame(0));
        assert!(messages.is_empty());
        assert!(first);

        let (messages, first) = forwarder.on_frame(frame(1));
        assert!(messages.is_empty());
        assert!(!first);

        let flushed = forwarder.set_mode(ForwardMode::Forward(4));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].1, frame(0).to_le_bytes());
        assert_eq!(flushed[1].1, frame(1).to_le_bytes());

        let (messages, _) = forwarder.on_frame(frame(2));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, frame(2).to_le_bytes());
    }

    #[test]
    fn test_forwarder_refuses_frames_after_listening_ends() {
        let mut forwarder = AudioForwarder::new(256);
        forwarder.set_mode(ForwardMode::Forward(1));
        forwarder.set_mode(ForwardMode::Refuse);

        let (messages, speech) = forwarder.on_frame(frame(0));
        assert!(messages.is_empty());
        assert!(!speech);
    }

    #[test]
    fn test_forwarder_backlog_drops_oldest() {
        let mut forwarder = AudioForwarder::new(3);
        for i in 0..5 {
            forwarder.on_frame(frame(i));
        }

        let flushed = forwarder.set_mode(ForwardMode::Forward(1));
        let tags: Vec<Vec<u8>> = flushed.into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            tags,
            vec![
                frame(2).to_le_bytes(),
                frame(3).to_le_bytes(),
                frame(4).to_le_bytes()
            ]
        );
    }

    #[test]
    fn test_forwarder_refuse_clears_backlog() {
        let mut forwarder = AudioForwarder::new(256);
        forwarder.on_frame(frame(0));
        forwarder.on_frame(frame(1));

        assert!(forwarder.set_mode(ForwardMode::Refuse).is_empty());
        assert!(forwarder.set_mode(ForwardMode::Forward(1)).is_empty());
    }

    #[test]
    fn test_forwarder_signals_speech_only_on_first_buffered_frame() {
        let mut forwarder = AudioForwarder::new(256);
        assert!(forwarder.on_frame(frame(0)).1);
        assert!(!forwarder.on_frame(frame(1)).1);

        // Re-armed after a refuse/buffer cycle.
        forwarder.set_mode(ForwardMode::Refuse);
        forwarder.set_mode(ForwardMode::Buffer);
        assert!(forwarder.on_frame(frame(2)).1);
    }
}
