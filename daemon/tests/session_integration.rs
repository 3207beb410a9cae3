use bytes::Bytes;
use farfieldd::protocol::events::ProtocolEvent;
use farfieldd::protocol::session::{Effect, Session, SessionState};

const RUN: u64 = 1;

fn connected_session() -> Session {
    let mut session = Session::new();
    session.on_connecting();
    session.on_connected();
    session
}

/// Wake word, TTS start, three chunks, TTS end, run end: the playback
/// side sees exactly the three chunks in order, with ducking enabled
/// before the first chunk and disabled after run-end.
#[test]
fn test_full_voice_turn_effect_ordering() {
    let mut session = connected_session();
    session.start_run(RUN, true);
    session.on_event(
        RUN,
        ProtocolEvent::RunStarted {
            stt_handler_id: 1,
            tts_handler_id: 2,
        },
    );

    let mut timeline: Vec<String> = Vec::new();
    let mut record = |effects: Vec<Effect>| {
        for effect in effects {
            match effect {
                Effect::SetDucking(active) => timeline.push(format!("duck:{}", active)),
                Effect::PlayTtsChunk(bytes) => timeline.push(format!("chunk:{}", bytes[0])),
                Effect::EndTtsStream => timeline.push("tts-done".to_string()),
                Effect::RunFinished { .. } => timeline.push("finished".to_string()),
                _ => {}
            }
        }
    };

    record(session.on_event(RUN, ProtocolEvent::WakeWordDetected));
    record(session.on_event(RUN, ProtocolEvent::TtsStart));
    for tag in 1..=3u8 {
        record(session.on_event(RUN, ProtocolEvent::TtsAudioChunk(Bytes::from(vec![tag]))));
    }
    record(session.on_event(RUN, ProtocolEvent::TtsEnd));
    record(session.on_event(RUN, ProtocolEvent::RunEnd));

    assert_eq!(
        timeline,
        vec![
            "duck:true",
            "chunk:1",
            "chunk:2",
            "chunk:3",
            "tts-done",
            "duck:false",
            "finished"
        ]
    );
}

/// Transport loss mid-listening: the machine lands in Disconnected
/// with the run discarded, and the orchestrator's reconnect delay is
/// nonzero by default, so there is no immediate reconnect storm.
#[test]
fn test_transport_loss_mid_listening() {
    let mut session = connected_session();
    session.start_run(RUN, false);
    assert_eq!(session.state().name(), "listening");

    let effects = session.on_disconnected();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.current_run().is_none());
    assert!(effects.contains(&Effect::StopForwarding));

    let config = farfieldd::config::Config::default();
    assert!(config.satellite.reconnect_initial_ms > 0);
}

/// Events with stale run ids never disturb the active run.
#[test]
fn test_interleaved_stale_events_are_ignored() {
    let mut session = connected_session();
    session.start_run(RUN, false);

    // A previous run's leftovers arrive mixed into the live stream.
    session.on_event(RUN - 1, ProtocolEvent::TtsStart);
    assert_eq!(session.state().name(), "listening");

    session.on_event(
        RUN,
        ProtocolEvent::SttEnd {
            text: "hi".to_string(),
        },
    );
    assert_eq!(session.state().name(), "processing");

    session.on_event(RUN + 7, ProtocolEvent::RunEnd);
    assert_eq!(session.state().name(), "processing");
}

/// Consecutive runs reuse the connection; each run's id supersedes the
/// last and the state machine returns to idle in between.
#[test]
fn test_back_to_back_runs() {
    let mut session = connected_session();

    for run_id in 1..=3u64 {
        session.start_run(run_id, false);
        assert_eq!(session.state().name(), "listening");
        session.on_event(run_id, ProtocolEvent::RunEnd);
        assert_eq!(session.state(), SessionState::Idle);
    }
}

/// An error observed after run-end for the same run is still reported
/// as the run's outcome.
#[test]
fn test_error_supersedes_run_end_outcome() {
    let mut session = connected_session();
    session.start_run(RUN, false);
    session.on_event(RUN, ProtocolEvent::RunEnd);

    let effects = session.on_event(
        RUN,
        ProtocolEvent::Error {
            code: "tts-failed".to_string(),
            message: "synth backend crashed".to_string(),
        },
    );

    assert!(matches!(
        effects.as_slice(),
        [Effect::RunFinished { error: Some((code, _)) }] if code == "tts-failed"
    ));
}
