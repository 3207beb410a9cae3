use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// JSON messages received from the remote host.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth_required")]
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    #[serde(rename = "auth_ok")]
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    #[serde(rename = "auth_invalid")]
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<ResultError>,
    },
    #[serde(rename = "event")]
    Event { id: u64, event: PipelineEvent },
    #[serde(rename = "pong")]
    Pong { id: u64 },
}

#[derive(Debug, Deserialize)]
pub struct ResultError {
    pub code: String,
    pub message: String,
}

/// One pipeline event as it appears on the wire. The kind is kept as a
/// string so unknown stages degrade to a logged violation instead of a
/// parse failure.
#[derive(Debug, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// JSON messages sent to the remote host.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { access_token: String },
    #[serde(rename = "assist_pipeline/pipeline/list")]
    PipelineList { id: u64 },
    #[serde(rename = "assist_pipeline/run")]
    RunPipeline {
        id: u64,
        start_stage: String,
        end_stage: String,
        input: RunInput,
        #[serde(skip_serializing_if = "Option::is_none")]
        pipeline: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct RunInput {
    pub sample_rate: u32,
    pub timeout: u32,
    pub audio_seconds_to_buffer: f32,
}

/// Events the session state machine consumes, decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    RunStarted {
        stt_handler_id: u8,
        tts_handler_id: u8,
    },
    WakeWordDetected,
    SttStart,
    SttEnd {
        text: String,
    },
    TtsStart,
    TtsAudioChunk(Bytes),
    TtsEnd,
    RunEnd,
    Error {
        code: String,
        message: String,
    },
}

/// Pipeline stages the satellite forwards without reacting to.
pub fn is_opaque_event(kind: &str) -> bool {
    matches!(
        kind,
        "wake_word-start" | "stt-vad-start" | "stt-vad-end" | "intent-start" | "intent-end"
    )
}

impl ProtocolEvent {
    /// Maps a wire event onto the session's vocabulary. `None` for
    /// kinds the satellite does not react to; callers distinguish
    /// opaque stages from genuinely unknown kinds via
    /// [`is_opaque_event`].
    pub fn from_wire(event: &PipelineEvent) -> Option<Self> {
        match event.kind.as_str() {
            "run-start" => {
                let stt_handler_id = event
                    .data
                    .pointer("/runner_data/stt_binary_handler_id")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as u8;
                let tts_handler_id = event
                    .data
                    .pointer("/runner_data/tts_binary_handler_id")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u8)
                    .unwrap_or(stt_handler_id.wrapping_add(1));
                Some(ProtocolEvent::RunStarted {
                    stt_handler_id,
                    tts_handler_id,
                })
            }
            "wake_word-end" => Some(ProtocolEvent::WakeWordDetected),
            "stt-start" => Some(ProtocolEvent::SttStart),
            "stt-end" => {
                let text = event
                    .data
                    .pointer("/stt_output/text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(ProtocolEvent::SttEnd { text })
            }
            "tts-start" => Some(ProtocolEvent::TtsStart),
            "tts-end" => Some(ProtocolEvent::TtsEnd),
            "run-end" => Some(ProtocolEvent::RunEnd),
            "error" => {
                let code = event
                    .data
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let message = event
                    .data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(ProtocolEvent::Error { code, message })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_event(json: &str) -> PipelineEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_auth_required() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"auth_required","ha_version":"2023.10"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::AuthRequired { .. }));
    }

    #[test]
    fn test_parse_auth_ok_without_version() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"auth_ok"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::AuthOk { ha_version: None }));
    }

    #[test]
    fn test_parse_auth_invalid() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"auth_invalid","message":"bad token"}"#).unwrap();
        match msg {
            ServerMessage::AuthInvalid { message } => {
                assert_eq!(message.as_deref(), Some("bad token"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_success() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"result","id":3,"success":true,"result":{"pipelines":[]}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Result { id, success, .. } => {
                assert_eq!(id, 3);
                assert!(success);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_failure_with_error() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"result","id":4,"success":false,"error":{"code":"unknown_command","message":"nope"}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Result { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.unwrap().code, "unknown_command");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_event_envelope() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"event","id":7,"event":{"type":"run-start","data":{"runner_data":{"stt_binary_handler_id":1}}}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Event { id, event } => {
                assert_eq!(id, 7);
                assert_eq!(event.kind, "run-start");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        let result: Result<ServerMessage, _> =
            serde_json::from_str(r#"{"type":"surprise","id":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_auth() {
        let msg = ClientMessage::Auth {
            access_token: "tok".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"auth","access_token":"tok"}"#);
    }

    #[test]
    fn test_serialize_pipeline_list() {
        let msg = ClientMessage::PipelineList { id: 1 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"assist_pipeline/pipeline/list","id":1}"#);
    }

    #[test]
    fn test_serialize_run_pipeline_omits_missing_pipeline() {
        let msg = ClientMessage::RunPipeline {
            id: 2,
            start_stage: "wake_word".to_string(),
            end_stage: "tts".to_string(),
            input: RunInput {
                sample_rate: 16000,
                timeout: 3,
                audio_seconds_to_buffer: 0.0,
            },
            pipeline: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"assist_pipeline/run""#));
        assert!(json.contains(r#""start_stage":"wake_word""#));
        assert!(json.contains(r#""sample_rate":16000"#));
        assert!(!json.contains("pipeline\""));
    }

    #[test]
    fn test_run_start_maps_handler_ids() {
        let event = wire_event(
            r#"{"type":"run-start","data":{"runner_data":{"stt_binary_handler_id":4,"tts_binary_handler_id":9}}}"#,
        );
        assert_eq!(
            ProtocolEvent::from_wire(&event),
            Some(ProtocolEvent::RunStarted {
                stt_handler_id: 4,
                tts_handler_id: 9
            })
        );
    }

    #[test]
    fn test_run_start_defaults_tts_handler() {
        let event = wire_event(
            r#"{"type":"run-start","data":{"runner_data":{"stt_binary_handler_id":4}}}"#,
        );
        assert_eq!(
            ProtocolEvent::from_wire(&event),
            Some(ProtocolEvent::RunStarted {
                stt_handler_id: 4,
                tts_handler_id: 5
            })
        );
    }

    #[test]
    fn test_wake_word_end_maps_to_detection() {
        let event = wire_event(r#"{"type":"wake_word-end","data":{}}"#);
        assert_eq!(
            ProtocolEvent::from_wire(&event),
            Some(ProtocolEvent::WakeWordDetected)
        );
    }

    #[test]
    fn test_stt_end_extracts_text() {
        let event =
            wire_event(r#"{"type":"stt-end","data":{"stt_output":{"text":"turn on the light"}}}"#);
        assert_eq!(
            ProtocolEvent::from_wire(&event),
            Some(ProtocolEvent::SttEnd {
                text: "turn on the light".to_string()
            })
        );
    }

    #[test]
    fn test_error_extracts_code_and_message() {
        let event =
            wire_event(r#"{"type":"error","data":{"code":"stt-no-text","message":"no speech"}}"#);
        assert_eq!(
            ProtocolEvent::from_wire(&event),
            Some(ProtocolEvent::Error {
                code: "stt-no-text".to_string(),
                message: "no speech".to_string()
            })
        );
    }

    #[test]
    fn test_intent_events_are_opaque() {
        for kind in ["intent-start", "intent-end", "wake_word-start"] {
            let event = wire_event(&format!(r#"{{"type":"{}","data":{{}}}}"#, kind));
            assert_eq!(ProtocolEvent::from_wire(&event), None);
            assert!(is_opaque_event(kind));
        }
    }

    #[test]
    fn test_unknown_event_is_not_opaque() {
        let event = wire_event(r#"{"type":"mystery-stage","data":{}}"#);
        assert_eq!(ProtocolEvent::from_wire(&event), None);
        assert!(!is_opaque_event("mystery-stage"));
    }
}
