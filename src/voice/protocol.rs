//! Realtime event protocol: outbound client events, inbound server events,
//! and the relay's `set_direction` control message.
//!
//! ## Wire overview
//!
//! 1. **Configure**: `session.update` with instructions, voice, PCM16 formats,
//!    transcription model and server VAD
//! 2. **Stream**: `input_audio_buffer.append` (base64 PCM16 24kHz)
//! 3. **End turn**: `input_audio_buffer.commit` + `response.create` when the
//!    client (not server VAD) decides the user is done
//! 4. **Cancel**: `response.cancel` + `input_audio_buffer.clear`
//!
//! Server events are decoded by their `type` discriminator. Unknown types are
//! surfaced as [`ServerEvent::Other`] and ignored by the dispatcher so new
//! upstream event types never break an existing client.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::codec;
use super::direction::Direction;

// ── Session settings ───────────────────────────────────────────────

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TurnDetection {
    /// Activation threshold in `0.0..=1.0`; higher needs louder speech.
    pub threshold: f32,
    /// Audio kept from before detected speech start.
    pub prefix_padding_ms: u32,
    /// Silence required before the server declares end of speech.
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Direction-independent part of every `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionSettings {
    /// Model used for `conversation.item.input_audio_transcription.*`.
    pub transcription_model: String,
    /// Sampling temperature (the realtime API accepts 0.6..=1.2).
    pub temperature: f32,
    pub turn_detection: TurnDetection,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transcription_model: "whisper-1".to_string(),
            temperature: 0.8,
            turn_detection: TurnDetection::default(),
        }
    }
}

// ── Outbound: session.update ───────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub session: SessionUpdatePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdatePayload {
    pub modalities: [&'static str; 2],
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: ServerVad,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerVad {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Build the `session.update` event binding a prompt and voice to the session.
pub fn session_update(instructions: &str, voice: &str, settings: &SessionSettings) -> SessionUpdate {
    SessionUpdate {
        kind: "session.update",
        session: SessionUpdatePayload {
            modalities: ["text", "audio"],
            instructions: instructions.to_string(),
            voice: voice.to_string(),
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            input_audio_transcription: InputAudioTranscription {
                model: settings.transcription_model.clone(),
            },
            turn_detection: ServerVad {
                kind: "server_vad",
                threshold: settings.turn_detection.threshold,
                prefix_padding_ms: settings.turn_detection.prefix_padding_ms,
                silence_duration_ms: settings.turn_detection.silence_duration_ms,
            },
            temperature: settings.temperature,
        },
    }
}

impl SessionUpdate {
    pub fn to_json(&self) -> String {
        // Plain structs of strings and numbers always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Outbound: buffer / response control ────────────────────────────

/// `input_audio_buffer.append` carrying one capture chunk.
pub fn audio_append(pcm: &[u8]) -> String {
    serde_json::json!({
        "type": "input_audio_buffer.append",
        "audio": codec::encode_base64(pcm),
    })
    .to_string()
}

/// `input_audio_buffer.commit`: close the user's turn.
pub fn audio_commit() -> String {
    serde_json::json!({"type": "input_audio_buffer.commit"}).to_string()
}

/// `response.create`: ask for a spoken + text translation of the committed turn.
pub fn response_create() -> String {
    serde_json::json!({
        "type": "response.create",
        "response": {"modalities": ["text", "audio"]},
    })
    .to_string()
}

/// `response.cancel`: stop the in-flight response (barge-in / safe update).
pub fn response_cancel() -> String {
    serde_json::json!({"type": "response.cancel"}).to_string()
}

/// `input_audio_buffer.clear`: drop uncommitted input audio.
pub fn audio_clear() -> String {
    serde_json::json!({"type": "input_audio_buffer.clear"}).to_string()
}

// ── Client → relay control ─────────────────────────────────────────

/// Control messages consumed by the relay and never forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Switch the session to a direction, optionally overriding the voice.
    #[serde(rename = "set_direction")]
    SetDirection {
        direction: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `type` of the only relay control message.
pub const SET_DIRECTION: &str = "set_direction";

/// Recognise a relay control message inside a client text frame.
///
/// `None` means the frame is ordinary client traffic. A frame typed
/// `set_direction` whose body does not parse is `Some(Err(..))`: it is still
/// a control frame and must not reach the model.
pub fn parse_control(text: &str) -> Option<Result<ControlMessage, DecodeError>> {
    // Cheap pre-check: audio appends dominate the client stream.
    if !text.contains(SET_DIRECTION) || peek_event_type(text).as_deref() != Some(SET_DIRECTION) {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|e| DecodeError::Control(e.to_string())))
}

// ── Inbound: server events ─────────────────────────────────────────

/// A decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `session.created` / `session.updated`.
    SessionReady,
    /// Server VAD detected the start of user speech.
    SpeechStarted,
    /// Server VAD detected the end of user speech.
    SpeechStopped,
    /// Final transcription of the user's committed audio.
    InputTranscript { text: String },
    /// Incremental transcript of the model's spoken output.
    OutputTranscriptDelta { text: String },
    /// Full transcript of the model's spoken output for this response.
    OutputTranscriptDone { text: String },
    /// One PCM16 chunk of synthesized speech.
    AudioDelta { pcm: Vec<u8> },
    /// The model finished streaming audio for this response.
    AudioDone,
    /// The response is complete (also sent for cancelled responses).
    ResponseDone,
    /// `error` event.
    Error { message: String },
    /// Any event type this client does not act on.
    Other { event_type: String },
}

/// Malformed inbound frame or control message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("event has no `type` field")]
    MissingType,
    #[error("invalid `set_direction`: {0}")]
    Control(String),
    #[error("`{event_type}` is missing field `{field}`")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
    #[error("`{event_type}` carries invalid audio: {reason}")]
    Audio {
        event_type: &'static str,
        reason: String,
    },
}

/// Decode one upstream text frame.
pub fn parse_server_event(json_text: &str) -> Result<ServerEvent, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(json_text).map_err(|e| DecodeError::Json(e.to_string()))?;

    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingType)?;

    let text_field = |event_type: &'static str, field: &'static str| {
        value
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(DecodeError::MissingField { event_type, field })
    };

    let event = match event_type {
        "session.created" | "session.updated" => ServerEvent::SessionReady,
        "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
        "conversation.item.input_audio_transcription.completed" => ServerEvent::InputTranscript {
            text: text_field(
                "conversation.item.input_audio_transcription.completed",
                "transcript",
            )?,
        },
        "response.audio_transcript.delta" => ServerEvent::OutputTranscriptDelta {
            text: text_field("response.audio_transcript.delta", "delta")?,
        },
        "response.audio_transcript.done" => ServerEvent::OutputTranscriptDone {
            text: text_field("response.audio_transcript.done", "transcript")?,
        },
        "response.audio.delta" => {
            let data = text_field("response.audio.delta", "delta")?;
            let pcm = codec::decode_base64(&data).map_err(|e| DecodeError::Audio {
                event_type: "response.audio.delta",
                reason: e.to_string(),
            })?;
            ServerEvent::AudioDelta { pcm }
        }
        "response.audio.done" => ServerEvent::AudioDone,
        "response.done" => ServerEvent::ResponseDone,
        "error" => ServerEvent::Error {
            message: value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown upstream error")
                .to_string(),
        },
        other => ServerEvent::Other {
            event_type: other.to_string(),
        },
    };

    Ok(event)
}

/// Look at an event's `type` without a full decode (used by the relay for logging).
pub fn peek_event_type(json_text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Typed {
        #[serde(rename = "type")]
        kind: String,
    }
    serde_json::from_str::<Typed>(json_text).ok().map(|t| t.kind)
}
