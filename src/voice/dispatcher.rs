//! Routes decoded upstream events to the session, the audio queue and the
//! turn machine.

use super::protocol::{self, ServerEvent};
use super::session::Session;
use super::turn::TurnEvent;

/// Substring marking benign cancellation races ("Cancellation failed: no
/// active response found"). Heuristic: the upstream sends no error code for it.
const IGNORABLE_ERROR_MARKER: &str = "no active response";

/// How an upstream `error` event is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Expected side effect of a best-effort cancel. Dropped silently.
    Ignorable,
    /// Moves the session to Error with the message stored verbatim.
    Reportable(String),
}

impl UpstreamError {
    pub fn classify(message: &str) -> Self {
        if message.to_lowercase().contains(IGNORABLE_ERROR_MARKER) {
            Self::Ignorable
        } else {
            Self::Reportable(message.to_string())
        }
    }
}

/// What the engine should do with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Feed the turn machine.
    Turn(TurnEvent),
    /// `response.done`; the engine adds the playback state.
    ResponseDone,
    /// `response.audio.done`; no more audio for this response.
    AudioDone,
    /// Final user transcript for the turn.
    InputTranscript(String),
    /// Incremental translated transcript.
    OutputTranscriptDelta(String),
    /// Final translated transcript.
    OutputTranscript(String),
    /// Nothing to do (unknown type, stale audio, ignorable error, bad frame).
    Nothing,
}

/// Decode one upstream text frame and apply its session-level effects.
pub fn dispatch(text: &str, session: &mut Session) -> Routed {
    let event = match protocol::parse_server_event(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "Dropping malformed upstream frame");
            return Routed::Nothing;
        }
    };

    match event {
        ServerEvent::SessionReady => {
            tracing::debug!(session_id = %session.id(), "Upstream session configured");
            Routed::Nothing
        }
        ServerEvent::SpeechStarted => Routed::Turn(TurnEvent::SpeechStarted),
        ServerEvent::SpeechStopped => Routed::Turn(TurnEvent::SpeechStopped),
        ServerEvent::InputTranscript { text } => {
            session.append_input_transcript(&text);
            Routed::InputTranscript(text)
        }
        ServerEvent::OutputTranscriptDelta { .. } | ServerEvent::OutputTranscriptDone { .. }
            if !session.is_accepting() =>
        {
            tracing::debug!(session_id = %session.id(), "Discarding transcript for a cancelled turn");
            Routed::Nothing
        }
        ServerEvent::OutputTranscriptDelta { text } => {
            session.append_output_delta(&text);
            Routed::OutputTranscriptDelta(text)
        }
        ServerEvent::OutputTranscriptDone { text } => {
            session.complete_output_transcript(&text);
            Routed::OutputTranscript(text)
        }
        ServerEvent::AudioDelta { pcm } => {
            let bytes = pcm.len();
            if session.push_audio(pcm) {
                Routed::Turn(TurnEvent::AudioDelta)
            } else {
                tracing::debug!(session_id = %session.id(), bytes, "Discarding audio for a cancelled turn");
                Routed::Nothing
            }
        }
        ServerEvent::AudioDone => Routed::AudioDone,
        ServerEvent::ResponseDone => Routed::ResponseDone,
        ServerEvent::Error { message } => match UpstreamError::classify(&message) {
            UpstreamError::Ignorable => {
                tracing::debug!(session_id = %session.id(), message = %message, "Ignoring benign upstream error");
                Routed::Nothing
            }
            UpstreamError::Reportable(message) => {
                tracing::error!(session_id = %session.id(), message = %message, "Upstream error");
                Routed::Turn(TurnEvent::UpstreamError(message))
            }
        },
        ServerEvent::Other { event_type } => {
            tracing::trace!(session_id = %session.id(), event_type = %event_type, "Ignoring upstream event");
            Routed::Nothing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec;
    use crate::voice::direction::{Direction, DirectionTable};
    use crate::voice::playback::PlaybackQueue;
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(
            Arc::new(DirectionTable::default()),
            Direction::EnToTh,
            Arc::new(PlaybackQueue::new()),
        )
    }

    fn audio_delta(len: usize) -> String {
        format!(
            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
            codec::encode_base64(&vec![0u8; len])
        )
    }

    #[test]
    fn classify_is_case_insensitive_substring() {
        assert_eq!(
            UpstreamError::classify("Cancellation failed: No Active Response found"),
            UpstreamError::Ignorable
        );
        assert_eq!(
            UpstreamError::classify("Invalid voice"),
            UpstreamError::Reportable("Invalid voice".to_string())
        );
    }

    #[test]
    fn audio_goes_to_queue_only_when_accepted() {
        let mut s = session();
        assert_eq!(dispatch(&audio_delta(4), &mut s), Routed::Nothing);
        assert!(s.queue().is_empty());

        s.begin_turn();
        s.accept_responses();
        assert_eq!(
            dispatch(&audio_delta(4800), &mut s),
            Routed::Turn(TurnEvent::AudioDelta)
        );
        assert_eq!(s.queue().queued_bytes(), 4800);
    }

    #[test]
    fn transcripts_update_session() {
        let mut s = session();
        s.begin_turn();
        s.accept_responses();
        assert_eq!(
            dispatch(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"good morning"}"#,
                &mut s
            ),
            Routed::InputTranscript("good morning".to_string())
        );
        dispatch(r#"{"type":"response.audio_transcript.delta","delta":"อรุณ"}"#, &mut s);
        dispatch(r#"{"type":"response.audio_transcript.delta","delta":"สวัสดิ์"}"#, &mut s);
        assert_eq!(s.input_transcript(), "good morning");
        assert_eq!(s.output_transcript(), "อรุณสวัสดิ์");
    }

    #[test]
    fn late_transcript_after_barge_in_is_dropped() {
        let mut s = session();
        s.begin_turn();
        s.accept_responses();
        dispatch(r#"{"type":"response.audio_transcript.delta","delta":"OLD "}"#, &mut s);
        assert_eq!(s.output_transcript(), "OLD ");

        s.stop_accepting();
        s.begin_turn();
        assert_eq!(
            dispatch(r#"{"type":"response.audio_transcript.delta","delta":"LATE"}"#, &mut s),
            Routed::Nothing
        );
        assert_eq!(
            dispatch(
                r#"{"type":"response.audio_transcript.done","transcript":"OLD LATE"}"#,
                &mut s
            ),
            Routed::Nothing
        );
        assert_eq!(s.output_transcript(), "");

        // The user's own words are still recorded while listening.
        assert_eq!(
            dispatch(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"wait"}"#,
                &mut s
            ),
            Routed::InputTranscript("wait".to_string())
        );
    }

    #[test]
    fn errors_are_classified() {
        let mut s = session();
        assert_eq!(
            dispatch(
                r#"{"type":"error","error":{"message":"Cancellation failed: no active response found"}}"#,
                &mut s
            ),
            Routed::Nothing
        );
        assert_eq!(
            dispatch(r#"{"type":"error","error":{"message":"Session expired"}}"#, &mut s),
            Routed::Turn(TurnEvent::UpstreamError("Session expired".to_string()))
        );
    }

    #[test]
    fn boundaries_unknown_and_malformed() {
        let mut s = session();
        assert_eq!(
            dispatch(r#"{"type":"input_audio_buffer.speech_started"}"#, &mut s),
            Routed::Turn(TurnEvent::SpeechStarted)
        );
        assert_eq!(
            dispatch(r#"{"type":"response.audio.done"}"#, &mut s),
            Routed::AudioDone
        );
        assert_eq!(
            dispatch(r#"{"type":"response.done"}"#, &mut s),
            Routed::ResponseDone
        );
        assert_eq!(
            dispatch(r#"{"type":"response.output_item.added"}"#, &mut s),
            Routed::Nothing
        );
        assert_eq!(dispatch("{not json", &mut s), Routed::Nothing);
    }
}
