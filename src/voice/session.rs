//! Per-conversation client state.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::direction::{Direction, DirectionTable};
use super::playback::{PlaybackQueue, TurnId};

/// One active conversation: direction, voices, transcripts and the response
/// audio queue.
///
/// Created when the transport first connects; direction and voice change
/// only through a configuration update.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    table: Arc<DirectionTable>,
    direction: Direction,
    /// Voice per direction, indexed like [`Direction::ALL`].
    voices: [String; 2],
    pending_voices: [Option<String>; 2],
    input_transcript: String,
    output_transcript: String,
    turn: TurnId,
    accepting: Option<TurnId>,
    queue: Arc<PlaybackQueue>,
    last_error: Option<String>,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::EnToTh => 0,
        Direction::ThToEn => 1,
    }
}

impl Session {
    pub fn new(table: Arc<DirectionTable>, direction: Direction, queue: Arc<PlaybackQueue>) -> Self {
        let voices = Direction::ALL.map(|d| table.default_voice(d).to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            table,
            direction,
            voices,
            pending_voices: [None, None],
            input_transcript: String::new(),
            output_transcript: String::new(),
            turn: 0,
            accepting: None,
            queue,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bind the session to a direction. Only called as part of a config update.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn instructions(&self) -> &str {
        self.table.instructions(self.direction)
    }

    /// Voice for the current direction.
    pub fn voice(&self) -> &str {
        self.voice_for(self.direction)
    }

    pub fn voice_for(&self, direction: Direction) -> &str {
        &self.voices[slot(direction)]
    }

    /// Change a voice immediately. Only safe while idle.
    pub fn set_voice(&mut self, direction: Direction, voice: impl Into<String>) {
        self.voices[slot(direction)] = voice.into();
        self.pending_voices[slot(direction)] = None;
    }

    /// Defer a voice change until the current turn ends.
    pub fn queue_voice(&mut self, direction: Direction, voice: impl Into<String>) {
        self.pending_voices[slot(direction)] = Some(voice.into());
    }

    pub fn pending_voice(&self, direction: Direction) -> Option<&str> {
        self.pending_voices[slot(direction)].as_deref()
    }

    /// Promote queued voice changes. Returns true if anything changed.
    pub fn apply_pending_voice(&mut self) -> bool {
        let mut changed = false;
        for (voice, pending) in self.voices.iter_mut().zip(self.pending_voices.iter_mut()) {
            if let Some(next) = pending.take() {
                *voice = next;
                changed = true;
            }
        }
        changed
    }

    // ── Turns ──

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Start a new turn: new id, empty transcripts and queue, no audio accepted.
    pub fn begin_turn(&mut self) -> TurnId {
        self.turn += 1;
        self.accepting = None;
        self.input_transcript.clear();
        self.output_transcript.clear();
        self.queue.clear();
        self.turn
    }

    /// Accept response audio for the current turn.
    pub fn accept_responses(&mut self) {
        self.accepting = Some(self.turn);
    }

    /// Stop accepting response audio (after a cancel).
    pub fn stop_accepting(&mut self) {
        self.accepting = None;
    }

    /// Response output belongs to the current turn and has not been cancelled.
    pub fn is_accepting(&self) -> bool {
        self.accepting == Some(self.turn)
    }

    /// Queue an audio delta if a response is being accepted. Stale audio
    /// (after a cancel or turn change) is discarded and `false` returned.
    pub fn push_audio(&mut self, pcm: Vec<u8>) -> bool {
        if !self.is_accepting() {
            return false;
        }
        self.queue.push(self.turn, pcm);
        true
    }

    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    // ── Transcripts ──

    pub fn append_input_transcript(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.input_transcript.is_empty() {
            self.input_transcript.push(' ');
        }
        self.input_transcript.push_str(text);
    }

    pub fn append_output_delta(&mut self, delta: &str) {
        self.output_transcript.push_str(delta);
    }

    /// The final transcript supersedes the accumulated deltas.
    pub fn complete_output_transcript(&mut self, transcript: &str) {
        if transcript.len() >= self.output_transcript.len() {
            self.output_transcript.clear();
            self.output_transcript.push_str(transcript);
        }
    }

    pub fn input_transcript(&self) -> &str {
        &self.input_transcript
    }

    pub fn output_transcript(&self) -> &str {
        &self.output_transcript
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            Arc::new(DirectionTable::with_voices("shimmer", "alloy")),
            Direction::EnToTh,
            Arc::new(PlaybackQueue::new()),
        )
    }

    #[test]
    fn voices_start_at_table_defaults() {
        let mut s = session();
        assert_eq!(s.voice(), "shimmer");
        assert_eq!(s.voice_for(Direction::ThToEn), "alloy");

        s.set_direction(Direction::ThToEn);
        assert_eq!(s.voice(), "alloy");
        assert!(s.instructions().contains("The user speaks Thai"));
        assert!(!s.id().is_empty());
    }

    #[test]
    fn queued_voice_waits_for_apply() {
        let mut s = session();
        s.queue_voice(Direction::EnToTh, "verse");
        assert_eq!(s.voice(), "shimmer");
        assert_eq!(s.pending_voice(Direction::EnToTh), Some("verse"));

        assert!(s.apply_pending_voice());
        assert_eq!(s.voice(), "verse");
        assert!(!s.apply_pending_voice());

        s.queue_voice(Direction::ThToEn, "echo");
        s.set_voice(Direction::ThToEn, "coral");
        assert!(!s.apply_pending_voice());
        assert_eq!(s.voice_for(Direction::ThToEn), "coral");
    }

    #[test]
    fn audio_only_accepted_for_current_turn() {
        let mut s = session();
        assert!(!s.push_audio(vec![1]));

        s.begin_turn();
        s.accept_responses();
        assert!(s.push_audio(vec![1, 2]));
        assert_eq!(s.queue().queued_bytes(), 2);

        s.stop_accepting();
        assert!(!s.push_audio(vec![3]));

        s.accept_responses();
        s.begin_turn();
        assert!(!s.push_audio(vec![4]));
        assert!(s.queue().is_empty());
    }

    #[test]
    fn transcripts_reset_each_turn() {
        let mut s = session();
        s.begin_turn();
        s.append_input_transcript(" hello ");
        s.append_input_transcript("there");
        s.append_output_delta("สวัส");
        s.append_output_delta("ดี");
        assert_eq!(s.input_transcript(), "hello there");
        assert_eq!(s.output_transcript(), "สวัสดี");

        s.complete_output_transcript("สวัสดีครับ");
        assert_eq!(s.output_transcript(), "สวัสดีครับ");

        let turn = s.begin_turn();
        assert_eq!(turn, 2);
        assert!(s.input_transcript().is_empty());
        assert!(s.output_transcript().is_empty());
    }
}
