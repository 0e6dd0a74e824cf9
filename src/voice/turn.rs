//! Turn-taking state machine.
//!
//! Decides when the microphone is open and when the model may speak. Every
//! state change goes through [`TurnMachine::handle`], which returns the
//! [`Effect`]s the engine must execute, in order. The machine itself never
//! touches I/O.

use std::fmt;

use super::direction::Direction;

/// Conversation turn state. No state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    /// Transport is being opened for a capture in this direction.
    Connecting(Direction),
    /// Microphone open; exactly one direction is captured at a time.
    Listening(Direction),
    /// User turn closed; waiting for the first audio of the response.
    Processing,
    /// Response audio is playing.
    Speaking,
    /// Fatal upstream or transport error. Leaves only via an explicit capture.
    Error,
}

impl TurnState {
    /// A capture or response is in progress, so configuration must not change.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Connecting(_) | Self::Listening(_) | Self::Processing | Self::Speaking
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting(d) => write!(f, "connecting({d})"),
            Self::Listening(d) => write!(f, "listening({d})"),
            Self::Processing => f.write_str("processing"),
            Self::Speaking => f.write_str("speaking"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// User asked to talk in a direction (push-to-talk press).
    CaptureRequested(Direction),
    /// The transport opened by [`Effect::OpenTransport`] is up.
    TransportConnected,
    /// User ended their turn (push-to-talk release).
    UserReleased,
    /// Server VAD: the user started speaking.
    SpeechStarted,
    /// Server VAD: the user stopped speaking; the server commits the turn.
    SpeechStopped,
    /// An audio delta for the current turn was queued.
    AudioDelta,
    /// `response.done` arrived. `playback_idle` is true when nothing is queued
    /// or playing.
    ResponseDone { playback_idle: bool },
    /// The playback driver emptied the queue.
    PlaybackDrained,
    /// The microphone could not be opened or stopped delivering audio.
    CaptureFailed,
    /// A reportable upstream `error` event.
    UpstreamError(String),
    /// Transport failed or closed.
    TransportFailed(String),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Connect a fresh transport, dropping any previous one.
    OpenTransport,
    /// `response.cancel` + `input_audio_buffer.clear`, settle delay, then
    /// configure the direction.
    SafeConfigUpdate(Direction),
    /// Begin forwarding capture chunks.
    StartCapture(Direction),
    StopCapture,
    /// `input_audio_buffer.commit` + `response.create`.
    CommitAndRespond,
    /// Accept response audio for the current turn.
    AwaitResponse,
    /// Start draining the playback queue if it is idle.
    BeginPlayback,
    /// Stop playback and clear the queue.
    StopPlayback,
    /// `response.cancel` + `input_audio_buffer.clear` and stop accepting audio.
    CancelResponse,
    /// Stop accepting response output without telling the upstream.
    DiscardResponse,
    /// Start a new turn: bump the turn id, reset transcripts and the queue.
    AdvanceTurn,
    /// Apply a voice change that was queued while busy.
    ApplyPendingVoice,
    /// Report a fatal error to the user.
    SurfaceError(String),
}

/// The machine. Holds only what the transition table needs.
#[derive(Debug, Clone)]
pub struct TurnMachine {
    state: TurnState,
    /// Direction of the current or most recent capture.
    direction: Direction,
    connected: bool,
    response_done: bool,
}

impl TurnMachine {
    pub fn new(initial_direction: Direction) -> Self {
        Self {
            state: TurnState::Idle,
            direction: initial_direction,
            connected: false,
            response_done: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Apply one event and return the effects to run, in order.
    pub fn handle(&mut self, event: TurnEvent) -> Vec<Effect> {
        let from = self.state;
        let effects = self.transition(event);
        if self.state != from {
            tracing::debug!(from = %from, to = %self.state, "Turn state changed");
        }
        effects
    }

    fn transition(&mut self, event: TurnEvent) -> Vec<Effect> {
        use Effect as E;
        use TurnState as S;

        match (self.state, event) {
            // ── Failures win from any state ──
            (_, TurnEvent::TransportFailed(message)) => {
                self.connected = false;
                self.enter(S::Error);
                vec![
                    E::StopCapture,
                    E::DiscardResponse,
                    E::StopPlayback,
                    E::SurfaceError(message),
                ]
            }
            // The transport is still up; make the model stop streaming too.
            (_, TurnEvent::UpstreamError(message)) => {
                self.enter(S::Error);
                vec![
                    E::StopCapture,
                    E::CancelResponse,
                    E::StopPlayback,
                    E::SurfaceError(message),
                ]
            }

            // ── Starting a capture ──
            (S::Idle, TurnEvent::CaptureRequested(d)) if self.connected => self.start_listening(d),
            (S::Idle | S::Error, TurnEvent::CaptureRequested(d)) => {
                self.direction = d;
                self.connected = false;
                self.enter(S::Connecting(d));
                vec![E::OpenTransport]
            }
            (S::Connecting(_), TurnEvent::CaptureRequested(d)) => {
                self.direction = d;
                self.enter(S::Connecting(d));
                vec![]
            }
            (S::Connecting(d), TurnEvent::TransportConnected) => {
                self.connected = true;
                self.start_listening(d)
            }

            // ── Closing the user's turn ──
            (S::Listening(_), TurnEvent::SpeechStopped) => {
                self.enter(S::Processing);
                vec![E::StopCapture, E::AwaitResponse]
            }
            (S::Listening(_), TurnEvent::UserReleased) => {
                self.enter(S::Processing);
                vec![E::StopCapture, E::CommitAndRespond, E::AwaitResponse]
            }
            (S::Listening(current), TurnEvent::CaptureRequested(d)) if d != current => {
                // Other side pressed: close this turn, the caller re-issues the start.
                self.enter(S::Processing);
                vec![E::StopCapture, E::CommitAndRespond, E::AwaitResponse]
            }

            // Nothing usable was captured; the transport stays up.
            (S::Listening(_), TurnEvent::CaptureFailed) => {
                self.enter(S::Idle);
                vec![E::StopCapture, E::ApplyPendingVoice]
            }

            // ── Response streaming ──
            (S::Processing | S::Speaking, TurnEvent::AudioDelta) => {
                if self.state == S::Processing {
                    self.enter(S::Speaking);
                }
                vec![E::BeginPlayback]
            }
            (S::Processing, TurnEvent::ResponseDone { .. }) => self.finish_turn(),
            (S::Speaking, TurnEvent::ResponseDone { playback_idle }) => {
                if playback_idle {
                    self.finish_turn()
                } else {
                    self.response_done = true;
                    vec![]
                }
            }
            (S::Speaking, TurnEvent::PlaybackDrained) if self.response_done => self.finish_turn(),

            // ── Interruptions ──
            (S::Processing | S::Speaking, TurnEvent::SpeechStarted) => {
                let d = self.direction;
                self.enter(S::Listening(d));
                vec![
                    E::StopPlayback,
                    E::CancelResponse,
                    E::AdvanceTurn,
                    E::StartCapture(d),
                ]
            }
            (S::Processing | S::Speaking, TurnEvent::CaptureRequested(d)) => {
                self.direction = d;
                self.enter(S::Listening(d));
                vec![
                    E::StopPlayback,
                    E::AdvanceTurn,
                    E::SafeConfigUpdate(d),
                    E::StartCapture(d),
                ]
            }

            (state, event) => {
                tracing::trace!(state = %state, event = ?event, "Event ignored in this state");
                vec![]
            }
        }
    }

    fn start_listening(&mut self, d: Direction) -> Vec<Effect> {
        self.direction = d;
        self.enter(TurnState::Listening(d));
        vec![
            Effect::AdvanceTurn,
            Effect::SafeConfigUpdate(d),
            Effect::StartCapture(d),
        ]
    }

    fn finish_turn(&mut self) -> Vec<Effect> {
        self.enter(TurnState::Idle);
        vec![Effect::ApplyPendingVoice]
    }

    fn enter(&mut self, state: TurnState) {
        self.state = state;
        self.response_done = false;
    }
}
