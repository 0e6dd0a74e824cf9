//! Client-side conversation engine.
//!
//! One cooperative loop per conversation. It multiplexes user commands,
//! inbound frames, capture chunks, the playback timer and the config settle
//! deadline with `tokio::select!`; every turn transition goes through the [`TurnMachine`]
//! and its effects are executed here, in order.
//!
//! The same engine talks to the model directly or through the relay; only
//! the [`Connector`] differs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::capture::{CaptureError, CaptureSource};
use super::direction::{Direction, DirectionTable};
use super::dispatcher::{self, Routed};
use super::playback::{AudioSink, DrainOutcome, PlaybackDriver, PlaybackQueue};
use super::protocol::{self, ControlMessage, SessionSettings};
use super::session::Session;
use super::transport::{Connector, Frame, FrameSink, FrameStream, TransportError, TransportMode};
use super::turn::{Effect, TurnEvent, TurnMachine, TurnState};

// ── Public surface ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_direction: Direction,
    pub settings: SessionSettings,
    /// Pause between `response.cancel`/`input_audio_buffer.clear` and the
    /// following configuration message.
    pub settle_delay: Duration,
    /// How long the first batch of a response is buffered before playback.
    pub prebuffer: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_direction: Direction::EnToTh,
            settings: SessionSettings::default(),
            settle_delay: Duration::from_millis(150),
            prebuffer: Duration::from_millis(120),
        }
    }
}

/// User intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Push-to-talk pressed for a direction.
    StartCapture(Direction),
    /// Push-to-talk released.
    Release,
    /// Select a voice for a direction. Deferred while a turn is in progress.
    SetVoice { direction: Direction, voice: String },
    Shutdown,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged(TurnState),
    InputTranscript(String),
    OutputTranscriptDelta(String),
    OutputTranscript(String),
    /// A batch of translated audio was handed to the sink.
    Played { bytes: usize },
    /// Fatal upstream or transport error; the engine is in `Error`.
    Error(String),
    /// The microphone failed; the connection is kept.
    CaptureError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("conversation engine has stopped")]
    Stopped,
}

/// Cloneable command handle for a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn start_capture(&self, direction: Direction) -> Result<(), EngineError> {
        self.send(EngineCommand::StartCapture(direction)).await
    }

    pub async fn release(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Release).await
    }

    pub async fn set_voice(&self, direction: Direction, voice: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::SetVoice {
            direction,
            voice: voice.into(),
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Shutdown).await
    }
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct ConversationEngine {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    settle_delay: Duration,
    machine: TurnMachine,
    session: Session,
    playback: PlaybackDriver,
    capture: Box<dyn CaptureSource>,
    capturing: bool,
    sink: Option<Box<dyn FrameSink>>,
    stream: Option<Box<dyn FrameStream>>,
    /// First send failure since the last check; turned into `TransportFailed`.
    failure: Option<String>,
    /// Config update waiting out the settle delay, with the effects queued
    /// behind it.
    deferred: Option<DeferredConfig>,
    appended: u64,
    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl ConversationEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        table: Arc<DirectionTable>,
        capture: Box<dyn CaptureSource>,
        sink: Box<dyn AudioSink>,
        config: EngineConfig,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(PlaybackQueue::new());

        let engine = Self {
            connector,
            settings: config.settings,
            settle_delay: config.settle_delay,
            machine: TurnMachine::new(config.initial_direction),
            session: Session::new(table, config.initial_direction, queue.clone()),
            playback: PlaybackDriver::new(queue, sink, config.prebuffer),
            capture,
            capturing: false,
            sink: None,
            stream: None,
            failure: None,
            deferred: None,
            appended: 0,
            commands: command_rx,
            events: event_tx,
        };
        (engine, EngineHandle { commands: command_tx }, event_rx)
    }

    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    /// Run until `Shutdown` or until every handle is dropped. Returns the
    /// session so the caller can inspect transcripts and errors.
    pub async fn run(mut self) -> Session {
        tracing::info!(
            session_id = %self.session.id(),
            mode = ?self.connector.mode(),
            "Conversation engine started"
        );

        loop {
            let deadline = self.playback.deadline();
            let settle = self.deferred.as_ref().map(|d| d.at);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                inbound = next_frame(&mut self.stream) => self.on_inbound(inbound).await,
                chunk = self.capture.next_chunk(), if self.capturing => self.on_capture(chunk).await,
                () = sleep_until(deadline), if deadline.is_some() => self.on_playback_timer().await,
                () = sleep_until(settle), if settle.is_some() => self.on_settled().await,
            }
        }

        if self.capturing {
            self.capture.stop().await;
            self.capturing = false;
        }
        self.playback.stop().await;
        self.close_transport().await;
        tracing::info!(
            session_id = %self.session.id(),
            turns = self.session.turn(),
            started_at = %self.session.created_at(),
            "Conversation engine stopped"
        );
        self.session
    }

    // ── Inputs ──

    async fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartCapture(direction) => {
                self.feed(TurnEvent::CaptureRequested(direction)).await;
            }
            EngineCommand::Release => self.feed(TurnEvent::UserReleased).await,
            EngineCommand::SetVoice { direction, voice } => {
                if self.machine.state().is_busy() {
                    tracing::info!(session_id = %self.session.id(), voice = %voice, direction = %direction, "Voice change queued until turn ends");
                    self.session.queue_voice(direction, voice);
                } else {
                    self.session.set_voice(direction, voice);
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    async fn on_inbound(&mut self, inbound: Option<Result<Frame, TransportError>>) {
        match inbound {
            Some(Ok(Frame::Text(text))) => self.on_text(&text).await,
            Some(Ok(Frame::Binary(bytes))) => {
                tracing::debug!(session_id = %self.session.id(), bytes = bytes.len(), "Ignoring binary frame");
            }
            Some(Err(e)) => {
                tracing::error!(session_id = %self.session.id(), error = %e, "Transport failed");
                self.close_transport().await;
                self.feed(TurnEvent::TransportFailed(e.to_string())).await;
            }
            None => {
                tracing::warn!(session_id = %self.session.id(), "Transport closed by peer");
                self.close_transport().await;
                self.feed(TurnEvent::TransportFailed("connection closed".to_string()))
                    .await;
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        match dispatcher::dispatch(text, &mut self.session) {
            Routed::Turn(event) => self.feed(event).await,
            Routed::ResponseDone => {
                self.session.stop_accepting();
                let playback_idle = self.playback.is_idle();
                self.feed(TurnEvent::ResponseDone { playback_idle }).await;
            }
            Routed::AudioDone => self.playback.flush(),
            Routed::InputTranscript(text) => self.emit(EngineEvent::InputTranscript(text)),
            Routed::OutputTranscriptDelta(text) => self.emit(EngineEvent::OutputTranscriptDelta(text)),
            Routed::OutputTranscript(text) => self.emit(EngineEvent::OutputTranscript(text)),
            Routed::Nothing => {}
        }
    }

    async fn on_capture(&mut self, chunk: Option<Result<Vec<u8>, CaptureError>>) {
        match chunk {
            Some(Ok(pcm)) => {
                if !matches!(self.machine.state(), TurnState::Listening(_)) {
                    return;
                }
                self.appended += 1;
                if self.appended == 1 || self.appended.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %self.session.id(),
                        chunk = self.appended,
                        pcm_bytes = pcm.len(),
                        "Sending audio chunk"
                    );
                }
                self.send(protocol::audio_append(&pcm)).await;
                if let Some(message) = self.failure.take() {
                    self.close_transport().await;
                    self.feed(TurnEvent::TransportFailed(message)).await;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "Capture failed");
                self.emit(EngineEvent::CaptureError(e.to_string()));
                self.feed(TurnEvent::CaptureFailed).await;
            }
            None => {
                // Source ran dry: the user's turn is over.
                self.capture.stop().await;
                self.capturing = false;
                self.feed(TurnEvent::UserReleased).await;
            }
        }
    }

    async fn on_playback_timer(&mut self) {
        match self.playback.on_timer(self.session.turn()).await {
            DrainOutcome::Played { bytes, duration_ms } => {
                tracing::debug!(session_id = %self.session.id(), bytes, duration_ms, "Playing batch");
                self.emit(EngineEvent::Played { bytes });
            }
            DrainOutcome::Drained => self.feed(TurnEvent::PlaybackDrained).await,
        }
    }

    async fn on_settled(&mut self) {
        let Some(deferred) = self.deferred.take() else {
            return;
        };
        self.send_config(deferred.direction).await;
        if let Some(message) = self.failure.take() {
            self.close_transport().await;
            self.feed(TurnEvent::TransportFailed(message)).await;
            return;
        }
        self.run_effects(deferred.effects).await;
    }

    // ── Machine plumbing ──

    /// Run an event through the machine and execute the resulting effects,
    /// including any follow-up events they produce.
    async fn feed(&mut self, event: TurnEvent) {
        let mut pending = VecDeque::new();
        self.step(event, &mut pending);
        if self.machine.state() == TurnState::Error && self.deferred.take().is_some() {
            tracing::debug!(session_id = %self.session.id(), "Dropping pending config update");
        }
        self.run_effects(pending).await;
    }

    /// Execute effects in order. While a config update is settling, new
    /// effects queue up behind it instead.
    async fn run_effects(&mut self, mut pending: VecDeque<Effect>) {
        if let Some(deferred) = self.deferred.as_mut() {
            deferred.effects.extend(pending);
            return;
        }

        while let Some(effect) = pending.pop_front() {
            if let Some(next) = self.apply(effect).await {
                self.step(next, &mut pending);
            }
            if let Some(message) = self.failure.take() {
                self.close_transport().await;
                self.deferred = None;
                pending.clear();
                self.step(TurnEvent::TransportFailed(message), &mut pending);
                continue;
            }
            if let Some(deferred) = self.deferred.as_mut() {
                deferred.effects.extend(pending.drain(..));
                return;
            }
        }
    }

    fn step(&mut self, event: TurnEvent, pending: &mut VecDeque<Effect>) {
        let before = self.machine.state();
        let effects = self.machine.handle(event);
        let after = self.machine.state();
        if after != before {
            tracing::info!(session_id = %self.session.id(), from = %before, to = %after, "Turn state");
            self.emit(EngineEvent::StateChanged(after));
        }
        pending.extend(effects);
    }

    async fn apply(&mut self, effect: Effect) -> Option<TurnEvent> {
        match effect {
            Effect::OpenTransport => {
                self.close_transport().await;
                match self.connector.connect().await {
                    Ok(transport) => {
                        let (sink, stream) = transport.split();
                        self.sink = Some(sink);
                        self.stream = Some(stream);
                        Some(TurnEvent::TransportConnected)
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.session.id(), error = %e, "Connect failed");
                        Some(TurnEvent::TransportFailed(e.to_string()))
                    }
                }
            }
            Effect::SafeConfigUpdate(direction) => {
                self.begin_config(direction).await;
                None
            }
            Effect::StartCapture(direction) => match self.capture.start(direction).await {
                Ok(()) => {
                    self.capturing = true;
                    self.appended = 0;
                    None
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session.id(), error = %e, "Capture failed to start");
                    self.emit(EngineEvent::CaptureError(e.to_string()));
                    Some(TurnEvent::CaptureFailed)
                }
            },
            Effect::StopCapture => {
                if self.capturing {
                    self.capture.stop().await;
                    self.capturing = false;
                }
                None
            }
            Effect::CommitAndRespond => {
                self.send(protocol::audio_commit()).await;
                self.send(protocol::response_create()).await;
                None
            }
            Effect::AwaitResponse => {
                self.session.accept_responses();
                None
            }
            Effect::BeginPlayback => {
                self.playback.begin();
                None
            }
            Effect::StopPlayback => {
                self.playback.stop().await;
                None
            }
            Effect::CancelResponse => {
                self.session.stop_accepting();
                self.send(protocol::response_cancel()).await;
                self.send(protocol::audio_clear()).await;
                None
            }
            Effect::DiscardResponse => {
                self.session.stop_accepting();
                None
            }
            Effect::AdvanceTurn => {
                let turn = self.session.begin_turn();
                tracing::debug!(session_id = %self.session.id(), turn, "New turn");
                None
            }
            Effect::ApplyPendingVoice => {
                if self.session.apply_pending_voice() {
                    tracing::info!(session_id = %self.session.id(), voice = %self.session.voice(), "Applied queued voice change");
                }
                None
            }
            Effect::SurfaceError(message) => {
                self.session.set_error(message.clone());
                self.emit(EngineEvent::Error(message));
                None
            }
        }
    }

    /// First half of a safe config update: cancel anything in flight and
    /// schedule the update itself after the settle delay.
    async fn begin_config(&mut self, direction: Direction) {
        self.session.stop_accepting();
        self.send(protocol::response_cancel()).await;
        self.send(protocol::audio_clear()).await;
        self.deferred = Some(DeferredConfig {
            direction,
            at: Instant::now() + self.settle_delay,
            effects: VecDeque::new(),
        });
    }

    /// Bind the session to `direction` and tell the upstream.
    async fn send_config(&mut self, direction: Direction) {
        self.session.set_direction(direction);
        let message = match self.connector.mode() {
            TransportMode::Direct => protocol::session_update(
                self.session.instructions(),
                self.session.voice(),
                &self.settings,
            )
            .to_json(),
            TransportMode::ViaRelay => ControlMessage::SetDirection {
                direction,
                voice: Some(self.session.voice().to_string()),
            }
            .to_json(),
        };
        tracing::info!(
            session_id = %self.session.id(),
            direction = %direction,
            voice = %self.session.voice(),
            "Configuring session"
        );
        self.send(message).await;
    }

    // ── Transport helpers ──

    async fn send(&mut self, text: String) {
        if self.failure.is_some() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            tracing::debug!(session_id = %self.session.id(), "No transport, dropping outbound frame");
            return;
        };
        if let Err(e) = sink.send(Frame::Text(text)).await {
            tracing::error!(session_id = %self.session.id(), error = %e, "Send failed");
            self.failure = Some(e.to_string());
        }
    }

    async fn close_transport(&mut self) {
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine; the headless client may drop the receiver.
        let _ = self.events.send(event);
    }
}

struct DeferredConfig {
    direction: Direction,
    at: Instant,
    effects: VecDeque<Effect>,
}

async fn next_frame(stream: &mut Option<Box<dyn FrameStream>>) -> Option<Result<Frame, TransportError>> {
    match stream.as_mut() {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
