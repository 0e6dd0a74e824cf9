//! Relay pairs: one client transport bound to one upstream transport.
//!
//! ```text
//! client ──(append/commit/…, set_direction)──▶ relay ──(verbatim, session.update)──▶ model
//! client ◀────────────(verbatim events)─────── relay ◀────────────────────────────── model
//! ```
//!
//! The upstream is connected lazily on the first client frame and configured
//! for the default direction. `set_direction` is consumed here and turned
//! into a `session.update`; everything else passes through untouched. When
//! either side closes, both are closed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::voice::direction::{Direction, DirectionTable};
use crate::voice::protocol::{self, ControlMessage, SessionSettings};
use crate::voice::transport::{Connector, Frame, FrameSink, FrameStream, Transport, TransportError};

/// Shared, immutable relay configuration.
pub struct RelayContext {
    pub upstream: Arc<dyn Connector>,
    pub table: Arc<DirectionTable>,
    pub settings: SessionSettings,
    pub initial_direction: Direction,
}

impl RelayContext {
    fn session_update(&self, direction: Direction, voice: Option<&str>) -> String {
        let voice = voice.unwrap_or_else(|| self.table.default_voice(direction));
        protocol::session_update(self.table.instructions(direction), voice, &self.settings).to_json()
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Live counters for one relay pair.
#[derive(Debug)]
pub struct PairStats {
    id: String,
    created_at: DateTime<Utc>,
    direction: Mutex<Direction>,
    upstream_connected: std::sync::atomic::AtomicBool,
    client_frames: AtomicU64,
    upstream_frames: AtomicU64,
}

impl PairStats {
    fn new(direction: Direction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            direction: Mutex::new(direction),
            upstream_connected: std::sync::atomic::AtomicBool::new(false),
            client_frames: AtomicU64::new(0),
            upstream_frames: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        *self.direction.lock()
    }

    pub fn snapshot(&self) -> RelaySessionInfo {
        RelaySessionInfo {
            id: self.id.clone(),
            direction: self.direction(),
            created_at: self.created_at,
            upstream_connected: self.upstream_connected.load(Ordering::Relaxed),
            client_frames: self.client_frames.load(Ordering::Relaxed),
            upstream_frames: self.upstream_frames.load(Ordering::Relaxed),
        }
    }
}

/// Public view of a relay pair for `GET /api/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaySessionInfo {
    pub id: String,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub upstream_connected: bool,
    /// Frames forwarded (or consumed) from the client.
    pub client_frames: u64,
    /// Frames forwarded from the model to the client.
    pub upstream_frames: u64,
}

/// Bounded set of live relay pairs.
pub struct RelayRegistry {
    max_sessions: usize,
    pairs: Mutex<HashMap<String, Arc<PairStats>>>,
}

impl RelayRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new pair. The slot is released when the returned guard drops.
    pub fn register(self: &Arc<Self>, direction: Direction) -> anyhow::Result<Registration> {
        let mut pairs = self.pairs.lock();
        if pairs.len() >= self.max_sessions {
            anyhow::bail!(
                "Maximum concurrent relay sessions ({}) reached",
                self.max_sessions
            );
        }
        let stats = Arc::new(PairStats::new(direction));
        pairs.insert(stats.id.clone(), stats.clone());
        Ok(Registration {
            registry: Arc::clone(self),
            stats,
        })
    }

    pub fn active_count(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Snapshot of every live pair, oldest first.
    pub fn list(&self) -> Vec<RelaySessionInfo> {
        let mut sessions: Vec<RelaySessionInfo> = self
            .pairs
            .lock()
            .values()
            .map(|stats| stats.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    fn remove(&self, id: &str) {
        self.pairs.lock().remove(id);
    }
}

/// A registry slot held for the lifetime of one relay pair.
pub struct Registration {
    registry: Arc<RelayRegistry>,
    stats: Arc<PairStats>,
}

impl Registration {
    pub fn stats(&self) -> &Arc<PairStats> {
        &self.stats
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.stats.id);
    }
}

// ── Pair lifecycle ─────────────────────────────────────────────────

/// Relay one client connection until either side closes.
pub async fn run_pair(client: Transport, ctx: Arc<RelayContext>, stats: Arc<PairStats>) {
    let session_id = stats.id().to_string();
    let (mut client_sink, mut client_stream) = client.split();

    // Lazy upstream: nothing is dialled until the client speaks.
    let first = match client_stream.recv().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            tracing::warn!(session_id = %session_id, error = %e, "Client failed before first frame");
            client_sink.close().await;
            return;
        }
        None => {
            tracing::debug!(session_id = %session_id, "Client left before first frame");
            client_sink.close().await;
            return;
        }
    };

    let upstream = match ctx.upstream.connect().await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Upstream connect failed");
            let event = serde_json::json!({
                "type": "error",
                "error": {"message": format!("upstream connection failed: {e}")},
            });
            let _ = client_sink.send(Frame::Text(event.to_string())).await;
            client_sink.close().await;
            return;
        }
    };
    stats.upstream_connected.store(true, Ordering::Relaxed);
    let (mut upstream_sink, upstream_stream) = upstream.split();

    let initial = stats.direction();
    tracing::info!(session_id = %session_id, direction = %initial, "Upstream connected");

    let ready = async {
        upstream_sink
            .send(Frame::Text(ctx.session_update(initial, None)))
            .await?;
        forward_client_frame(first, upstream_sink.as_mut(), &ctx, &stats).await
    };
    match ready.await {
        Ok(None) => {}
        Ok(Some(reply)) => {
            let _ = client_sink.send(reply).await;
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Upstream rejected initial frames");
            upstream_sink.close().await;
            client_sink.close().await;
            return;
        }
    }

    let cancel = CancellationToken::new();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    tokio::join!(
        client_to_upstream(client_stream, upstream_sink, reply_tx, &ctx, &stats, cancel.clone()),
        upstream_to_client(upstream_stream, client_sink, reply_rx, &stats, cancel.clone()),
    );

    let info = stats.snapshot();
    tracing::info!(
        session_id = %session_id,
        client_frames = info.client_frames,
        upstream_frames = info.upstream_frames,
        "Relay session ended"
    );
}

async fn client_to_upstream(
    mut client: Box<dyn FrameStream>,
    mut upstream: Box<dyn FrameSink>,
    replies: mpsc::UnboundedSender<Frame>,
    ctx: &RelayContext,
    stats: &PairStats,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            () = cancel.cancelled() => break,
            inbound = client.recv() => inbound,
        };
        match inbound {
            Some(Ok(frame)) => match forward_client_frame(frame, upstream.as_mut(), ctx, stats).await {
                Ok(None) => {}
                Ok(Some(reply)) => {
                    let _ = replies.send(reply);
                }
                Err(e) => {
                    tracing::warn!(session_id = %stats.id(), error = %e, "Upstream send failed");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(session_id = %stats.id(), error = %e, "Client connection error");
                break;
            }
            None => {
                tracing::debug!(session_id = %stats.id(), "Client closed");
                break;
            }
        }
    }
    cancel.cancel();
    upstream.close().await;
}

async fn upstream_to_client(
    mut upstream: Box<dyn FrameStream>,
    mut client: Box<dyn FrameSink>,
    mut replies: mpsc::UnboundedReceiver<Frame>,
    stats: &PairStats,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            () = cancel.cancelled() => break,
            Some(reply) = replies.recv() => {
                if let Err(e) = client.send(reply).await {
                    tracing::debug!(session_id = %stats.id(), error = %e, "Client send failed");
                    break;
                }
                continue;
            }
            inbound = upstream.recv() => inbound,
        };
        match inbound {
            Some(Ok(frame)) => {
                if let Some(text) = frame.as_text() {
                    tracing::trace!(
                        session_id = %stats.id(),
                        event_type = protocol::peek_event_type(text).as_deref().unwrap_or("?"),
                        "Upstream event"
                    );
                }
                stats.upstream_frames.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = client.send(frame).await {
                    tracing::debug!(session_id = %stats.id(), error = %e, "Client send failed");
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %stats.id(), error = %e, "Upstream connection error");
                break;
            }
            None => {
                tracing::info!(session_id = %stats.id(), "Upstream closed");
                break;
            }
        }
    }
    cancel.cancel();
    client.close().await;
}

/// Consume `set_direction`, pass everything else through.
///
/// Returns a frame for the client when a control message is rejected.
async fn forward_client_frame(
    frame: Frame,
    upstream: &mut dyn FrameSink,
    ctx: &RelayContext,
    stats: &PairStats,
) -> Result<Option<Frame>, TransportError> {
    stats.client_frames.fetch_add(1, Ordering::Relaxed);

    match frame.as_text().and_then(protocol::parse_control) {
        None => upstream.send(frame).await.map(|()| None),
        Some(Ok(ControlMessage::SetDirection { direction, voice })) => {
            *stats.direction.lock() = direction;
            tracing::info!(
                session_id = %stats.id(),
                direction = %direction,
                voice = voice.as_deref().unwrap_or(ctx.table.default_voice(direction)),
                "Direction switched"
            );
            upstream
                .send(Frame::Text(ctx.session_update(direction, voice.as_deref())))
                .await
                .map(|()| None)
        }
        Some(Err(e)) => {
            tracing::warn!(session_id = %stats.id(), error = %e, "Rejecting control message");
            let event = serde_json::json!({
                "type": "error",
                "error": {"message": e.to_string()},
            });
            Ok(Some(Frame::Text(event.to_string())))
        }
    }
}
