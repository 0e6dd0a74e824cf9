//! Microphone abstraction and a file-backed source for the headless client.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use super::direction::Direction;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Produces PCM16 24kHz mono chunks while capture is started.
#[async_trait]
pub trait CaptureSource: Send {
    async fn start(&mut self, direction: Direction) -> Result<(), CaptureError>;

    /// Next captured chunk. `None` means the source ran dry and the user's
    /// turn is over.
    ///
    /// Must be cancel safe: it is polled inside `tokio::select!`.
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, CaptureError>>;

    async fn stop(&mut self);
}

/// Replays a PCM buffer as capture, one chunk per `pace` interval.
///
/// Each `start` replays the buffer from the beginning. A zero pace delivers
/// chunks as fast as they are polled.
pub struct PcmFileCapture {
    pcm: Vec<u8>,
    chunk_bytes: usize,
    pace: Duration,
    offset: usize,
    next_at: Instant,
    started: bool,
}

impl PcmFileCapture {
    pub fn new(pcm: Vec<u8>, chunk_bytes: usize, pace: Duration) -> Self {
        Self {
            pcm,
            // Keep whole samples.
            chunk_bytes: chunk_bytes.max(2) & !1,
            pace,
            offset: 0,
            next_at: Instant::now(),
            started: false,
        }
    }

    /// Chunked at `chunk_ms` of 24kHz mono audio, paced in real time.
    pub fn realtime(pcm: Vec<u8>, chunk_ms: u64) -> Self {
        let chunk_bytes = (super::codec::SAMPLE_RATE as usize / 1000) * 2 * chunk_ms as usize;
        Self::new(pcm, chunk_bytes, Duration::from_millis(chunk_ms))
    }
}

#[async_trait]
impl CaptureSource for PcmFileCapture {
    async fn start(&mut self, direction: Direction) -> Result<(), CaptureError> {
        if self.pcm.is_empty() {
            return Err(CaptureError::Unavailable("input audio is empty".to_string()));
        }
        tracing::debug!(direction = %direction, bytes = self.pcm.len(), "Replaying capture file");
        self.offset = 0;
        self.next_at = Instant::now();
        self.started = true;
        Ok(())
    }

    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, CaptureError>> {
        if !self.started || self.offset >= self.pcm.len() {
            return None;
        }
        tokio::time::sleep_until(self.next_at).await;

        let end = (self.offset + self.chunk_bytes).min(self.pcm.len());
        let chunk = self.pcm[self.offset..end].to_vec();
        self.offset = end;
        self.next_at += self.pace;
        Some(Ok(chunk))
    }

    async fn stop(&mut self) {
        self.started = false;
    }
}
