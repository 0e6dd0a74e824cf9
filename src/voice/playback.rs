//! Response audio queue and the driver that drains it into an [`AudioSink`].
//!
//! Deltas are stamped with the turn they belong to. The driver drains the
//! whole queue at once, wraps the batch in a WAV container and schedules the
//! next drain after the batch's estimated playback length.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::codec;

/// Monotonic conversation turn id.
pub type TurnId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedChunk {
    turn: TurnId,
    pcm: Vec<u8>,
}

/// Ordered PCM chunks awaiting playback. Single writer (the dispatcher),
/// single reader (the driver).
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    chunks: Mutex<VecDeque<QueuedChunk>>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: TurnId, pcm: Vec<u8>) {
        self.chunks.lock().push_back(QueuedChunk { turn, pcm });
    }

    /// Take every queued chunk of `turn` as one contiguous buffer.
    ///
    /// Chunks stamped with any other turn are stale and dropped.
    pub fn drain_batch(&self, turn: TurnId) -> Vec<u8> {
        let mut chunks = self.chunks.lock();
        let mut batch = Vec::new();
        for chunk in chunks.drain(..) {
            if chunk.turn == turn {
                batch.extend_from_slice(&chunk.pcm);
            } else {
                tracing::debug!(stale_turn = chunk.turn, turn, bytes = chunk.pcm.len(), "Dropping stale audio");
            }
        }
        batch
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.chunks.lock().iter().map(|c| c.pcm.len()).sum()
    }
}

/// Where drained audio goes: a speaker, a file, a test recorder.
#[async_trait]
pub trait AudioSink: Send {
    /// Start playing one WAV container. Must not wait for playback to end.
    async fn play(&mut self, container: Vec<u8>) -> anyhow::Result<()>;

    /// Stop whatever is playing.
    async fn stop(&mut self);
}

/// Outcome of a scheduled drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A batch was handed to the sink.
    Played { bytes: usize, duration_ms: u64 },
    /// Queue was empty; playback is idle again.
    Drained,
}

/// Schedules queue drains and feeds the sink.
pub struct PlaybackDriver {
    queue: Arc<PlaybackQueue>,
    sink: Box<dyn AudioSink>,
    prebuffer: Duration,
    next_drain: Option<Instant>,
    /// Waiting for the first batch of a response (no audio handed out yet).
    prebuffering: bool,
}

impl PlaybackDriver {
    pub fn new(queue: Arc<PlaybackQueue>, sink: Box<dyn AudioSink>, prebuffer: Duration) -> Self {
        Self {
            queue,
            sink,
            prebuffer,
            next_drain: None,
            prebuffering: false,
        }
    }

    /// Start playback if idle. The first drain waits `prebuffer` so that a
    /// burst of small deltas plays as one container.
    pub fn begin(&mut self) {
        if self.next_drain.is_none() {
            self.next_drain = Some(Instant::now() + self.prebuffer);
            self.prebuffering = true;
        }
    }

    /// The response has no more audio: stop prebuffering and drain now.
    pub fn flush(&mut self) {
        if self.prebuffering {
            self.next_drain = Some(Instant::now());
        }
    }

    /// When the engine should call [`Self::on_timer`].
    pub fn deadline(&self) -> Option<Instant> {
        self.next_drain
    }

    /// Nothing queued and nothing playing.
    pub fn is_idle(&self) -> bool {
        self.next_drain.is_none() && self.queue.is_empty()
    }

    /// Drain the queue for `turn` and hand the batch to the sink.
    pub async fn on_timer(&mut self, turn: TurnId) -> DrainOutcome {
        self.prebuffering = false;
        let pcm = self.queue.drain_batch(turn);
        if pcm.is_empty() {
            self.next_drain = None;
            return DrainOutcome::Drained;
        }

        let bytes = pcm.len();
        let duration_ms = codec::duration_ms(bytes, codec::SAMPLE_RATE, codec::CHANNELS);
        let container = codec::encode_container(&pcm, codec::SAMPLE_RATE, codec::CHANNELS);
        if let Err(e) = self.sink.play(container).await {
            tracing::warn!(error = %e, bytes, "Audio sink rejected batch");
        }
        self.next_drain = Some(Instant::now() + Duration::from_millis(duration_ms));
        DrainOutcome::Played { bytes, duration_ms }
    }

    /// Stop playback and discard everything queued.
    pub async fn stop(&mut self) {
        self.queue.clear();
        self.next_drain = None;
        self.prebuffering = false;
        self.sink.stop().await;
    }
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Collects every played batch and writes them as one WAV file on `finish`.
pub struct WavFileSink {
    path: PathBuf,
    pcm: Vec<u8>,
    batches: usize,
}

impl WavFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pcm: Vec::new(),
            batches: 0,
        }
    }

    /// Shared handle so the caller can write the file after the engine stops.
    pub fn shared(path: impl Into<PathBuf>) -> Arc<tokio::sync::Mutex<Self>> {
        Arc::new(tokio::sync::Mutex::new(Self::new(path)))
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn bytes(&self) -> usize {
        self.pcm.len()
    }

    /// Write the collected audio to disk.
    pub async fn finish(&self) -> anyhow::Result<()> {
        let container = codec::encode_container(&self.pcm, codec::SAMPLE_RATE, codec::CHANNELS);
        tokio::fs::write(&self.path, container).await?;
        tracing::info!(path = %self.path.display(), bytes = self.pcm.len(), batches = self.batches, "Wrote translated audio");
        Ok(())
    }

    fn append(&mut self, container: &[u8]) -> anyhow::Result<()> {
        let decoded = codec::decode_container(container)?;
        self.pcm.extend_from_slice(&decoded.pcm);
        self.batches += 1;
        Ok(())
    }
}

#[async_trait]
impl AudioSink for Arc<tokio::sync::Mutex<WavFileSink>> {
    async fn play(&mut self, container: Vec<u8>) -> anyhow::Result<()> {
        self.lock().await.append(&container)
    }

    async fn stop(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;

    #[test]
    fn queue_drains_whole_batch_in_order() {
        let queue = PlaybackQueue::new();
        queue.push(1, vec![1, 2]);
        queue.push(1, vec![3]);
        queue.push(1, vec![4, 5]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.queued_bytes(), 5);

        assert_eq!(queue.drain_batch(1), vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
        assert!(queue.drain_batch(1).is_empty());
    }

    #[test]
    fn stale_turns_are_dropped_on_drain() {
        let queue = PlaybackQueue::new();
        queue.push(1, vec![9, 9]);
        queue.push(2, vec![1]);
        queue.push(1, vec![9]);
        queue.push(2, vec![2]);

        assert_eq!(queue.drain_batch(2), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn driver_plays_one_container_per_drain() {
        let queue = Arc::new(PlaybackQueue::new());
        let sink = RecordingSink::default();
        let mut driver = PlaybackDriver::new(queue.clone(), Box::new(sink.clone()), Duration::from_millis(100));
        assert!(driver.is_idle());

        queue.push(3, vec![0; 4800]);
        driver.begin();
        queue.push(3, vec![0; 2400]);
        assert!(driver.deadline().is_some());
        assert!(!driver.is_idle());

        driver.flush();
        assert!(driver.deadline().unwrap() <= Instant::now());

        let outcome = driver.on_timer(3).await;
        assert_eq!(
            outcome,
            DrainOutcome::Played {
                bytes: 7200,
                duration_ms: 150
            }
        );
        {
            let played = sink.played.lock();
            assert_eq!(played.len(), 1);
            let decoded = codec::decode_container(&played[0]).unwrap();
            assert_eq!(decoded.pcm.len(), 7200);
        }

        assert_eq!(driver.on_timer(3).await, DrainOutcome::Drained);
        assert!(driver.is_idle());
        assert!(driver.deadline().is_none());
    }

    #[tokio::test]
    async fn flush_does_not_cut_a_playing_batch() {
        let queue = Arc::new(PlaybackQueue::new());
        let mut driver = PlaybackDriver::new(queue.clone(), Box::new(RecordingSink::default()), Duration::ZERO);

        queue.push(1, vec![0; 48_000]);
        driver.begin();
        driver.on_timer(1).await;
        let playing_until = driver.deadline().unwrap();

        driver.flush();
        assert_eq!(driver.deadline(), Some(playing_until));
    }

    #[tokio::test]
    async fn stop_clears_queue_and_sink() {
        let queue = Arc::new(PlaybackQueue::new());
        let sink = RecordingSink::default();
        let mut driver = PlaybackDriver::new(queue.clone(), Box::new(sink.clone()), Duration::ZERO);

        queue.push(1, vec![0; 10]);
        driver.begin();
        driver.stop().await;

        assert!(queue.is_empty());
        assert!(driver.is_idle());
        assert_eq!(*sink.stops.lock(), 1);
        assert!(sink.played.lock().is_empty());
    }

    #[tokio::test]
    async fn wav_file_sink_concatenates_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavFileSink::shared(&path);

        sink.play(codec::encode_container(&[1, 2], codec::SAMPLE_RATE, 1))
            .await
            .unwrap();
        sink.play(codec::encode_container(&[3, 4], codec::SAMPLE_RATE, 1))
            .await
            .unwrap();
        assert!(sink.play(vec![0; 3]).await.is_err());

        let guard = sink.lock().await;
        assert_eq!(guard.batches(), 2);
        guard.finish().await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(codec::decode_container(&written).unwrap().pcm, vec![1, 2, 3, 4]);
    }
}
