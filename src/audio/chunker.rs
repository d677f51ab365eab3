use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AudioFormat, AudioSource};

/// How long to wait before polling a source that had no data
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Audio sent before any pacing applies
pub const FAST_LANE: Duration = Duration::from_secs(5);

/// Assembles arbitrary reads into fixed-size chunks
#[derive(Debug)]
pub struct ChunkBuffer {
    chunk_size: usize,
    pending: Vec<u8>,
    closed: bool,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pending: Vec::with_capacity(chunk_size),
            closed: false,
        }
    }

    /// Room left in the chunk being filled
    pub fn remaining(&self) -> usize {
        self.chunk_size - self.pending.len()
    }

    /// Append bytes and return every chunk that is now complete
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();
        if self.closed {
            return complete;
        }
        while !data.is_empty() {
            let take = self.remaining().min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.chunk_size {
                complete.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.chunk_size),
                ));
            }
        }
        complete
    }

    /// Close the buffer, returning the short final chunk if any
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Send budget applied until the service detects speech.
///
/// The first [`FAST_LANE`] of audio goes out immediately; after that the
/// total sent never exceeds twice the elapsed real time.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    bytes_per_second: u64,
    fast_lane_bytes: u64,
}

impl Throttle {
    pub fn new(format: AudioFormat) -> Self {
        let bytes_per_second = format.bytes_per_second() as u64;
        Self {
            bytes_per_second,
            fast_lane_bytes: bytes_per_second * FAST_LANE.as_secs(),
        }
    }

    /// Largest total allowed after `elapsed`
    pub fn budget(&self, elapsed: Duration) -> u64 {
        self.fast_lane_bytes + 2 * elapsed.as_millis() as u64 * self.bytes_per_second / 1000
    }

    /// How long to wait before the running total may reach `total_bytes`
    pub fn delay(&self, total_bytes: u64, elapsed: Duration) -> Option<Duration> {
        if total_bytes <= self.budget(elapsed) || self.bytes_per_second == 0 {
            return None;
        }
        let excess = total_bytes - self.fast_lane_bytes;
        let rate = 2 * self.bytes_per_second;
        let ready_ms = excess * 1000 / rate + u64::from(excess * 1000 % rate != 0);
        Some(Duration::from_millis(ready_ms).saturating_sub(elapsed))
    }
}

/// Audio sent under the throttle so far in one recognition run.
///
/// Shared by every chunker the run starts, so a reconnect does not open a
/// fresh fast lane.
#[derive(Debug, Clone)]
pub struct ThrottleClock {
    started: Instant,
    sent: Arc<AtomicU64>,
}

impl ThrottleClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn add(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::SeqCst);
    }
}

impl Default for ThrottleClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a chunker task, tagged with the connection it belongs to
#[derive(Debug)]
pub struct AudioMessage {
    pub generation: u64,
    pub data: AudioData,
}

#[derive(Debug)]
pub enum AudioData {
    Chunk(Vec<u8>),
    /// The source closed and everything it produced has been sent
    EndOfAudio,
    /// A graceful stop flushed the last partial chunk
    Stopped,
    Failed(String),
}

/// Task that reads a source and forwards fixed-size chunks
pub struct AudioChunker {
    stop: CancellationToken,
    abort: CancellationToken,
    throttle_released: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl AudioChunker {
    /// Start reading `source`. Without a clock the audio is never paced.
    pub fn start(
        source: Arc<Mutex<Box<dyn AudioSource>>>,
        chunk_size: usize,
        clock: Option<ThrottleClock>,
        generation: u64,
        tx: mpsc::Sender<AudioMessage>,
    ) -> Self {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let throttle_released = Arc::new(AtomicBool::new(clock.is_none()));

        let task = ChunkerTask {
            source,
            buffer: ChunkBuffer::new(chunk_size),
            scratch: vec![0u8; chunk_size.max(1)],
            stop: stop.clone(),
            abort: abort.clone(),
            throttle_released: throttle_released.clone(),
            clock: clock.unwrap_or_default(),
            generation,
            tx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            stop,
            abort,
            throttle_released,
            handle,
        }
    }

    /// Stop pacing; called once the service has heard speech
    pub fn release_throttle(&self) {
        if !self.throttle_released.swap(true, Ordering::SeqCst) {
            log::debug!("🚦 Audio throttle released");
        }
    }

    /// Flush the partial chunk and finish with [`AudioData::Stopped`]
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Drop everything not yet sent
    pub fn abort(self) {
        self.abort.cancel();
        self.handle.abort();
    }
}

struct ChunkerTask {
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    buffer: ChunkBuffer,
    scratch: Vec<u8>,
    stop: CancellationToken,
    abort: CancellationToken,
    throttle_released: Arc<AtomicBool>,
    clock: ThrottleClock,
    generation: u64,
    tx: mpsc::Sender<AudioMessage>,
}

enum ReadOutcome {
    Data(usize),
    Empty,
    Closed,
    Failed(String),
}

impl ChunkerTask {
    async fn run(mut self) {
        let (format, throttle) = {
            let source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            (source.format(), Throttle::new(source.format()))
        };
        let mut total_sent: u64 = 0;
        let mut chunks_sent: u64 = 0;

        log::debug!(
            "🎧 Chunker {} started ({} byte chunks, {} B/s)",
            self.generation,
            self.scratch.len(),
            format.bytes_per_second()
        );

        loop {
            if self.stop.is_cancelled() {
                if let Some(last) = self.buffer.flush() {
                    if !self.forward(AudioData::Chunk(last)).await {
                        return;
                    }
                }
                self.forward(AudioData::Stopped).await;
                log::debug!("⏹️ Chunker {} stopped after {} chunks", self.generation, chunks_sent);
                return;
            }

            let want = self.buffer.remaining();
            match self.read(want) {
                ReadOutcome::Data(count) => {
                    let chunks = self.buffer.push(&self.scratch[..count]);
                    for chunk in chunks {
                        let size = chunk.len() as u64;
                        if !self.throttle_released.load(Ordering::SeqCst) {
                            let elapsed = self.clock.elapsed();
                            if let Some(wait) = throttle.delay(self.clock.sent() + size, elapsed) {
                                log::trace!("🐢 Throttling audio for {:?}", wait);
                                tokio::select! {
                                    _ = tokio::time::sleep(wait) => {}
                                    _ = self.abort.cancelled() => return,
                                }
                            }
                        }
                        if !self.forward(AudioData::Chunk(chunk)).await {
                            return;
                        }
                        self.clock.add(size);
                        total_sent += size;
                        chunks_sent += 1;
                    }
                }
                ReadOutcome::Empty => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = self.stop.cancelled() => {}
                        _ = self.abort.cancelled() => return,
                    }
                }
                ReadOutcome::Closed => {
                    if let Some(last) = self.buffer.flush() {
                        if !self.forward(AudioData::Chunk(last)).await {
                            return;
                        }
                    }
                    log::info!(
                        "🏁 Audio source ended after {} bytes in {} chunks",
                        total_sent,
                        chunks_sent
                    );
                    self.forward(AudioData::EndOfAudio).await;
                    return;
                }
                ReadOutcome::Failed(error) => {
                    log::error!("❌ Audio source read failed: {}", error);
                    self.forward(AudioData::Failed(error)).await;
                    return;
                }
            }
        }
    }

    fn read(&mut self, want: usize) -> ReadOutcome {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        match source.read(&mut self.scratch[..want]) {
            Ok(0) if source.is_closed() => ReadOutcome::Closed,
            Ok(0) => ReadOutcome::Empty,
            Ok(count) => ReadOutcome::Data(count),
            Err(e) => ReadOutcome::Failed(e.to_string()),
        }
    }

    /// Returns false once the session stopped listening
    async fn forward(&self, data: AudioData) -> bool {
        let message = AudioMessage {
            generation: self.generation,
            data,
        };
        tokio::select! {
            sent = self.tx.send(message) => sent.is_ok(),
            _ = self.abort.cancelled() => false,
        }
    }
}
