//! # Capture Buffering
//!
//! Turns a continuous stream of PCM16 chunks from the capture device into
//! periodically emitted blobs under a dual size/time policy.
//!
//! ## Flush Policy:
//! - **Size**: as soon as the buffered byte count reaches the threshold (8192 bytes by default)
//! - **Time**: on every timer tick (1000 ms by default) if anything is buffered
//! - **Never** on an empty buffer, so zero-length blobs are never emitted
//!
//! ## Atomicity:
//! [`CaptureBufferer`] is the only mutator of its buffer and every operation takes
//! `&mut self`, so a tick-triggered flush and a size-triggered flush can never
//! interleave. [`CaptureHandle`] moves the bufferer onto a single task that owns
//! both the timer and the chunk queue; chunks that arrive while a flush runs wait
//! in the queue and land in the next buffer generation.
//!
//! ## Stopping:
//! `stop()` does NOT flush a trailing partial buffer. Whatever was buffered since
//! the last flush is discarded, which avoids sending a tiny trailing fragment.

use crate::audio::pcm::{encode_pcm16_le, BYTES_PER_SAMPLE};
use crate::config::CaptureConfig;
use crate::error::{AppError, AppResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// One unit of raw audio delivered by the capture callback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Size this chunk contributes to the buffer counter.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }
}

/// Byte-exact concatenation of every chunk buffered since the previous flush.
///
/// Immutable once produced; the sink takes ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBlob {
    bytes: Vec<u8>,
}

impl FlushedBlob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Size and time bounds for flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub threshold_bytes: usize,
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for FlushPolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            threshold_bytes: config.flush_threshold_bytes,
            interval: Duration::from_millis(config.flush_interval_ms),
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    SizeThreshold,
    Timer,
}

/// Capture device adapter.
///
/// `connect` is where permission or availability failures surface; the adapter
/// pushes chunks through [`CaptureHandle::ingest`] (or [`CaptureBufferer::ingest`])
/// once connected.
pub trait CaptureDevice: Send {
    fn connect(&mut self) -> AppResult<()>;

    fn disconnect(&mut self);

    fn name(&self) -> &str;
}

/// Receives every flushed blob. This is the only coupling to the transport.
pub trait FlushSink: Send {
    fn send(&mut self, blob: FlushedBlob);
}

impl<F> FlushSink for F
where
    F: FnMut(FlushedBlob) + Send,
{
    fn send(&mut self, blob: FlushedBlob) {
        self(blob)
    }
}

/// Chunks not yet flushed plus their running byte size.
///
/// Invariant: `size_bytes == sum(chunk.byte_len())` over `chunks`.
#[derive(Debug, Default)]
struct CaptureBuffer {
    chunks: Vec<AudioChunk>,
    size_bytes: usize,
}

impl CaptureBuffer {
    fn push(&mut self, chunk: AudioChunk) {
        self.size_bytes += chunk.byte_len();
        self.chunks.push(chunk);
    }

    fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Concatenate in arrival order and reset, leaving an empty generation behind.
    fn take_blob(&mut self) -> FlushedBlob {
        let mut bytes = Vec::with_capacity(self.size_bytes);
        for chunk in self.chunks.drain(..) {
            encode_pcm16_le(&chunk.samples, &mut bytes);
        }
        self.size_bytes = 0;
        FlushedBlob { bytes }
    }
}

/// Accumulates capture chunks and emits [`FlushedBlob`]s to a sink.
pub struct CaptureBufferer<D, S> {
    device: D,
    sink: S,
    policy: FlushPolicy,
    /// `Some` exactly while recording
    buffer: Option<CaptureBuffer>,
    flush_count: u64,
}

impl<D, S> CaptureBufferer<D, S>
where
    D: CaptureDevice,
    S: FlushSink,
{
    pub fn new(device: D, sink: S, policy: FlushPolicy) -> Self {
        Self {
            device,
            sink,
            policy,
            buffer: None,
            flush_count: 0,
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Connect the device and begin accepting chunks. No-op if already recording.
    ///
    /// ## Errors:
    /// Returns `CaptureDevice` if the device cannot be connected; recording does
    /// not begin and no buffer is allocated.
    pub fn start(&mut self) -> AppResult<()> {
        if self.buffer.is_some() {
            return Ok(());
        }

        self.device.connect().map_err(|err| match err {
            AppError::CaptureDevice(_) => err,
            other => AppError::CaptureDevice(other.to_string()),
        })?;

        self.buffer = Some(CaptureBuffer::default());
        info!(
            device = %self.device.name(),
            threshold_bytes = self.policy.threshold_bytes,
            interval_ms = self.policy.interval.as_millis() as u64,
            "Start recording"
        );
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.buffer.is_some()
    }

    /// Bytes buffered since the last flush (0 when not recording).
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.size_bytes)
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.chunks.len())
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Append a chunk; flush immediately once the size threshold is reached.
    ///
    /// Returns `Some(FlushTrigger::SizeThreshold)` when this call flushed.
    /// Chunks arriving while not recording are dropped.
    pub fn ingest(&mut self, chunk: AudioChunk) -> Option<FlushTrigger> {
        let Some(buffer) = self.buffer.as_mut() else {
            debug!(samples = chunk.sample_count(), "Dropping chunk, not recording");
            return None;
        };

        if chunk.sample_count() == 0 {
            return None;
        }
        buffer.push(chunk);
        if buffer.size_bytes >= self.policy.threshold_bytes {
            self.flush().then_some(FlushTrigger::SizeThreshold)
        } else {
            None
        }
    }

    /// Timer tick: flush if anything is buffered.
    pub fn on_tick(&mut self) -> Option<FlushTrigger> {
        self.flush().then_some(FlushTrigger::Timer)
    }

    /// Emit everything buffered as one blob and clear the buffer.
    ///
    /// Returns `false` (and emits nothing) when the buffer is empty or recording
    /// is not active.
    pub fn flush(&mut self) -> bool {
        let Some(buffer) = self.buffer.as_mut() else {
            return false;
        };
        if buffer.is_empty() {
            return false;
        }

        let blob = buffer.take_blob();
        self.flush_count += 1;
        debug!(bytes = blob.len(), flush = self.flush_count, "Flushing capture buffer");
        self.sink.send(blob);
        true
    }

    /// Release the device and drop the buffer. Idempotent.
    ///
    /// The unflushed tail is discarded, not sent.
    pub fn stop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };

        if !buffer.is_empty() {
            warn!(
                discarded_bytes = buffer.size_bytes,
                "Discarding partial capture buffer on stop"
            );
        }
        self.device.disconnect();
        info!(device = %self.device.name(), flushes = self.flush_count, "Stop recording");
    }
}

/// Commands consumed by the capture task, in arrival order.
#[derive(Debug)]
enum CaptureCommand {
    Chunk(AudioChunk),
    Stop,
}

/// Running capture pipeline: one task owns the bufferer, its timer and its queue.
pub struct CaptureHandle {
    commands: mpsc::UnboundedSender<CaptureCommand>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Start recording and spawn the capture task.
    ///
    /// `start()` runs before anything is spawned, so a device error is returned
    /// here and no task or timer is left running.
    pub fn spawn<D, S>(mut bufferer: CaptureBufferer<D, S>) -> AppResult<Self>
    where
        D: CaptureDevice + 'static,
        S: FlushSink + 'static,
    {
        bufferer.start()?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_capture(bufferer, receiver));
        Ok(Self { commands, task })
    }

    /// Queue a chunk for the capture task. Returns `false` once stopped.
    pub fn ingest(&self, chunk: AudioChunk) -> bool {
        self.commands.send(CaptureCommand::Chunk(chunk)).is_ok()
    }

    /// Stop recording and wait for the capture task to release the device.
    ///
    /// Chunks queued before this call are still ingested (and may still flush on
    /// size); the remainder is discarded as documented on [`CaptureBufferer::stop`].
    pub async fn stop(self) -> AppResult<()> {
        let _ = self.commands.send(CaptureCommand::Stop);
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Capture task failed: {}", e)))
    }
}

async fn run_capture<D, S>(
    mut bufferer: CaptureBufferer<D, S>,
    mut commands: mpsc::UnboundedReceiver<CaptureCommand>,
) where
    D: CaptureDevice,
    S: FlushSink,
{
    let period = bufferer.policy().interval;
    // First tick one full period after start, not immediately.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(CaptureCommand::Chunk(chunk)) => {
                    bufferer.ingest(chunk);
                }
                Some(CaptureCommand::Stop) | None => break,
            },
            _ = ticker.tick() => {
                bufferer.on_tick();
            }
        }
    }

    bufferer.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeDevice {
        connected: Arc<AtomicBool>,
        deny: bool,
    }

    impl CaptureDevice for FakeDevice {
        fn connect(&mut self) -> AppResult<()> {
            if self.deny {
                return Err(AppError::CaptureDevice("permission denied".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "fake-mic"
        }
    }

    type Blobs = Arc<Mutex<Vec<FlushedBlob>>>;

    fn bufferer(
        policy: FlushPolicy,
    ) -> (CaptureBufferer<FakeDevice, impl FlushSink>, FakeDevice, Blobs) {
        let device = FakeDevice::default();
        let blobs: Blobs = Arc::new(Mutex::new(Vec::new()));
        let sink_blobs = blobs.clone();
        let sink = move |blob: FlushedBlob| sink_blobs.lock().unwrap().push(blob);
        (CaptureBufferer::new(device.clone(), sink, policy), device, blobs)
    }

    fn chunk_of_bytes(bytes: usize, fill: i16) -> AudioChunk {
        AudioChunk::new(vec![fill; bytes / 2])
    }

    #[test]
    fn test_counter_tracks_buffered_samples() {
        let (mut capture, _, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();

        let mut expected = 0;
        for samples in [1usize, 128, 7, 512, 300] {
            capture.ingest(AudioChunk::new(vec![0; samples]));
            expected += samples * 2;
            assert_eq!(capture.buffered_bytes(), expected);
        }
        assert!(blobs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_size_threshold_flushes_on_third_chunk() {
        let (mut capture, _, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();

        assert_eq!(capture.ingest(chunk_of_bytes(2048, 1)), None);
        assert_eq!(capture.ingest(chunk_of_bytes(2048, 2)), None);
        assert_eq!(
            capture.ingest(chunk_of_bytes(4096, 3)),
            Some(FlushTrigger::SizeThreshold)
        );

        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].len(), 8192);
        assert_eq!(capture.buffered_bytes(), 0);
        assert_eq!(capture.buffered_chunks(), 0);
    }

    #[test]
    fn test_blob_is_exact_concatenation() {
        let (mut capture, _, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();

        let chunks = vec![
            AudioChunk::new(vec![1, -1, 256]),
            AudioChunk::new(vec![i16::MAX]),
            AudioChunk::new(vec![i16::MIN, 0x0102]),
        ];
        let mut expected = Vec::new();
        for chunk in &chunks {
            encode_pcm16_le(&chunk.samples, &mut expected);
            capture.ingest(chunk.clone());
        }
        assert_eq!(capture.on_tick(), Some(FlushTrigger::Timer));

        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].as_bytes(), expected.as_slice());
    }

    #[test]
    fn test_tick_on_empty_buffer_emits_nothing() {
        let (mut capture, _, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();

        assert_eq!(capture.on_tick(), None);
        assert!(!capture.flush());
        assert!(blobs.lock().unwrap().is_empty());
        assert_eq!(capture.flush_count(), 0);
    }

    #[test]
    fn test_zero_sample_chunk_never_produces_a_blob() {
        let (mut capture, _, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();

        assert_eq!(capture.ingest(AudioChunk::new(Vec::new())), None);
        assert_eq!(capture.buffered_chunks(), 0);
        assert_eq!(capture.on_tick(), None);
        assert!(blobs.lock().unwrap().is_empty());

        capture.ingest(chunk_of_bytes(4, 7));
        capture.ingest(AudioChunk::new(Vec::new()));
        assert_eq!(capture.on_tick(), Some(FlushTrigger::Timer));
        assert_eq!(blobs.lock().unwrap()[0].len(), 4);
    }

    #[test]
    fn test_device_error_leaves_recorder_inactive() {
        let device = FakeDevice { deny: true, ..Default::default() };
        let mut capture =
            CaptureBufferer::new(device, |_blob: FlushedBlob| {}, FlushPolicy::default());

        let err = capture.start().unwrap_err();
        assert!(matches!(err, AppError::CaptureDevice(_)));
        assert!(!capture.is_recording());
        assert_eq!(capture.ingest(chunk_of_bytes(8192, 1)), None);
    }

    #[test]
    fn test_stop_discards_partial_buffer_and_is_idempotent() {
        let (mut capture, device, blobs) = bufferer(FlushPolicy::default());
        capture.start().unwrap();
        assert!(device.connected.load(Ordering::SeqCst));

        capture.ingest(chunk_of_bytes(100, 9));
        capture.stop();
        capture.stop();

        assert!(!capture.is_recording());
        assert!(!device.connected.load(Ordering::SeqCst));
        assert!(blobs.lock().unwrap().is_empty());
        assert_eq!(capture.buffered_bytes(), 0);
    }

    #[test]
    fn test_start_twice_keeps_buffer() {
        let (mut capture, _, _) = bufferer(FlushPolicy::default());
        capture.start().unwrap();
        capture.ingest(chunk_of_bytes(64, 1));
        capture.start().unwrap();
        assert_eq!(capture.buffered_bytes(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_low_volume_audio() {
        let (capture, _, blobs) = bufferer(FlushPolicy::default());
        let handle = CaptureHandle::spawn(capture).unwrap();

        handle.ingest(chunk_of_bytes(256, 4));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(blobs.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(blobs.lock().unwrap().len(), 1);
        assert_eq!(blobs.lock().unwrap()[0].len(), 256);

        // Nothing buffered: the next tick must not emit an empty blob.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(blobs.lock().unwrap().len(), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_stop_releases_device_without_flushing() {
        let (capture, device, blobs) = bufferer(FlushPolicy::default());
        let handle = CaptureHandle::spawn(capture).unwrap();

        handle.ingest(chunk_of_bytes(512, 2));
        handle.stop().await.unwrap();

        assert!(!device.connected.load(Ordering::SeqCst));
        assert!(blobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_spawn_surfaces_device_error() {
        let device = FakeDevice { deny: true, ..Default::default() };
        let capture = CaptureBufferer::new(device, |_blob: FlushedBlob| {}, FlushPolicy::default());
        assert!(matches!(
            CaptureHandle::spawn(capture),
            Err(AppError::CaptureDevice(_))
        ));
    }
}
