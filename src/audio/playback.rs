//! # Playback Sequencing
//!
//! Plays audio segments returned by the relay one at a time, in arrival order,
//! without overlap.
//!
//! ## How draining works:
//! Starting a segment hands the device a [`PlaybackCompletion`] token. When the
//! device finishes it calls [`PlaybackCompletion::finish`], which posts the
//! segment id onto the sequencer's completion channel. The sequencer handles that
//! event by marking itself idle and starting the next queued segment. A single
//! loop ([`PlaybackSequencer::run`]) consumes both new segments and completion
//! events, so the queue drains continuously without recursion.
//!
//! ## Observable state:
//! `is_playing` is published on a `tokio::sync::watch` channel so UI code can
//! gate on it without touching the queue.

use crate::error::{AppError, AppResult};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// One reply fragment: mono f32 samples at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Intrinsic playback duration.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Handed to the device with each segment; consumed when playback ends.
#[derive(Debug)]
pub struct PlaybackCompletion {
    id: u64,
    notify: mpsc::UnboundedSender<u64>,
}

impl PlaybackCompletion {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Report that the segment finished playing.
    pub fn finish(self) {
        // The sequencer may already be gone; nothing left to drain then.
        let _ = self.notify.send(self.id);
    }
}

/// Audio output used by the sequencer.
pub trait PlaybackDevice: Send {
    /// `false` while the output is not ready (e.g. before the audio context exists).
    fn is_available(&self) -> bool;

    /// Begin audible playback and return without waiting for it to end.
    /// `completion.finish()` must be called exactly once when playback ends.
    fn play(&mut self, segment: AudioSegment, completion: PlaybackCompletion) -> AppResult<()>;
}

/// FIFO playback queue with at most one segment playing at a time.
pub struct PlaybackSequencer<D> {
    device: D,
    queue: VecDeque<AudioSegment>,
    current: Option<u64>,
    next_id: u64,
    playing: watch::Sender<bool>,
    completions_tx: mpsc::UnboundedSender<u64>,
    completions_rx: mpsc::UnboundedReceiver<u64>,
}

impl<D: PlaybackDevice> PlaybackSequencer<D> {
    pub fn new(device: D) -> Self {
        let (playing, _) = watch::channel(false);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            device,
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
            playing,
            completions_tx,
            completions_rx,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Watch `is_playing` from elsewhere (UI gating, tests).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.playing.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Append a segment; start it right away if nothing is playing.
    ///
    /// Never preempts the current segment.
    pub fn enqueue(&mut self, segment: AudioSegment) -> AppResult<()> {
        self.queue.push_back(segment);
        if self.current.is_none() {
            self.play_next()
        } else {
            Ok(())
        }
    }

    /// Start the queue head if idle, non-empty and the device is available.
    ///
    /// Safe to call at any time; every other case is a no-op. A device error
    /// drops the segment that failed, leaves the sequencer idle and is returned.
    pub fn play_next(&mut self) -> AppResult<()> {
        if self.current.is_some() || self.queue.is_empty() || !self.device.is_available() {
            return Ok(());
        }
        let Some(segment) = self.queue.pop_front() else {
            return Ok(());
        };

        let id = self.next_id;
        self.next_id += 1;
        self.current = Some(id);
        self.playing.send_replace(true);

        debug!(
            segment = id,
            samples = segment.samples.len(),
            queued = self.queue.len(),
            "Playing segment"
        );
        let completion = PlaybackCompletion {
            id,
            notify: self.completions_tx.clone(),
        };
        if let Err(err) = self.device.play(segment, completion) {
            self.current = None;
            self.playing.send_replace(false);
            return Err(match err {
                AppError::Playback(_) => err,
                other => AppError::Playback(other.to_string()),
            });
        }
        Ok(())
    }

    /// Handle a completion event: go idle, then start the next segment.
    ///
    /// Completions for anything other than the current segment are ignored.
    pub fn on_playback_complete(&mut self, id: u64) -> AppResult<()> {
        if self.current != Some(id) {
            debug!(segment = id, "Ignoring stale playback completion");
            return Ok(());
        }
        self.current = None;
        self.playing.send_replace(false);
        self.play_next()
    }

    /// Handle every completion already posted, without waiting.
    ///
    /// Returns how many completion events were processed.
    pub fn pump_completions(&mut self) -> AppResult<usize> {
        let mut handled = 0;
        while let Ok(id) = self.completions_rx.try_recv() {
            self.on_playback_complete(id)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Drive the sequencer from an incoming segment stream.
    ///
    /// Returns once `segments` is closed and everything queued has finished
    /// playing. Device errors are logged and the loop moves on to the next segment.
    pub async fn run(mut self, mut segments: mpsc::UnboundedReceiver<AudioSegment>) -> Self {
        let mut input_open = true;

        loop {
            if !input_open && self.current.is_none() && self.queue.is_empty() {
                break;
            }

            tokio::select! {
                segment = segments.recv(), if input_open => match segment {
                    Some(segment) => {
                        if let Err(err) = self.enqueue(segment) {
                            warn!(error = %err, "Playback failed to start");
                        }
                    }
                    None => {
                        input_open = false;
                        if !self.device.is_available() && self.current.is_none() {
                            // Nothing can ever drain the backlog.
                            if !self.queue.is_empty() {
                                warn!(
                                    dropped = self.queue.len(),
                                    "Playback device unavailable, dropping queue"
                                );
                                self.queue.clear();
                            }
                        }
                    }
                },
                Some(id) = self.completions_rx.recv() => {
                    if let Err(err) = self.on_playback_complete(id) {
                        warn!(error = %err, "Playback failed to start");
                    }
                }
            }
        }

        self
    }
}
