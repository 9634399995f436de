//! # Client Audio Pipeline
//!
//! The two client-side halves of the voice loop: turning microphone samples into
//! transmittable blobs, and playing returned speech back without overlap.
//!
//! ## Key Components:
//! - **Capture Bufferer**: dual size/time flush policy over PCM16 chunks
//! - **Playback Sequencer**: strict one-at-a-time FIFO playback
//! - **PCM helpers**: PCM16 little-endian framing and f32 conversion
//!
//! ## Audio Format:
//! - **Capture**: 16-bit signed PCM, mono, little-endian on the wire
//! - **Playback**: 32-bit float, mono, normalized to [-1.0, 1.0]

pub mod capture;     // CaptureBufferer and its timer-driven task
pub mod pcm;         // PCM16 framing and sample conversion
pub mod playback;    // PlaybackSequencer and its completion-driven loop

pub use capture::{
    AudioChunk, CaptureBufferer, CaptureDevice, CaptureHandle, FlushPolicy, FlushSink,
    FlushTrigger, FlushedBlob,
};
pub use playback::{AudioSegment, PlaybackCompletion, PlaybackDevice, PlaybackSequencer};
