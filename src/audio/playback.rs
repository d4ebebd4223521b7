//! Gap-free playback scheduling for streamed audio
//!
//! Inbound chunks arrive faster or slower than real time. Each one is decoded
//! and placed on the output device's clock right after the previous one, or
//! at "now" when the queue has drained. Interruptions flush everything.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::encoder::{decode, DecodeError, EncodedChunk};
use super::meter::LevelTap;

/// Rate of inbound model audio and of the scheduler's clock
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

pub type SourceId = u64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Failed to decode audio chunk: {0}")]
    Decode(#[from] DecodeError),
    #[error("No audio output device is available")]
    DeviceUnavailable,
    #[error("Audio output failed: {0}")]
    Device(String),
}

/// An open output device with a monotonic clock
pub trait AudioOutput {
    /// Device clock in seconds
    fn current_time(&self) -> f64;

    /// Play `samples` (at the scheduler's rate) starting at `start_at` seconds.
    fn start_source(
        &mut self,
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    /// Stop a source immediately. Stopped sources do not report an end.
    fn stop_source(&mut self, id: SourceId);
}

/// Factory for output devices
pub trait Speaker {
    /// Open the output. Mixed output is pushed into `tap`; finished sources
    /// are reported on `ended`.
    fn open_output(
        &mut self,
        sample_rate: u32,
        tap: LevelTap,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, PlaybackError>;
}

/// Placement of one chunk on the device clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    next_start_time: f64,
    active: HashMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            next_start_time: 0.0,
            active: HashMap::new(),
            next_id: 1,
        }
    }

    /// Decode `chunk` and schedule it directly after everything already queued.
    ///
    /// On error the chunk is dropped and the cursor is left untouched.
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> Result<ScheduledSource, PlaybackError> {
        let samples = decode(chunk, self.sample_rate)?;
        let duration = samples.len() as f64 / self.sample_rate as f64;

        let now = self.output.current_time();
        let start_at = self.next_start_time.max(now);

        let id = self.next_id;
        self.output.start_source(id, samples.into(), start_at)?;
        self.next_id += 1;

        let source = ScheduledSource {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, source);
        self.next_start_time = start_at + duration;

        log::debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} active)",
            id,
            start_at,
            duration,
            self.active.len()
        );

        Ok(source)
    }

    /// Forget a source that finished on its own. Returns false for unknown ids.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stop all sources and reset the cursor. Returns how many were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.output.stop_source(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;

        if stopped > 0 {
            log::info!("Playback flushed ({} sources stopped)", stopped);
        }
        stopped
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }
}
