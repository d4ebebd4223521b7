//! Audio side of a live session
//!
//! Microphone capture and PCM16 framing on the way out, decoding and
//! gap-free scheduling on the way back, plus the level meter fed by both.
//! cpal is the device backend; everything above it works through the
//! `Microphone` / `Speaker` traits so it can run against fakes.

pub mod capture;
pub mod device;
pub mod encoder;
pub mod meter;
pub mod playback;
pub mod resample;

pub use capture::{
    CaptureConfig, CaptureError, CaptureHandle, CapturePipeline, FrameSink, InputStream,
    Microphone, SampleSink, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES,
};
pub use device::{CpalMicrophone, CpalSpeaker};
pub use encoder::{decode, encode, AudioFormat, DecodeError, EncodeError, EncodedChunk, Encoding};
pub use meter::{LevelMeter, LevelTap};
pub use playback::{
    AudioOutput, PlaybackError, PlaybackScheduler, ScheduledSource, SourceId, Speaker,
    OUTPUT_SAMPLE_RATE,
};
