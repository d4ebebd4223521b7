//! Microphone capture pipeline
//!
//! Device callbacks hand over mono samples at whatever rate the hardware
//! runs. The pipeline feeds the level meter tap, resamples to the wire rate,
//! cuts fixed-size frames and encodes each one before handing it to the
//! frame sink. Frames are only produced while the handle is armed.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::encoder::{encode, EncodedChunk};
use super::meter::LevelTap;
use super::resample::StreamResampler;

/// Wire rate of outbound microphone audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Samples per outbound frame
pub const FRAME_SAMPLES: usize = 4096;

/// Errors raised while acquiring or running the microphone
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone access was denied")]
    PermissionDenied,
    #[error("No microphone is available")]
    DeviceUnavailable,
    #[error("Microphone stream failed: {0}")]
    StreamFailed(String),
}

/// Receives mono samples and the device rate they were captured at.
pub type SampleSink = Box<dyn FnMut(&[f32], u32) + Send + 'static>;

/// Receives each encoded frame, in capture order.
pub type FrameSink = Box<dyn FnMut(EncodedChunk) + Send + 'static>;

/// Keeps an open input device alive. Dropping it releases the device.
pub struct InputStream {
    _guard: Box<dyn Any>,
}

impl InputStream {
    pub fn new(guard: Box<dyn Any>) -> Self {
        Self { _guard: guard }
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream").finish_non_exhaustive()
    }
}

/// Source of microphone samples (cpal in production, fakes in tests)
pub trait Microphone {
    /// Open the input and start calling `sink` from the audio thread.
    fn open_input(&mut self, sink: SampleSink) -> Result<InputStream, CaptureError>;
}

/// Frame geometry for outbound audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

/// Cuts an arbitrary sample stream into fixed-length frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples; `emit` is called once per completed frame.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_samples {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Handle to an open microphone
///
/// Returned paused. `start()` arms frame delivery, `pause()` disarms it and
/// `stop()` releases the device. Dropping the handle stops it.
pub struct CaptureHandle {
    stream: Option<InputStream>,
    armed: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl CaptureHandle {
    pub fn start(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            log::info!("Capture armed");
        }
    }

    pub fn pause(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Disarm and release the microphone. Safe to call more than once.
    pub fn stop(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
        if self.stream.take().is_some() {
            log::info!(
                "Capture stopped after {} frames",
                self.frames.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds capture handles for a fixed frame geometry
#[derive(Debug, Clone, Copy, Default)]
pub struct CapturePipeline {
    config: CaptureConfig,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Acquire the microphone without delivering frames yet.
    pub fn open(
        &self,
        mic: &mut dyn Microphone,
        tap: LevelTap,
        on_frame: FrameSink,
    ) -> Result<CaptureHandle, CaptureError> {
        let armed = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));

        let sink = frame_sink(self.config, tap, armed.clone(), frames.clone(), on_frame);
        let stream = mic.open_input(sink)?;

        log::info!(
            "Microphone open ({} Hz, {} samples per frame)",
            self.config.sample_rate,
            self.config.frame_samples
        );

        Ok(CaptureHandle {
            stream: Some(stream),
            armed,
            frames,
        })
    }

    /// Acquire the microphone and deliver frames immediately.
    pub fn start(
        &self,
        mic: &mut dyn Microphone,
        tap: LevelTap,
        on_frame: FrameSink,
    ) -> Result<CaptureHandle, CaptureError> {
        let handle = self.open(mic, tap, on_frame)?;
        handle.start();
        Ok(handle)
    }
}

/// Build the callback run on the audio thread for every device block.
fn frame_sink(
    config: CaptureConfig,
    tap: LevelTap,
    armed: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    mut on_frame: FrameSink,
) -> SampleSink {
    let mut assembler = FrameAssembler::new(config.frame_samples);
    let mut resampler: Option<StreamResampler> = None;
    let mut was_armed = false;
    let mut converted = Vec::new();

    Box::new(move |samples: &[f32], device_rate: u32| {
        tap.push(samples);

        let is_armed = armed.load(Ordering::SeqCst);
        if !is_armed {
            was_armed = false;
            return;
        }
        if !was_armed {
            // Fresh arm: never splice audio from before the pause
            assembler.clear();
            resampler = None;
            was_armed = true;
        }

        if resampler.as_ref().map(StreamResampler::source_rate) != Some(device_rate) {
            resampler = Some(StreamResampler::new(device_rate, config.sample_rate));
        }

        converted.clear();
        if let Some(resampler) = resampler.as_mut() {
            resampler.process(samples, &mut converted);
        }

        assembler.push(&converted, |frame| match encode(frame, config.sample_rate) {
            Ok(chunk) => {
                let n = frames.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 50 == 0 {
                    log::debug!("Captured {} frames", n);
                }
                on_frame(chunk);
            }
            Err(e) => log::warn!("Dropping capture frame: {}", e),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type SharedSink = Arc<Mutex<Option<SampleSink>>>;

    /// Microphone whose callback is driven by the test
    #[derive(Default)]
    struct FakeMic {
        sink: SharedSink,
        deny: bool,
    }

    impl FakeMic {
        fn feed(&self, samples: &[f32], rate: u32) {
            if let Some(sink) = self.sink.lock().unwrap().as_mut() {
                sink(samples, rate);
            }
        }
    }

    struct ReleaseFlag(Arc<AtomicBool>);

    impl Drop for ReleaseFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Microphone for FakeMic {
        fn open_input(&mut self, sink: SampleSink) -> Result<InputStream, CaptureError> {
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            *self.sink.lock().unwrap() = Some(sink);
            Ok(InputStream::new(Box::new(())))
        }
    }

    fn collector() -> (Arc<Mutex<Vec<EncodedChunk>>>, FrameSink) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = frames.clone();
        (
            frames,
            Box::new(move |chunk| sink_frames.lock().unwrap().push(chunk)),
        )
    }

    #[test]
    fn test_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        let mut out: Vec<Vec<f32>> = Vec::new();

        assembler.push(&[1.0, 2.0, 3.0], |f| out.push(f.to_vec()));
        assert!(out.is_empty());
        assembler.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| out.push(f.to_vec()));

        assert_eq!(out, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_frames_only_while_armed() {
        let mut mic = FakeMic::default();
        let (frames, on_frame) = collector();
        let mut handle = CapturePipeline::default()
            .open(&mut mic, LevelTap::new(), on_frame)
            .unwrap();

        mic.feed(&vec![0.1; FRAME_SAMPLES * 2], CAPTURE_SAMPLE_RATE);
        assert!(frames.lock().unwrap().is_empty());

        handle.start();
        mic.feed(&vec![0.1; FRAME_SAMPLES * 2 + 10], CAPTURE_SAMPLE_RATE);
        assert_eq!(frames.lock().unwrap().len(), 2);
        assert_eq!(handle.frames_delivered(), 2);

        handle.stop();
        mic.feed(&vec![0.1; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE);
        assert_eq!(frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_frames_are_wire_format() {
        let mut mic = FakeMic::default();
        let (frames, on_frame) = collector();
        let _handle = CapturePipeline::default()
            .start(&mut mic, LevelTap::new(), on_frame)
            .unwrap();

        // 48 kHz device: three device samples per wire sample
        mic.feed(&vec![0.5; FRAME_SAMPLES * 3], 48000);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), FRAME_SAMPLES * 2);
        assert_eq!(frames[0].mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_frames_keep_capture_order() {
        let mut mic = FakeMic::default();
        let (frames, on_frame) = collector();
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_samples: 2,
        };
        let _handle = CapturePipeline::new(config)
            .start(&mut mic, LevelTap::new(), on_frame)
            .unwrap();

        mic.feed(&[0.1, 0.2, 0.3], 16000);
        mic.feed(&[0.4], 16000);

        let frames = frames.lock().unwrap();
        let expected: Vec<EncodedChunk> = vec![
            encode(&[0.1, 0.2], 16000).unwrap(),
            encode(&[0.3, 0.4], 16000).unwrap(),
        ];
        assert_eq!(*frames, expected);
    }

    #[test]
    fn test_rearm_discards_partial_frame() {
        let mut mic = FakeMic::default();
        let (frames, on_frame) = collector();
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_samples: 2,
        };
        let handle = CapturePipeline::new(config)
            .start(&mut mic, LevelTap::new(), on_frame)
            .unwrap();

        mic.feed(&[0.9], 16000);
        handle.pause();
        mic.feed(&[0.9], 16000);
        handle.start();
        mic.feed(&[0.1, 0.2], 16000);

        let frames = frames.lock().unwrap();
        assert_eq!(*frames, vec![encode(&[0.1, 0.2], 16000).unwrap()]);
    }

    #[test]
    fn test_tap_fed_while_paused() {
        let mut mic = FakeMic::default();
        let tap = LevelTap::new();
        let (_frames, on_frame) = collector();
        let _handle = CapturePipeline::default()
            .open(&mut mic, tap.clone(), on_frame)
            .unwrap();

        mic.feed(&[0.7], CAPTURE_SAMPLE_RATE);
        assert_eq!(tap.window()[crate::audio::meter::FFT_SIZE - 1], 0.7);
    }

    #[test]
    fn test_permission_denied_surfaces() {
        let mut mic = FakeMic {
            deny: true,
            ..Default::default()
        };
        let (_frames, on_frame) = collector();
        let result = CapturePipeline::default().open(&mut mic, LevelTap::new(), on_frame);
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
    }

    #[test]
    fn test_stop_releases_device_once() {
        let released = Arc::new(AtomicBool::new(false));
        let mut handle = CaptureHandle {
            stream: Some(InputStream::new(Box::new(ReleaseFlag(released.clone())))),
            armed: Arc::new(AtomicBool::new(true)),
            frames: Arc::new(AtomicU64::new(0)),
        };

        handle.stop();
        assert!(released.load(Ordering::SeqCst));
        assert!(!handle.is_open());
        assert!(!handle.is_armed());

        handle.stop();
    }
}
