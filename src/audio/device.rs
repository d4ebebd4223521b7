//! cpal-backed microphone and speaker
//!
//! The microphone downmixes each device block to mono and forwards it to the
//! capture pipeline's sink. The speaker runs a small mixer: every scheduled
//! source is a voice pinned to a frame index on the device clock, and the
//! clock is the number of frames rendered so far.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::capture::{CaptureError, InputStream, Microphone, SampleSink};
use super::meter::LevelTap;
use super::playback::{AudioOutput, PlaybackError, SourceId, Speaker};
use super::resample::{downmix, resample_to_len};

/// Map a backend error message onto the capture error the UI understands.
fn classify_input_error(message: String) -> CaptureError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied
    } else if lower.contains("not available") || lower.contains("no device") {
        CaptureError::DeviceUnavailable
    } else {
        CaptureError::StreamFailed(message)
    }
}

/// Default input device of the default host
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl Microphone for CpalMicrophone {
    fn open_input(&mut self, sink: SampleSink) -> Result<InputStream, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::DeviceUnavailable)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported = device
            .default_input_config()
            .map_err(|e| classify_input_error(e.to_string()))?;

        log::info!(
            "Input config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match sample_format {
            SampleFormat::I16 => build_input::<i16>(&device, &config, sink),
            SampleFormat::U16 => build_input::<u16>(&device, &config, sink),
            SampleFormat::F32 => build_input::<f32>(&device, &config, sink),
            other => Err(CaptureError::StreamFailed(format!(
                "Unsupported input sample format: {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| classify_input_error(format!("Failed to start input stream: {}", e)))?;

        Ok(InputStream::new(Box::new(stream)))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: SampleSink,
) -> Result<Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let rate = config.sample_rate.0;
    let mut block: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                block.clear();
                block.extend(data.iter().map(|s| s.to_sample::<f32>()));
                let mono = downmix(&block, channels);
                sink(&mono, rate);
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| classify_input_error(e.to_string()))
}

struct Voice {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

impl Voice {
    /// Pin a source-rate buffer onto the device clock.
    ///
    /// Both ends are rounded from the scheduled time span, so back-to-back
    /// sources share a boundary frame and never leave a gap or overlap.
    fn place(
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: f64,
        source_rate: u32,
        device_rate: u32,
    ) -> Self {
        let to_frame = |t: f64| (t * device_rate as f64).round().max(0.0) as u64;
        let start_frame = to_frame(start_at);

        let samples = if source_rate == device_rate || source_rate == 0 {
            samples
        } else {
            let duration = samples.len() as f64 / source_rate as f64;
            let frames = to_frame(start_at + duration).saturating_sub(start_frame) as usize;
            resample_to_len(&samples, frames).into()
        };

        Self {
            id,
            samples,
            start_frame,
        }
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    voices: Vec<Voice>,
    /// Frames rendered since the stream started
    clock: u64,
}

impl Mixer {
    /// Render `frames` mono samples into `out` and advance the clock.
    /// Returns the ids of voices that finished during this block.
    fn render(&mut self, out: &mut Vec<f32>, frames: usize) -> Vec<SourceId> {
        out.clear();
        out.resize(frames, 0.0);

        let block_start = self.clock;
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                let src = (frame - voice.start_frame) as usize;
                let dst = (frame - block_start) as usize;
                out[dst] += voice.samples[src];
            }
        }

        self.clock = block_end;

        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Default output device of the default host
#[derive(Debug, Default)]
pub struct CpalSpeaker;

impl CpalSpeaker {
    pub fn new() -> Self {
        Self
    }
}

impl Speaker for CpalSpeaker {
    fn open_output(
        &mut self,
        sample_rate: u32,
        tap: LevelTap,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(PlaybackError::DeviceUnavailable)?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        log::info!(
            "Output config: {} Hz, {} channels, {:?}",
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let mixer = Arc::new(Mutex::new(Mixer::default()));

        let stream = match sample_format {
            SampleFormat::I16 => build_output::<i16>(&device, &config, mixer.clone(), tap, ended),
            SampleFormat::U16 => build_output::<u16>(&device, &config, mixer.clone(), tap, ended),
            SampleFormat::F32 => build_output::<f32>(&device, &config, mixer.clone(), tap, ended),
            other => Err(PlaybackError::Device(format!(
                "Unsupported output sample format: {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::Device(format!("Failed to start output stream: {}", e)))?;

        Ok(Box::new(CpalOutput {
            _stream: stream,
            mixer,
            device_rate: config.sample_rate.0,
            source_rate: sample_rate,
        }))
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    tap: LevelTap,
    ended: mpsc::UnboundedSender<SourceId>,
) -> Result<Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut mix: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let finished = match mixer.lock() {
                    Ok(mut mixer) => mixer.render(&mut mix, frames),
                    Err(_) => {
                        mix.clear();
                        mix.resize(frames, 0.0);
                        Vec::new()
                    }
                };

                for (frame, value) in data.chunks_mut(channels).zip(mix.iter()) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }

                tap.push(&mix);

                for id in finished {
                    let _ = ended.send(id);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::Device(e.to_string()))
}

/// Running output stream plus its mixer
pub struct CpalOutput {
    _stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
    source_rate: u32,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        let clock = self.mixer.lock().map(|m| m.clock).unwrap_or_default();
        clock as f64 / self.device_rate as f64
    }

    fn start_source(
        &mut self,
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let voice = Voice::place(id, samples, start_at, self.source_rate, self.device_rate);

        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| PlaybackError::Device("mixer lock poisoned".into()))?;
        mixer.voices.push(voice);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.retain(|voice| voice.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_input_error() {
        assert_eq!(
            classify_input_error("Permission denied by the system".into()),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            classify_input_error("The requested device is no longer available".into()),
            CaptureError::StreamFailed("The requested device is no longer available".into())
        );
        assert_eq!(
            classify_input_error("device not available".into()),
            CaptureError::DeviceUnavailable
        );
    }

    #[test]
    fn test_mixer_places_voice_on_clock() {
        let mut mixer = Mixer::default();
        mixer.voices.push(Voice {
            id: 1,
            samples: vec![0.5; 4].into(),
            start_frame: 2,
        });

        let mut out = Vec::new();
        let finished = mixer.render(&mut out, 4);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert!(finished.is_empty());

        let finished = mixer.render(&mut out, 4);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(finished, vec![1]);
        assert_eq!(mixer.clock, 8);
    }

    #[test]
    fn test_mixer_sums_overlapping_voices() {
        let mut mixer = Mixer::default();
        for id in [1, 2] {
            mixer.voices.push(Voice {
                id,
                samples: vec![0.25; 2].into(),
                start_frame: 0,
            });
        }

        let mut out = Vec::new();
        let finished = mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5]);
        assert_eq!(finished, vec![1, 2]);
    }

    #[test]
    fn test_mixer_back_to_back_sources_at_uneven_ratio() {
        // 24 kHz chunks on a 44.1 kHz clock: 1000 samples span 1837.5 frames
        let chunk: Arc<[f32]> = vec![0.5; 1000].into();
        let duration = 1000.0 / 24000.0;

        let mut mixer = Mixer::default();
        let first = Voice::place(1, chunk.clone(), 0.0, 24000, 44100);
        let second = Voice::place(2, chunk, duration, 24000, 44100);
        assert_eq!(first.end_frame(), second.start_frame);
        let end = second.end_frame() as usize;
        assert_eq!(end, 3675);
        mixer.voices.push(first);
        mixer.voices.push(second);

        let mut out = Vec::new();
        let finished = mixer.render(&mut out, 4000);
        assert!(out[..end].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(out[end..].iter().all(|&s| s == 0.0));
        assert_eq!(finished, vec![1, 2]);
    }

    #[test]
    fn test_voice_place_keeps_matching_rate() {
        let voice = Voice::place(3, vec![0.1, 0.2].into(), 0.5, 24000, 24000);
        assert_eq!(voice.start_frame, 12000);
        assert_eq!(voice.samples.len(), 2);
    }
}
