//! Level meter for UI volume feedback
//!
//! Two analysis taps (microphone and speaker) each keep the most recent
//! `FFT_SIZE` samples. On every render tick the meter computes a smoothed
//! magnitude spectrum per tap, maps it to the 0-255 byte scale and averages
//! the bins. The louder of the two taps wins, so the meter follows whoever is
//! talking.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};

/// Analysis window length in samples
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins produced per window
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Upper bound of [`LevelMeter::sample`]
pub const MAX_LEVEL: f32 = 255.0;

/// Time smoothing between consecutive spectra (0 = none)
const SMOOTHING: f32 = 0.8;

/// dB range mapped onto 0..=255
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Shared ring buffer fed from an audio callback
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct LevelTap {
    samples: Arc<Mutex<VecDeque<f32>>>,
}

impl LevelTap {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::from(vec![0.0; FFT_SIZE]))),
        }
    }

    /// Append samples, keeping only the latest `FFT_SIZE`.
    pub fn push(&self, samples: &[f32]) {
        let Ok(mut buffer) = self.samples.lock() else {
            return;
        };

        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let overflow = (buffer.len() + tail.len()).saturating_sub(FFT_SIZE);
        buffer.drain(..overflow);
        buffer.extend(tail);
    }

    /// Copy of the current analysis window
    pub fn window(&self) -> [f32; FFT_SIZE] {
        let mut out = [0.0; FFT_SIZE];
        if let Ok(buffer) = self.samples.lock() {
            for (dst, src) in out.iter_mut().zip(buffer.iter()) {
                *dst = *src;
            }
        }
        out
    }

    /// Reset to silence
    pub fn clear(&self) {
        if let Ok(mut buffer) = self.samples.lock() {
            buffer.clear();
            buffer.extend(std::iter::repeat(0.0).take(FFT_SIZE));
        }
    }
}

impl Default for LevelTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed DFT with per-bin exponential smoothing
struct SpectrumAnalyser {
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: [f32; BIN_COUNT],
}

impl SpectrumAnalyser {
    fn new() -> Self {
        // Blackman window
        let window = (0..FFT_SIZE)
            .map(|n| {
                let x = n as f32 / FFT_SIZE as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f32 / FFT_SIZE as f32).cos())
            .collect();
        let sin_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f32 / FFT_SIZE as f32).sin())
            .collect();

        Self {
            window,
            cos_table,
            sin_table,
            smoothed: [0.0; BIN_COUNT],
        }
    }

    /// Average byte-scaled magnitude over all bins (0.0-255.0)
    fn average_level(&mut self, block: &[f32; FFT_SIZE]) -> f32 {
        let windowed: Vec<f32> = block
            .iter()
            .zip(self.window.iter())
            .map(|(s, w)| s * w)
            .collect();

        let mut total = 0.0f32;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (n, x) in windowed.iter().enumerate() {
                let idx = (k * n) % FFT_SIZE;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f32;

            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            total += byte_scale(*smoothed);
        }

        total / BIN_COUNT as f32
    }

    fn reset(&mut self) {
        self.smoothed = [0.0; BIN_COUNT];
    }
}

/// Map a linear magnitude onto 0..=255 across the dB range.
fn byte_scale(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = MAX_LEVEL * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, MAX_LEVEL)
}

/// Combines the capture and playback taps into a single volume value
pub struct LevelMeter {
    capture_tap: LevelTap,
    playback_tap: LevelTap,
    capture: SpectrumAnalyser,
    playback: SpectrumAnalyser,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            capture_tap: LevelTap::new(),
            playback_tap: LevelTap::new(),
            capture: SpectrumAnalyser::new(),
            playback: SpectrumAnalyser::new(),
        }
    }

    /// Tap to feed with microphone samples
    pub fn capture_tap(&self) -> LevelTap {
        self.capture_tap.clone()
    }

    /// Tap to feed with mixed speaker output
    pub fn playback_tap(&self) -> LevelTap {
        self.playback_tap.clone()
    }

    /// Instantaneous loudness in 0.0..=255.0, the louder of the two taps.
    pub fn sample(&mut self) -> f32 {
        let input = self.capture.average_level(&self.capture_tap.window());
        let output = self.playback.average_level(&self.playback_tap.window());
        input.max(output)
    }

    /// Forget smoothing history and silence both taps
    pub fn reset(&mut self) {
        self.capture.reset();
        self.playback.reset();
        self.capture_tap.clear();
        self.playback_tap.clear();
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}
