//! Sample-rate conversion and channel downmixing
//!
//! Device rates rarely match the wire rates (16 kHz up, 24 kHz down), so both
//! the capture path and the playback path convert here. Linear interpolation
//! is enough for speech.

/// Average interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// One-shot resample of a complete buffer.
///
/// Returns the input unchanged when the rates match or either rate is zero.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    resample_to_len(samples, out_len)
}

/// Stretch or squeeze a buffer to exactly `out_len` samples.
///
/// Used where the output length is fixed by the destination clock rather
/// than by the rate ratio.
pub fn resample_to_len(samples: &[f32], out_len: usize) -> Vec<f32> {
    if samples.is_empty() || out_len == 0 {
        return Vec::new();
    }
    if out_len == samples.len() {
        return samples.to_vec();
    }

    let step = samples.len() as f64 / out_len as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Streaming linear resampler that keeps its phase across blocks.
///
/// Device callbacks deliver arbitrary block sizes; carrying the fractional
/// read position and the previous block's last sample keeps the output free
/// of seams and drift.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    step: f64,
    /// Read position of the next output sample, relative to the current block.
    /// `-1.0 <= pos < 0.0` interpolates from `prev`.
    pos: f64,
    prev: Option<f32>,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let step = if source_rate == 0 || target_rate == 0 {
            1.0
        } else {
            source_rate as f64 / target_rate as f64
        };

        Self {
            source_rate,
            target_rate,
            step,
            pos: 0.0,
            prev: None,
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Convert one block, appending output to `out`.
    pub fn process(&mut self, block: &[f32], out: &mut Vec<f32>) {
        if block.is_empty() {
            return;
        }

        if self.source_rate == self.target_rate {
            out.extend_from_slice(block);
            return;
        }

        let n = block.len();
        let sample_at = |i: isize, prev: Option<f32>| -> f32 {
            if i < 0 {
                prev.unwrap_or(block[0])
            } else {
                block[(i as usize).min(n - 1)]
            }
        };

        while self.pos <= (n - 1) as f64 {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            let i = base as isize;
            let a = sample_at(i, self.prev);
            let b = sample_at(i + 1, self.prev);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= n as f64;
        self.prev = Some(block[n - 1]);
    }
}
