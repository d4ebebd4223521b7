//! PCM16 wire encoding for live audio chunks
//!
//! Outbound microphone frames are encoded as 16-bit signed little-endian PCM
//! and tagged with an [`AudioFormat`] so the receiver can self-describe the
//! stream. Inbound chunks are decoded back to `f32` samples at the playback
//! rate; raw PCM16 and WAV containers are accepted.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};

use super::resample::resample;

/// Bit depth of every chunk this crate produces
pub const PCM16_BITS: u16 = 16;

/// Container/encoding of a chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Headerless little-endian signed 16-bit PCM, mono
    Pcm16,
    /// RIFF/WAV container (any bit depth hound can read)
    Wav,
}

/// Format tag carried by every [`EncodedChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate
    pub fn pcm16(sample_rate: u32) -> Self {
        Self {
            encoding: Encoding::Pcm16,
            sample_rate,
            bits_per_sample: PCM16_BITS,
        }
    }

    /// Render as a mime type, e.g. `audio/pcm;rate=16000`.
    ///
    /// `audio/pcm` always means 16-bit samples for the live service, so the
    /// bit depth is implied by the subtype rather than spelled out.
    pub fn mime_type(&self) -> String {
        match self.encoding {
            Encoding::Pcm16 => format!("audio/pcm;rate={}", self.sample_rate),
            Encoding::Wav => "audio/wav".to_string(),
        }
    }

    /// Parse a mime type such as `audio/pcm;rate=24000` or `audio/L16;codec=pcm;rate=24000`.
    ///
    /// `default_rate` is used when the mime type carries no `rate` parameter.
    pub fn parse_mime(mime: &str, default_rate: u32) -> Result<Self, DecodeError> {
        let mut params = mime.split(';').map(str::trim);
        let base = params.next().unwrap_or_default().to_ascii_lowercase();

        let encoding = match base.as_str() {
            "audio/pcm" | "audio/l16" => Encoding::Pcm16,
            "audio/wav" | "audio/x-wav" | "audio/wave" => Encoding::Wav,
            _ => return Err(DecodeError::UnsupportedFormat(mime.to_string())),
        };

        let mut format = Self {
            encoding,
            sample_rate: default_rate,
            bits_per_sample: PCM16_BITS,
        };

        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    format.sample_rate = value
                        .trim()
                        .parse()
                        .map_err(|_| DecodeError::UnsupportedFormat(mime.to_string()))?;
                }
                "bits" if encoding == Encoding::Pcm16 && value.trim() != "16" => {
                    return Err(DecodeError::UnsupportedFormat(mime.to_string()));
                }
                _ => {}
            }
        }

        if format.sample_rate == 0 {
            return Err(DecodeError::UnsupportedFormat(mime.to_string()));
        }

        Ok(format)
    }
}

/// Wire unit exchanged with the transport: payload plus format tag
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

impl EncodedChunk {
    pub fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    pub fn mime_type(&self) -> String {
        self.format.mime_type()
    }

    /// Payload as base64, the form the live service expects inside JSON
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    /// Build a chunk from a base64 payload and its mime type
    pub fn from_base64(mime: &str, data: &str, default_rate: u32) -> Result<Self, DecodeError> {
        let format = AudioFormat::parse_mime(mime, default_rate)?;
        let data = STANDARD
            .decode(data)
            .map_err(|e| DecodeError::Malformed(format!("invalid base64: {}", e)))?;
        Ok(Self { format, data })
    }

    /// Playback duration in seconds (PCM16 only; containers report 0 until decoded)
    pub fn duration_secs(&self) -> f64 {
        match self.format.encoding {
            Encoding::Pcm16 => (self.data.len() / 2) as f64 / self.format.sample_rate as f64,
            Encoding::Wav => 0.0,
        }
    }
}

/// Errors from [`encode`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Cannot encode an empty audio frame")]
    EmptyFrame,
}

/// Errors from [`decode`] and mime parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("Truncated PCM16 payload ({0} bytes)")]
    Truncated(usize),
    #[error("Malformed audio container: {0}")]
    Malformed(String),
    #[error("Audio chunk contains no samples")]
    Empty,
}

/// Encode float samples (domain [-1.0, 1.0]) as a PCM16 chunk.
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<EncodedChunk, EncodeError> {
    if samples.is_empty() {
        return Err(EncodeError::EmptyFrame);
    }

    let data: Vec<u8> = samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect();

    Ok(EncodedChunk::new(AudioFormat::pcm16(sample_rate), data))
}

/// Decode a chunk into mono `f32` samples at `target_rate`.
pub fn decode(chunk: &EncodedChunk, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    let (samples, source_rate) = match chunk.format.encoding {
        Encoding::Pcm16 => (decode_pcm16(&chunk.data)?, chunk.format.sample_rate),
        Encoding::Wav => decode_wav(&chunk.data)?,
    };

    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(resample(&samples, source_rate, target_rate))
}

/// Clamp to [-1, 1] and scale to i16.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

fn decode_pcm16(data: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if data.len() % 2 != 0 {
        return Err(DecodeError::Truncated(data.len()));
    }

    Ok(data
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32), DecodeError> {
    let reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| DecodeError::Malformed(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| DecodeError::Malformed(e.to_string()))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_encode_little_endian_layout() {
        let chunk = encode(&[0.5, -0.5], 16000).unwrap();

        // 0.5 * 32767 = 16383 = 0x3FFF
        assert_eq!(chunk.data, vec![0xFF, 0x3F, 0x01, 0xC0]);
        assert_eq!(chunk.format, AudioFormat::pcm16(16000));
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_encode_rejects_empty_frame() {
        assert_eq!(encode(&[], 16000), Err(EncodeError::EmptyFrame));
    }

    #[test]
    fn test_parse_mime_variants() {
        let f = AudioFormat::parse_mime("audio/pcm;rate=24000", 16000).unwrap();
        assert_eq!(f, AudioFormat::pcm16(24000));

        let f = AudioFormat::parse_mime("audio/L16;codec=pcm;rate=22050", 16000).unwrap();
        assert_eq!(f.sample_rate, 22050);

        // Missing rate falls back to the default
        let f = AudioFormat::parse_mime("audio/pcm", 24000).unwrap();
        assert_eq!(f.sample_rate, 24000);

        assert_eq!(
            AudioFormat::parse_mime("audio/x-wav", 24000).unwrap().encoding,
            Encoding::Wav
        );
        assert!(AudioFormat::parse_mime("audio/mpeg", 24000).is_err());
        assert!(AudioFormat::parse_mime("audio/pcm;bits=8", 24000).is_err());
        assert!(AudioFormat::parse_mime("audio/pcm;rate=abc", 24000).is_err());
    }

    #[test]
    fn test_decode_pcm16() {
        let chunk = EncodedChunk::new(AudioFormat::pcm16(24000), vec![0x00, 0x40, 0x00, 0xC0]);
        let samples = decode(&chunk, 24000).unwrap();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let chunk = EncodedChunk::new(AudioFormat::pcm16(24000), vec![0x00, 0x40, 0x00]);
        assert_eq!(decode(&chunk, 24000), Err(DecodeError::Truncated(3)));
    }

    #[test]
    fn test_decode_empty_payload() {
        let chunk = EncodedChunk::new(AudioFormat::pcm16(24000), vec![]);
        assert_eq!(decode(&chunk, 24000), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_resamples_to_target_rate() {
        let chunk = encode(&vec![0.25f32; 1200], 12000).unwrap();
        let samples = decode(&chunk, 24000).unwrap();
        assert_eq!(samples.len(), 2400);
    }

    #[test]
    fn test_decode_wav_container() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 24000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..100 {
                writer.write_sample(16384i16).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let chunk = EncodedChunk::new(
            AudioFormat::parse_mime("audio/wav", 24000).unwrap(),
            cursor.into_inner(),
        );
        let samples = decode(&chunk, 24000).unwrap();

        // Stereo downmixed to mono: (0.5 + 0.0) / 2
        assert_eq!(samples.len(), 100);
        assert!((samples[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_decode_malformed_wav() {
        let chunk = EncodedChunk::new(
            AudioFormat::parse_mime("audio/wav", 24000).unwrap(),
            b"RIFF\x00\x00not a wave".to_vec(),
        );
        assert!(matches!(decode(&chunk, 24000), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_base64_round_trip_preserves_bytes() {
        let chunk = encode(&[0.1, 0.2, 0.3], 16000).unwrap();
        let restored =
            EncodedChunk::from_base64(&chunk.mime_type(), &chunk.to_base64(), 24000).unwrap();
        assert_eq!(restored, chunk);
    }

    #[test]
    fn test_duration_secs() {
        let chunk = encode(&vec![0.0f32; 24000], 24000).unwrap();
        assert!((chunk.duration_secs() - 1.0).abs() < f64::EPSILON);
    }
}
