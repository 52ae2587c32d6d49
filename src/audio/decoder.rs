//! # Audio Payload Decoding
//!
//! Turns the base64 `data` field of a `complete_audio` message into mono `f32` PCM
//! plus its sample rate.
//!
//! ## Supported formats:
//! - **wav**: RIFF/WAVE, 8/16/24-bit integer or 32-bit float, any channel count
//! - **pcm_s16le** (alias `pcm`): headerless 16-bit little-endian mono
//! - **pcm_f32le**: headerless 32-bit float little-endian mono
//!
//! Browser containers such as `webm`/`opus` need a codec this service does not ship;
//! they are rejected with a processing error so the client can re-encode.

use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::debug;

/// Decoded mono audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Container/encoding named in the message `format` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    PcmS16Le,
    PcmF32Le,
}

impl std::str::FromStr for AudioFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" | "wave" | "audio/wav" | "audio/x-wav" => Ok(AudioFormat::Wav),
            "pcm" | "pcm_s16le" | "s16le" => Ok(AudioFormat::PcmS16Le),
            "pcm_f32le" | "f32le" => Ok(AudioFormat::PcmF32Le),
            other => Err(AppError::Processing(format!("Unsupported audio format: {}", other))),
        }
    }
}

/// Audio decoding with payload limits.
pub struct AudioDecoder {
    max_bytes: usize,
    default_sample_rate: u32,
}

impl AudioDecoder {
    pub fn new(max_bytes: usize, default_sample_rate: u32) -> Self {
        Self {
            max_bytes,
            default_sample_rate,
        }
    }

    /// Decode a base64 payload in the given format.
    ///
    /// `sample_rate` is only consulted for headerless PCM; WAV carries its own.
    pub fn decode(&self, data: &str, format: &str, sample_rate: Option<u32>) -> AppResult<DecodedAudio> {
        let format: AudioFormat = format.parse()?;
        let bytes = decode_base64(data)?;

        if bytes.is_empty() {
            return Err(AppError::Processing("Audio data is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(AppError::Processing(format!(
                "Audio payload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_bytes
            )));
        }
        debug!(bytes = bytes.len(), ?format, "Decoding audio payload");

        let audio = match format {
            AudioFormat::Wav => decode_wav(&bytes)?,
            AudioFormat::PcmS16Le => DecodedAudio {
                samples: pcm_s16le_to_float(&bytes)?,
                sample_rate: sample_rate.unwrap_or(self.default_sample_rate),
            },
            AudioFormat::PcmF32Le => DecodedAudio {
                samples: pcm_f32le_to_float(&bytes)?,
                sample_rate: sample_rate.unwrap_or(self.default_sample_rate),
            },
        };

        if audio.sample_rate == 0 {
            return Err(AppError::Processing("Sample rate must be greater than 0".to_string()));
        }
        if audio.samples.iter().any(|s| !s.is_finite()) {
            return Err(AppError::Processing("Audio contains non-finite samples".to_string()));
        }

        debug!(
            samples = audio.samples.len(),
            sample_rate = audio.sample_rate,
            "Decoded audio"
        );
        Ok(audio)
    }
}

/// Strip an optional `data:<mime>;base64,` prefix and decode.
fn decode_base64(data: &str) -> AppResult<Vec<u8>> {
    let payload = match data.find(";base64,") {
        Some(idx) if data.starts_with("data:") => &data[idx + ";base64,".len()..],
        _ => data,
    };
    BASE64
        .decode(payload.trim())
        .map_err(|e| AppError::ValidationError(format!("Audio data is not valid base64: {}", e)))
}

/// Decode a RIFF/WAVE file and downmix to mono.
fn decode_wav(bytes: &[u8]) -> AppResult<DecodedAudio> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AppError::Processing(format!("Invalid WAV data: {}", e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .iter()
            .map(|&s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .iter()
            .map(|&s| s as f32 / 8_388_607.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        _ => return Err(AppError::Processing("WAV file contains no samples".to_string())),
    };

    let channels = header.channel_count.max(1) as usize;
    Ok(DecodedAudio {
        samples: downmix(&interleaved, channels),
        sample_rate: header.sampling_rate,
    })
}

/// Average interleaved channels into one.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Convert headerless 16-bit little-endian PCM to floats in [-1, 1].
pub fn pcm_s16le_to_float(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::Processing(
            "Audio data length must be even for 16-bit samples".to_string(),
        ));
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Convert headerless 32-bit float little-endian PCM.
pub fn pcm_f32le_to_float(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Processing(
            "Audio data length must be a multiple of 4 for 32-bit float samples".to_string(),
        ));
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_s16(samples: &[i16]) -> String {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        BASE64.encode(bytes)
    }

    #[test]
    fn test_pcm_s16le_decoding() {
        let decoder = AudioDecoder::new(1024, 8000);
        let audio = decoder
            .decode(&encode_s16(&[0, 16384, -16384]), "pcm_s16le", None)
            .unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples, vec![0.0, 0.5, -0.5]);
    }

    #[test]
    fn test_explicit_sample_rate_and_data_url_prefix() {
        let decoder = AudioDecoder::new(1024, 8000);
        let payload = format!("data:audio/l16;base64,{}", encode_s16(&[100, -100]));
        let audio = decoder.decode(&payload, "pcm", Some(48_000)).unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.samples.len(), 2);
    }

    #[test]
    fn test_odd_length_pcm_rejected() {
        let decoder = AudioDecoder::new(1024, 8000);
        let err = decoder.decode(&BASE64.encode([1u8, 2, 3]), "pcm_s16le", None).unwrap_err();
        assert_eq!(err.code(), "processing_error");
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let decoder = AudioDecoder::new(1024, 8000);
        let err = decoder.decode(&encode_s16(&[1, 2]), "webm", None).unwrap_err();
        assert_eq!(err, AppError::Processing("Unsupported audio format: webm".to_string()));
    }

    #[test]
    fn test_invalid_base64_is_validation_error() {
        let decoder = AudioDecoder::new(1024, 8000);
        let err = decoder.decode("***", "pcm", None).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_payload_limit() {
        let decoder = AudioDecoder::new(4, 8000);
        let err = decoder.decode(&encode_s16(&[1, 2, 3]), "pcm", None).unwrap_err();
        assert!(err.message().contains("exceeds"));
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_wav_round_trip_through_wav_crate() {
        let samples: Vec<i16> = (0..64).map(|i| ((i as f32 * 0.3).sin() * 12000.0) as i16).collect();
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, 22_050, 16);
        let mut bytes = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples.clone()), &mut bytes).unwrap();

        let decoder = AudioDecoder::new(1 << 20, 8000);
        let audio = decoder.decode(&BASE64.encode(bytes.into_inner()), "wav", None).unwrap();
        assert_eq!(audio.sample_rate, 22_050);
        assert_eq!(audio.samples.len(), samples.len());
        assert!((audio.samples[10] - samples[10] as f32 / i16::MAX as f32).abs() < 1e-6);
    }
}
