//! PCM16 helpers: byte/sample conversion, base64 framing, resampling and WAV
//! packaging for recognizers that want a container.

use base64::Engine;
use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;

/// Rate the recognition stage expects its input at.
pub const RECOGNITION_SAMPLE_RATE: u32 = 16000;
/// Rate synthesized speech is produced at.
pub(crate) const SYNTHESIS_SAMPLE_RATE: u32 = 24000;

/// Lowest sample rate accepted from a client.
pub const MIN_SAMPLE_RATE: u32 = 8000;
/// Highest sample rate accepted from a client.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

pub fn is_supported_rate(rate: u32) -> bool {
    (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate)
}

/// Creates a mono resampler converting `chunk_size` input frames at a time.
fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Interprets little-endian bytes as PCM16 samples. A trailing odd byte is ignored.
pub(crate) fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Bytes {
    samples
        .iter()
        .flat_map(|sample| sample.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}

fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(fragment)
}

/// Resamples one block of mono PCM16 audio.
pub(crate) fn resample_pcm16(samples: &[i16], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<i16>> {
    for rate in [from_rate, to_rate] {
        anyhow::ensure!(
            is_supported_rate(rate),
            "unsupported sample rate {rate} Hz (expected {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE})"
        );
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = create_resampler(from_rate as f64, to_rate as f64, samples.len())?;
    let input = [convert_i16_to_f32(samples)];
    let output = resampler.process(&input, None)?;
    Ok(output
        .first()
        .map(|channel| convert_f32_to_i16(channel))
        .unwrap_or_default())
}

/// Wraps mono PCM16 samples in a WAV container.
pub(crate) fn encode_wav(samples: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
    }

    #[test]
    fn test_pcm16_bytes() {
        // 16384 little endian, then -256
        let bytes = [0x00u8, 0x40, 0x00, 0xff, 0x07];
        assert_eq!(pcm16_from_bytes(&bytes), vec![16384, -256]);
        assert_eq!(pcm16_to_bytes(&[16384, -256]).as_ref(), &bytes[..4]);
    }

    #[test]
    fn test_sample_conversion() {
        let as_f32 = convert_i16_to_f32(&[16384, i16::MIN, 0]);
        assert_abs_diff_eq!(as_f32[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(as_f32[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(as_f32[2], 0.0, epsilon = 0.0001);

        assert_eq!(convert_f32_to_i16(&[2.0, -2.0, 0.5]), vec![i16::MAX, i16::MIN, 16384]);
    }

    #[test]
    fn test_base64() {
        assert_eq!(decode_base64(&encode_base64(&[1, 2, 3])).unwrap(), vec![1, 2, 3]);
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![1i16, -2, 3];
        assert_eq!(resample_pcm16(&samples, 16000, 16000).unwrap(), samples);
        assert!(resample_pcm16(&[], 8000, 16000).unwrap().is_empty());
    }

    #[test]
    fn test_resample_rejects_unsupported_rates() {
        let samples = vec![0i16; 320];
        let err = resample_pcm16(&samples, 0, 16000).unwrap_err();
        assert!(err.to_string().contains("unsupported sample rate 0"));
        assert!(resample_pcm16(&samples, 400_000, 16000).is_err());
        assert!(resample_pcm16(&samples, 16000, 7999).is_err());
        assert!(resample_pcm16(&samples, MAX_SAMPLE_RATE, 16000).is_ok());
    }

    #[test]
    fn test_resample_upsamples_length() {
        let samples: Vec<i16> = (0..800).map(|i| ((i % 40) * 500) as i16).collect();
        let out = resample_pcm16(&samples, 8000, 16000).unwrap();
        let expected = samples.len() * 2;
        assert!(
            out.len().abs_diff(expected) <= expected / 10,
            "got {} samples, expected about {expected}",
            out.len()
        );
    }

    #[test]
    fn test_encode_wav_header() {
        let wav = encode_wav(&[0, 1000, -1000], 16000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 1000, -1000]);
    }
}
