use base64::Engine;
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

pub const REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
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

/// Splits samples into fixed-size chunks, zero-padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Creates a new ring buffer on the heap for shared audio data.
pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

/// Averages interleaved multi-channel samples down to mono.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

/// Feeds arbitrary-length input through a fixed-chunk resampler, keeping the remainder
/// for the next call.
pub struct ChunkedResampler {
    resampler: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl ChunkedResampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64, chunk_size: usize) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_sampling_rate, out_sampling_rate, chunk_size)?,
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Resamples every complete chunk currently buffered.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut resampled = Vec::new();
        loop {
            let chunk_size = self.resampler.input_frames_next();
            if self.pending.len() < chunk_size {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..chunk_size).collect();
            self.process_into(&chunk, &mut resampled);
        }
        resampled
    }

    /// Pads and resamples whatever is left over.
    pub fn flush(&mut self) -> Vec<f32> {
        let mut resampled = Vec::new();
        if self.pending.is_empty() {
            return resampled;
        }
        let chunk_size = self.resampler.input_frames_next();
        let rest = std::mem::take(&mut self.pending);
        for chunk in split_for_chunks(&rest, chunk_size) {
            self.process_into(&chunk, &mut resampled);
        }
        resampled
    }

    /// Drops buffered input and resampler history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }

    fn process_into(&mut self, chunk: &[f32], out: &mut Vec<f32>) {
        match self.resampler.process(&[chunk], None) {
            Ok(resamples) => {
                if let Some(resamples) = resamples.first() {
                    out.extend_from_slice(resamples);
                }
            }
            Err(e) => tracing::warn!("failed to resample chunk: {}", e),
        }
    }
}

/// Decodes base64 into raw bytes.
pub fn decode_bytes(base64_fragment: &str) -> anyhow::Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(base64_fragment)?)
}

/// Encodes raw bytes as base64.
pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Interprets little-endian PCM16 bytes as f32 samples in [-1.0, 1.0].
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Encodes f32 samples as little-endian PCM16 bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples.to_binary()
}

/// Converts audio sample slices to little-endian PCM16 bytes.
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [f32] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|&sample| {
                let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                v.to_le_bytes()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_bytes_to_f32() {
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0xFF];
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_f32_to_pcm16_clamps() {
        let bytes = f32_to_pcm16(&[1.5, -2.0, 0.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_bytes_rejects_bad_base64() {
        assert!(decode_bytes("%%").is_err());
        assert_eq!(decode_bytes(&encode_bytes(&[1, 2, 3])).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25], 1), vec![0.25]);
    }

    #[test]
    fn test_split_for_chunks_pads_last() {
        let chunks = split_for_chunks(&[1.0, 2.0, 3.0], 2);
        assert_eq!(chunks, vec![vec![1.0, 2.0], vec![3.0, 0.0]]);
    }

    #[test]
    fn test_chunked_resampler_keeps_remainder() {
        let mut resampler = ChunkedResampler::new(24000.0, 48000.0, 480).unwrap();
        // Less than one chunk produces nothing yet.
        assert!(resampler.push(&[0.0; 300]).is_empty());
        let out = resampler.push(&[0.0; 300]);
        assert!(!out.is_empty());
        let tail = resampler.flush();
        assert!(!tail.is_empty());
        assert!(resampler.flush().is_empty());
    }
}
