use crate::error::AudioError;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian PCM.
    Pcm16Le,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Pcm16Le => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            encoding: SampleEncoding::Pcm16Le,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }
}

/// An owned buffer of raw samples tagged with their format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn duration(&self) -> Duration {
        let per_second = self.format.bytes_per_frame() * self.format.sample_rate as usize;
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.data.len() as f64 / per_second as f64)
    }

    /// Joins frames in order. Returns `None` when there is no audio at all.
    pub fn concat(frames: &[AudioFrame]) -> Option<AudioFrame> {
        let first = frames.iter().find(|f| !f.is_empty())?;
        if let Some(other) = frames.iter().find(|f| f.format != first.format) {
            tracing::warn!(
                "joining frames with mixed formats: {:?} and {:?}",
                first.format,
                other.format
            );
        }
        let mut data = Vec::with_capacity(frames.iter().map(AudioFrame::len).sum());
        for frame in frames {
            data.extend_from_slice(&frame.data);
        }
        Some(AudioFrame::new(data, first.format))
    }
}

/// Identifies an open capture or playback stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A single duplex audio device.
///
/// `read` and `write` must be cancel-safe: the session drops their futures when a
/// stream is stopped mid-call.
#[async_trait]
pub trait AudioIo: Send + Sync {
    async fn start_capture(&self) -> Result<StreamHandle, AudioError>;

    /// Next captured frame, or `None` once the stream has ended.
    async fn read(&self, handle: StreamHandle) -> Result<Option<AudioFrame>, AudioError>;

    async fn stop_capture(&self, handle: StreamHandle) -> Result<(), AudioError>;

    async fn start_playback(&self) -> Result<StreamHandle, AudioError>;

    async fn write(&self, handle: StreamHandle, frame: AudioFrame) -> Result<(), AudioError>;

    /// Stops rendering immediately and discards anything still queued.
    async fn stop_playback(&self, handle: StreamHandle) -> Result<(), AudioError>;

    /// Waits until everything written so far has been rendered.
    async fn drain_playback(&self, _handle: StreamHandle) -> Result<(), AudioError> {
        Ok(())
    }

    /// Releases the device. No stream is used afterwards.
    async fn release(&self) -> Result<(), AudioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: AudioFormat = AudioFormat::pcm16_mono(16000);

    #[test]
    fn test_concat_keeps_order() {
        let frames = vec![
            AudioFrame::new(vec![1, 2], FORMAT),
            AudioFrame::new(vec![], FORMAT),
            AudioFrame::new(vec![3, 4, 5, 6], FORMAT),
        ];
        let joined = AudioFrame::concat(&frames).unwrap();
        assert_eq!(joined.data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(joined.format, FORMAT);
    }

    #[test]
    fn test_concat_of_nothing_is_none() {
        assert!(AudioFrame::concat(&[]).is_none());
        assert!(AudioFrame::concat(&[AudioFrame::new(vec![], FORMAT)]).is_none());
    }

    #[test]
    fn test_duration() {
        // one second of 16 kHz mono pcm16
        let frame = AudioFrame::new(vec![0; 32000], FORMAT);
        assert_eq!(frame.duration(), Duration::from_secs(1));
    }
}
