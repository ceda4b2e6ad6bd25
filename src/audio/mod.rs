pub mod capture;
pub mod encoder;

pub use capture::{CaptureBackend, CaptureConfig, CpalBackend};
pub use encoder::PcmEncoder;

/// One transport-ready audio frame (16-bit PCM, mono, fixed target rate).
///
/// Frames are produced by the capture processing thread and handed over a
/// channel to the transcription socket client; the buffer is owned by
/// whoever holds the frame, there is no shared audio memory.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples at `sample_rate`.
    pub samples: Vec<i16>,
    /// Sample rate in Hz (the encoder's target rate).
    pub sample_rate: u32,
    /// Milliseconds since capture started.
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Little-endian byte view for the wire (binary WebSocket payload).
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_bytes_are_little_endian() {
        let frame = AudioFrame {
            samples: vec![1, -2],
            sample_rate: 16000,
            timestamp_ms: 0,
        };
        assert_eq!(frame.to_pcm_bytes(), vec![0x01, 0x00, 0xfe, 0xff]);
    }
}
