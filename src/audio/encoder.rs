use tracing::debug;

/// Streaming f32 → PCM16 rate converter.
///
/// Accepts capture blocks at the device's native rate and emits frames at the
/// fixed target rate (16 kHz for the transcription backend). Leftover input
/// samples are carried across blocks so no sample is lost or reordered at
/// block boundaries.
///
/// Conversion is nearest-neighbor: for each output index `i` the source
/// sample at `floor(i * ratio)` is taken, where `ratio = native / target`.
pub struct PcmEncoder {
    native_rate: u32,
    target_rate: u32,
    /// FIFO carry-over buffer of not-yet-consumed input samples.
    buffer: Vec<f32>,
}

impl PcmEncoder {
    pub fn new(native_rate: u32, target_rate: u32) -> Self {
        debug!(native_rate, target_rate, "PCM encoder created");
        Self {
            native_rate: native_rate.max(1),
            target_rate: target_rate.max(1),
            buffer: Vec::new(),
        }
    }

    /// Ingest one capture block and emit a PCM16 frame if enough input has
    /// accumulated for at least one output sample.
    ///
    /// Must stay cheap: this runs on the capture processing thread and has to
    /// finish before the next block arrives.
    pub fn ingest(&mut self, block: &[f32]) -> Option<Vec<i16>> {
        self.buffer.extend_from_slice(block);

        let ratio = self.native_rate as f64 / self.target_rate as f64;
        let out_len = (self.buffer.len() as f64 / ratio).floor() as usize;
        if out_len == 0 {
            return None;
        }

        let mut pcm = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let src = ((i as f64) * ratio).floor() as usize;
            pcm.push(quantize(self.buffer[src.min(self.buffer.len() - 1)]));
        }

        // Drop exactly the consumed prefix; the remainder carries over.
        let consumed = ((out_len as f64) * ratio).floor() as usize;
        self.buffer.drain(..consumed.min(self.buffer.len()));

        Some(pcm)
    }

    /// Number of input samples currently held over for the next block.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

/// Scale a normalized sample into the i16 range, clamping out-of-range input.
fn quantize(sample: f32) -> i16 {
    let scaled = sample.clamp(-1.0, 1.0) * 32768.0;
    scaled.clamp(-32768.0, 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_clamps_out_of_range_input() {
        assert_eq!(quantize(2.0), 32767);
        assert_eq!(quantize(-2.0), -32768);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn exact_ratio_consumes_whole_blocks() {
        // 48 kHz → 16 kHz is a clean 3:1 decimation.
        let mut enc = PcmEncoder::new(48000, 16000);
        let frame = enc.ingest(&[0.5; 48]).expect("should emit");
        assert_eq!(frame.len(), 16);
        assert_eq!(enc.pending(), 0);
    }

    #[test]
    fn short_block_is_held_over() {
        let mut enc = PcmEncoder::new(48000, 16000);
        assert!(enc.ingest(&[0.1, 0.1]).is_none());
        assert_eq!(enc.pending(), 2);
        // One more sample completes a single output sample.
        let frame = enc.ingest(&[0.1]).expect("should emit");
        assert_eq!(frame.len(), 1);
        assert_eq!(enc.pending(), 0);
    }
}
