//! Decoder contract (§6) and a synthetic test double.
//!
//! Concrete codec decoders (WAV/MP3/FLAC) are explicitly out of scope
//! (§1) — consumed only through this trait. `SineDecoder` is a deterministic
//! tone generator used by this crate's own tests and the `main.rs` demo; it
//! is not a production decoder.

/// Stream metadata a decoder reports once, at open time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Total duration, if known. `None` for unbounded/live sources.
    pub duration_secs: Option<f64>,
}

/// Outcome of one `read_frames` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFramesOutcome {
    pub frames_read: usize,
    pub eof: bool,
    pub ok: bool,
}

/// Abstract decoder the worker pulls from (§6).
///
/// The core assumes the decoder outputs interleaved float samples at a
/// caller-selected sample rate — resampling, if the underlying file's rate
/// differs from what the engine requests, is the decoder's job, not the
/// core's (spec.md §9's sample-rate-mismatch open question).
pub trait Decoder: Send {
    fn stream_info(&self) -> StreamInfo;

    /// Decodes into `dest`, an interleaved float scratch buffer sized to a
    /// whole number of frames (`dest.len() % channels == 0`). Never blocks
    /// longer than the time to produce at least one frame or detect EOF.
    fn read_frames(&mut self, dest: &mut [f32]) -> ReadFramesOutcome;

    /// Seeks to an absolute position in the stream. Decoders that cannot
    /// seek return `Err` and the caller reports `EngineError::NonSeekableSource`
    /// or a seek-failure event depending on the call site (§7).
    fn try_seek(&mut self, seconds: f64) -> Result<(), String>;
}

/// Deterministic sine-tone decoder used for tests and the demo binary.
///
/// Not a production decoder: it synthesizes a tone rather than reading a
/// file, but it honors `try_seek` and reports EOF at `duration_secs` the way
/// a real bounded-length decoder would, which is all the core needs from a
/// `Decoder` to be exercised end to end.
pub struct SineDecoder {
    info: StreamInfo,
    frequency_hz: f64,
    position_frames: u64,
    total_frames: Option<u64>,
}

impl SineDecoder {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        frequency_hz: f64,
        duration_secs: Option<f64>,
    ) -> Self {
        let total_frames = duration_secs.map(|d| (d * sample_rate as f64).round() as u64);
        Self {
            info: StreamInfo {
                sample_rate,
                channels,
                duration_secs,
            },
            frequency_hz,
            position_frames: 0,
            total_frames,
        }
    }
}

impl Decoder for SineDecoder {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn read_frames(&mut self, dest: &mut [f32]) -> ReadFramesOutcome {
        let channels = self.info.channels as usize;
        debug_assert_eq!(dest.len() % channels, 0);
        let requested_frames = dest.len() / channels;

        let remaining = self
            .total_frames
            .map(|total| total.saturating_sub(self.position_frames) as usize)
            .unwrap_or(requested_frames);
        let frames_to_write = requested_frames.min(remaining);

        for frame in 0..frames_to_write {
            let t = (self.position_frames + frame as u64) as f64 / self.info.sample_rate as f64;
            let sample =
                (2.0 * std::f64::consts::PI * self.frequency_hz * t).sin() as f32 * 0.25;
            for ch in 0..channels {
                dest[frame * channels + ch] = sample;
            }
        }
        for sample in dest[frames_to_write * channels..].iter_mut() {
            *sample = 0.0;
        }

        self.position_frames += frames_to_write as u64;
        let eof = self
            .total_frames
            .is_some_and(|total| self.position_frames >= total);

        ReadFramesOutcome {
            frames_read: frames_to_write,
            eof,
            ok: true,
        }
    }

    fn try_seek(&mut self, seconds: f64) -> Result<(), String> {
        if seconds < 0.0 {
            return Err("cannot seek before start of stream".to_string());
        }
        self.position_frames = (seconds * self.info.sample_rate as f64).round() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_eof_at_duration() {
        let mut decoder = SineDecoder::new(48_000, 1, 440.0, Some(0.01));
        let mut buf = [0.0_f32; 480 * 2];
        let first = decoder.read_frames(&mut buf[..480]);
        assert!(!first.eof);
        let second = decoder.read_frames(&mut buf[480..]);
        assert!(second.eof);
        assert_eq!(first.frames_read + second.frames_read, 480);
    }

    #[test]
    fn seek_moves_position() {
        let mut decoder = SineDecoder::new(48_000, 1, 440.0, Some(1.0));
        decoder.try_seek(0.5).unwrap();
        assert_eq!(decoder.position_frames, 24_000);
    }

    #[test]
    fn rejects_negative_seek() {
        let mut decoder = SineDecoder::new(48_000, 1, 440.0, None);
        assert!(decoder.try_seek(-1.0).is_err());
    }

    #[test]
    fn unbounded_decoder_never_reports_eof() {
        let mut decoder = SineDecoder::new(48_000, 1, 440.0, None);
        let mut buf = [0.0_f32; 512];
        for _ in 0..100 {
            let outcome = decoder.read_frames(&mut buf);
            assert!(!outcome.eof);
            assert_eq!(outcome.frames_read, 512);
        }
    }
}
