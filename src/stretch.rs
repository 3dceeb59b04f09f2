//! Time-stretch/pitch stage (§4.2).
//!
//! Neither `vidwall` nor `vidplayer` has a time-stretch library — this is an
//! enrichment pulled from `examples/other_examples`' `emuell-phonic`
//! manifest, which depends on `signalsmith-stretch` for the same purpose
//! (the real ecosystem equivalent of the legacy "SoundTouch" processor named
//! in spec.md §1). All three buffers (input/output/accumulation) are
//! pre-allocated at construction from the worst-case expansion of one chunk
//! at the lowest permitted tempo (0.8×) and never grow afterward.

use signalsmith_stretch::Stretch;

/// Tempo/pitch clamps, public contract per spec.md §6.
pub const TEMPO_MIN: f64 = 0.8;
pub const TEMPO_MAX: f64 = 1.2;
pub const PITCH_MIN_SEMITONES: f64 = -12.0;
pub const PITCH_MAX_SEMITONES: f64 = 12.0;

/// Streaming tempo/pitch processor with pre-allocated scratch buffers.
///
/// `put` feeds one decode chunk in; `receive` drains processed output;
/// `flush` drains residual state on a bypass transition or end-of-stream.
/// Exceeding a pre-allocated buffer is a programmer error (§4.2 overflow
/// semantics) reported by the caller as a source-error event, not handled
/// here by growing the buffer.
pub struct StretchStage {
    stretch: Stretch<f32>,
    channels: usize,
    tempo_change_percent: f64,
    pitch_semitones: f64,
    /// Scratch input buffer, reused across `put` calls. Sized for the
    /// largest chunk the worker will ever hand in.
    input_scratch: Vec<f32>,
    /// Scratch output buffer, reused across `receive` calls. Sized for the
    /// worst-case expansion (slowest permitted tempo) of one chunk.
    output_scratch: Vec<f32>,
    /// Accumulation buffer the worker drains into the ring buffer; retains
    /// samples that didn't fit in a previous write, shifted down.
    accumulation: Vec<f32>,
}

impl StretchStage {
    /// `max_chunk_frames` is the largest frame count ever passed to `put` in
    /// one call; buffers are sized from it so no further allocation is ever
    /// needed. `sample_rate` must match the reader's own stream sample rate —
    /// the stretch engine's internal windowing is tuned from it.
    pub fn new(channels: usize, max_chunk_frames: usize, sample_rate: u32) -> Self {
        // Worst-case expansion: tempo 0.8 means ~1.25x more output frames
        // than input for the same wall-clock duration; double it for
        // headroom against pitch-shift-induced latency.
        let expansion_frames = (max_chunk_frames as f64 / TEMPO_MIN).ceil() as usize * 2;
        Self {
            stretch: Stretch::new(channels as u32, sample_rate),
            channels,
            tempo_change_percent: 0.0,
            pitch_semitones: 0.0,
            input_scratch: vec![0.0; max_chunk_frames * channels],
            output_scratch: vec![0.0; expansion_frames * channels],
            accumulation: Vec::with_capacity(expansion_frames * channels),
        }
    }

    pub fn is_processing_needed(&self) -> bool {
        self.tempo_change_percent != 0.0 || self.pitch_semitones != 0.0
    }

    pub fn set_tempo_percent(&mut self, percent: f64) {
        self.tempo_change_percent = percent;
        self.stretch.set_tempo_percent(percent);
    }

    pub fn set_pitch_semitones(&mut self, semitones: f64) {
        self.pitch_semitones = semitones;
        self.stretch.set_pitch_semitones(semitones);
    }

    /// Feeds one decode chunk (interleaved, `frame_count * channels` samples)
    /// into the stage. Returns `false` (and processes nothing) if `samples`
    /// exceeds the pre-allocated input scratch buffer — the caller must
    /// treat this as a source-error and drop the chunk, never reallocate.
    pub fn put(&mut self, samples: &[f32], frame_count: usize) -> bool {
        if samples.len() > self.input_scratch.len() || samples.len() != frame_count * self.channels
        {
            return false;
        }
        self.input_scratch[..samples.len()].copy_from_slice(samples);
        self.stretch
            .process(&self.input_scratch[..samples.len()], frame_count as u32);
        true
    }

    /// Drains processed output into `self.accumulation` until the stage has
    /// nothing more to give for this call. Returns the number of frames
    /// moved into the accumulation buffer, or `None` if the accumulation
    /// buffer would overflow its pre-allocated capacity.
    pub fn receive_into_accumulation(&mut self) -> Option<usize> {
        let mut total_frames = 0;
        loop {
            let received = self.stretch.receive(&mut self.output_scratch);
            if received == 0 {
                break;
            }
            let sample_count = received * self.channels;
            if self.accumulation.len() + sample_count > self.accumulation.capacity() {
                return None;
            }
            self.accumulation
                .extend_from_slice(&self.output_scratch[..sample_count]);
            total_frames += received;
        }
        Some(total_frames)
    }

    /// Drains all residual samples (on a transition to bypassed, or at
    /// end-of-stream) into the accumulation buffer.
    pub fn flush(&mut self) -> Option<usize> {
        self.stretch.flush();
        self.receive_into_accumulation()
    }

    /// Clears the stage's internal state (on a transition to active) and
    /// resets the accumulation count. Does not deallocate.
    pub fn clear(&mut self) {
        self.stretch.reset();
        self.accumulation.clear();
    }

    /// The accumulation buffer the worker drains into the ring buffer.
    pub fn accumulation(&self) -> &[f32] {
        &self.accumulation
    }

    /// Removes the first `sample_count` samples from the accumulation
    /// buffer, shifting the remainder down, after the worker has written
    /// them to the ring buffer.
    pub fn consume_accumulation(&mut self, sample_count: usize) {
        self.accumulation.drain(..sample_count.min(self.accumulation.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypassed_by_default() {
        let stage = StretchStage::new(2, 1024, 48_000);
        assert!(!stage.is_processing_needed());
    }

    #[test]
    fn tempo_change_marks_processing_needed() {
        let mut stage = StretchStage::new(2, 1024, 48_000);
        stage.set_tempo_percent(-10.0);
        assert!(stage.is_processing_needed());
    }

    #[test]
    fn put_rejects_oversized_chunk() {
        let mut stage = StretchStage::new(2, 16, 48_000);
        let oversized = vec![0.0_f32; 1024];
        assert!(!stage.put(&oversized, 512));
    }

    #[test]
    fn clear_resets_accumulation() {
        let mut stage = StretchStage::new(2, 1024, 48_000);
        stage.set_tempo_percent(-10.0);
        stage.put(&vec![0.1_f32; 2048], 1024);
        stage.receive_into_accumulation();
        stage.clear();
        assert!(stage.accumulation().is_empty());
    }
}
