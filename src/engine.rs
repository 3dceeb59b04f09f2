//! Audio engine (sink) contract (§6), test doubles, and a real `cpal`-backed
//! sink.
//!
//! The platform audio-output sink is explicitly out of scope (§1) — the
//! core only ever calls through [`AudioEngine`]. [`CpalEngine`] is the same
//! kind of adapter `vidplayer/src/audio/output.rs`'s `AudioOutput` is (opens
//! a `cpal` output stream on the default device), but bridges this crate's
//! push model (the mixer calls `send` once per block) to `cpal`'s pull model
//! (the output callback asks for data on its own thread) via the same SPSC
//! ring buffer the decoder worker uses against a reader.

use std::sync::Mutex;

use thiserror::Error;

/// Abstract sink the mixer pushes mixed blocks to (§6).
///
/// `send` blocks for approximately one block's worth of wall-clock time in
/// Real-time mode and returns immediately in Offline mode — the mode
/// distinction lives in the implementation, not the trait.
pub trait AudioEngine: Send + Sync {
    /// Pushes one interleaved block to the sink.
    fn send(&self, frames: &[f32]);
}

/// Records every block it receives. Used by integration tests to assert on
/// mixed output without a real device.
pub struct RecordingEngine {
    blocks: Mutex<Vec<Vec<f32>>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn blocks(&self) -> Vec<Vec<f32>> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for RecordingEngine {
    fn send(&self, frames: &[f32]) {
        self.blocks.lock().unwrap().push(frames.to_vec());
    }
}

/// Discards every block. Used by the offline demo path in `main.rs` where
/// no real output device is wanted.
pub struct NullEngine;

impl AudioEngine for NullEngine {
    fn send(&self, _frames: &[f32]) {}
}

/// Errors opening a real output device.
#[derive(Debug, Error)]
pub enum CpalEngineError {
    #[error("no default audio output device")]
    NoDevice,
    #[error("cpal stream error: {0}")]
    Stream(String),
}

/// Opens the platform's default output device via `cpal` and bridges
/// [`AudioEngine::send`] (called from the mixer thread, blocking
/// approximately one block's worth of wall-clock time per §6) into `cpal`'s
/// callback (called from a `cpal`-owned thread, pulling whatever is
/// available). The bridge is the same `ring_buffer` SPSC discipline the core
/// already uses between a decoder worker and its reader — `send` is the
/// single producer, the `cpal` callback is the single consumer.
pub struct CpalEngine {
    producer: crate::ring_buffer::RingProducer,
    _stream: cpal::Stream,
}

impl CpalEngine {
    /// `ring_capacity_samples` should comfortably exceed one mix block
    /// (interleaved samples, not frames) so `send` rarely has to wait on the
    /// callback draining it.
    pub fn open(
        sample_rate: u32,
        channels: u16,
        ring_capacity_samples: usize,
    ) -> Result<Self, CpalEngineError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(CpalEngineError::NoDevice)?;

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = crate::ring_buffer::ring_buffer(ring_capacity_samples);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let read = consumer.read(data);
                    for sample in data[read..].iter_mut() {
                        *sample = 0.0;
                    }
                },
                |err| tracing::error!(%err, "cpal output stream error"),
                None,
            )
            .map_err(|e| CpalEngineError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CpalEngineError::Stream(e.to_string()))?;

        Ok(Self {
            producer,
            _stream: stream,
        })
    }
}

impl AudioEngine for CpalEngine {
    fn send(&self, frames: &[f32]) {
        let mut written = 0;
        while written < frames.len() {
            written += self.producer.write(&frames[written..]);
            if written < frames.len() {
                std::thread::sleep(std::time::Duration::from_micros(500));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_engine_captures_blocks_in_order() {
        let engine = RecordingEngine::new();
        engine.send(&[1.0, 2.0]);
        engine.send(&[3.0, 4.0]);
        assert_eq!(engine.blocks(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn null_engine_accepts_anything() {
        let engine = NullEngine;
        engine.send(&[0.0; 1024]);
    }
}
