//! Construction/configuration error types (§7, §11).
//!
//! Only the control path returns these. The audio path never fails loudly —
//! see [`crate::reader::ReadResult`] and [`crate::events`] for how anomalies
//! are reported from `read_at_time`, the mixer iteration, and the worker.

use thiserror::Error;

/// Errors surfaced from constructors and setters.
///
/// Not recoverable in the sense that the caller must fix the argument and
/// retry; none of these are raised from the steady-state audio path.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("channel routing map has {got} entries, expected {expected}")]
    ChannelRoutingLengthMismatch { expected: usize, got: usize },

    #[error("channel routing entry {index} maps to out-of-range output channel {value}")]
    ChannelRoutingOutOfRange { index: usize, value: usize },

    #[error("channel routing is required: reader has {reader_channels} channels, mixer has {mixer_channels}")]
    ChannelRoutingRequired {
        reader_channels: u16,
        mixer_channels: u16,
    },

    #[error("source does not support seeking, but seek was required")]
    NonSeekableSource,

    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("invalid reader configuration: {0}")]
    InvalidReaderConfig(&'static str),

    #[error("invalid mixer configuration: {0}")]
    InvalidMixerConfig(&'static str),

    #[error("decoder open failed: {0}")]
    DecoderOpenFailed(String),
}
