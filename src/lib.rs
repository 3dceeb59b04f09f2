//! Multi-track, sample-accurate audio playback and synchronization engine.
//!
//! The core mixes any number of independently decoded tracks into one output
//! stream, keeping each in phase with a shared master clock despite decode
//! jitter, per-track tempo/pitch changes, and background-thread scheduling
//! noise. Concrete codecs and the platform audio sink are consumed through
//! the [`decoder::Decoder`] and [`engine::AudioEngine`] traits rather than
//! implemented here.

pub mod clock;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod mixer;
pub mod reader;
pub mod ring_buffer;
pub mod stretch;
mod worker;

#[cfg(test)]
pub mod test_alloc;

#[cfg(test)]
#[global_allocator]
static TEST_ALLOCATOR: test_alloc::CountingAlloc = test_alloc::CountingAlloc;

pub use clock::{ClockMode, MasterClock};
pub use config::{MixerConfig, ReaderConfig};
pub use decoder::{Decoder, SineDecoder, StreamInfo};
pub use engine::{AudioEngine, CpalEngine, CpalEngineError, NullEngine, RecordingEngine};
pub use error::EngineError;
pub use events::{EventSink, MixerEvent, ReaderEvent, TracingEventSink};
pub use mixer::{Mixer, MixerHandle};
pub use reader::{ReadFailureReason, ReadResult, Reader, ReaderState};
