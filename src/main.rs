//! Manual smoke-test demo: wires a handful of [`SineDecoder`] tracks through
//! a [`Mixer`] into a logging sink and runs it for a few seconds in
//! real-time mode. Not a production player — concrete decoders and the
//! platform output sink are out of this crate's core (spec.md §1); this
//! binary exists only so the engine can be exercised end to end without a
//! host application.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use syncplay_engine::{AudioEngine, ClockMode, Decoder, MixerConfig, ReaderConfig, SineDecoder};

/// Logs the RMS level of each block it receives instead of writing to a
/// real output device. Mirrors the role `vidplayer/src/audio/output.rs`'s
/// `AudioOutput` plays for the teacher app, but behind the `AudioEngine`
/// trait so this core never names a concrete audio backend.
struct LoggingEngine {
    blocks_sent: AtomicU64,
}

impl LoggingEngine {
    fn new() -> Self {
        Self {
            blocks_sent: AtomicU64::new(0),
        }
    }
}

impl AudioEngine for LoggingEngine {
    fn send(&self, frames: &[f32]) {
        let count = self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        if count % 100 == 0 {
            let sum_sq: f32 = frames.iter().map(|s| s * s).sum();
            let rms = (sum_sq / frames.len() as f32).sqrt();
            tracing::info!(block = count, rms, "mixed block");
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mixer_config = MixerConfig::default();
    let mixer = syncplay_engine::Mixer::new(mixer_config.clone(), ClockMode::RealTime)
        .expect("default mixer config is valid");

    // Three tracks: one starting immediately, one with a leading silence
    // (positive start offset), one starting mid-file (negative start offset).
    let tracks: [(&str, f64, f64, f64); 3] = [
        ("lead", 0.0, 220.0, 1.0),
        ("harmony", 2.0, 330.0, 1.0),
        ("bass", -1.0, 110.0, 0.97),
    ];

    let clock = mixer.clock();
    let mut readers = Vec::new();
    for (name, start_offset, frequency_hz, tempo) in tracks {
        let decoder: Box<dyn Decoder> = Box::new(SineDecoder::new(
            mixer_config.sample_rate,
            mixer_config.channels,
            frequency_hz,
            Some(30.0),
        ));
        let reader = mixer
            .add_reader(name, decoder, ReaderConfig::default(), start_offset, None)
            .expect("reader construction should not fail for a valid sine decoder");
        reader.tempo_hard(tempo);
        reader.attach_to_clock(&clock);
        reader.play();
        readers.push(reader);
    }

    let engine = LoggingEngine::new();
    let block_duration = Duration::from_secs_f64(
        mixer_config.block_frames as f64 / mixer_config.sample_rate as f64,
    );
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        mixer.run_iteration(&engine);
        std::thread::sleep(block_duration);
    }

    for reader in readers {
        reader.dispose();
    }
}
