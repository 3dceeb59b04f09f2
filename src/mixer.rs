//! Mixer Loop (§4.7): drives the master clock and every attached reader,
//! sums their frames into one output block, and pushes it to the sink.
//!
//! Grounded on `vidwall`'s `AudioMixer` (`src/audio/mixer.rs`): an
//! `RwLock<Vec<...>>` of per-track consumers, a chunked stack/pre-allocated
//! scratch buffer, `try_read` so a contended registry lock degrades to
//! silence for one block rather than blocking the audio thread, and master
//! volume/mute applied after summation. Generalized here to read a shared
//! [`crate::clock::MasterClock`] per iteration (the teacher advances its
//! clock per-stream; spec.md §3 calls for exactly one master timeline) and
//! to route per-reader channel maps (§6) instead of assuming every stream
//! already matches the output channel count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::clock::{ClockMode, MasterClock};
use crate::config::{MixerConfig, ReaderConfig};
use crate::decoder::Decoder;
use crate::engine::AudioEngine;
use crate::error::EngineError;
use crate::events::{EventSink, MixerEvent, ReaderEvent, TracingEventSink};
use crate::reader::{AtomicF32, Reader};

/// Largest channel count a reader may have. Bounds the mixer's scratch
/// buffer so it can be pre-allocated once rather than grown per reader.
pub const MAX_READER_CHANNELS: usize = 8;

/// Per-track consumer registry, master volume/mute, and the `UnsafeCell`-free
/// (but still mixer-thread-only) scratch buffers `run_iteration` sums into.
///
/// `mix_buffer`/`scratch_buffer` are plain `Vec<f32>` wrapped in a
/// `parking_lot::Mutex` purely to satisfy `Sync` for an `Arc<Mixer>` shared
/// across the mixer thread and control threads; only the mixer thread ever
/// calls `run_iteration`, so the lock is always uncontended there (the same
/// non-blocking assumption `vidwall`'s `AudioMixer::fill_buffer` makes about
/// its own `RwLock`).
pub struct Mixer {
    clock: Arc<MasterClock>,
    config: MixerConfig,
    readers: RwLock<Vec<Arc<Reader>>>,
    next_reader_id: AtomicU64,
    master_volume: AtomicF32,
    master_muted: AtomicBool,
    event_sink: Arc<dyn EventSink>,
    scratch: parking_lot::Mutex<MixScratch>,
}

struct MixScratch {
    mix_buffer: Vec<f32>,
    reader_buffer: Vec<f32>,
}

impl Mixer {
    pub fn new(config: MixerConfig, mode: ClockMode) -> Result<Arc<Self>, EngineError> {
        Self::with_event_sink(config, mode, Arc::new(TracingEventSink))
    }

    pub fn with_event_sink(
        config: MixerConfig,
        mode: ClockMode,
        event_sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        let mix_len = config.block_frames * config.channels as usize;
        let reader_len = config.block_frames * MAX_READER_CHANNELS;
        Ok(Arc::new(Self {
            clock: Arc::new(MasterClock::new(config.sample_rate, config.channels, mode)),
            readers: RwLock::new(Vec::new()),
            next_reader_id: AtomicU64::new(1),
            master_volume: AtomicF32::new(1.0),
            master_muted: AtomicBool::new(false),
            event_sink,
            scratch: parking_lot::Mutex::new(MixScratch {
                mix_buffer: vec![0.0; mix_len],
                reader_buffer: vec![0.0; reader_len],
            }),
            config,
        }))
    }

    pub fn clock(&self) -> Arc<MasterClock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.load(Ordering::Relaxed)
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume
            .store(volume.clamp(0.0, 1.0), Ordering::Relaxed);
    }

    pub fn mute(&self) {
        self.master_muted.store(true, Ordering::Relaxed);
    }

    pub fn unmute(&self) {
        self.master_muted.store(false, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.master_muted.load(Ordering::Relaxed)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    pub fn reader(&self, id: u64) -> Option<Arc<Reader>> {
        self.readers.read().iter().find(|r| r.id() == id).cloned()
    }

    /// Creates a reader for `decoder`, starts its decoder worker, and
    /// registers it with this mixer. The caller still chooses when to
    /// `attach_to_clock`/`play`.
    ///
    /// `channel_routing` must be `Some` whenever `decoder`'s channel count
    /// differs from the mixer's own (§6: "if absent and C_in != C_out, the
    /// reader is rejected") — pass `None` only when they match. This is
    /// required up front rather than left to a follow-up
    /// `Reader::set_channel_routing` call so a mismatched reader can never be
    /// registered and mixed (which would otherwise silently truncate in
    /// `mix_one_reader`'s no-routing branch) even for one block.
    pub fn add_reader(
        self: &Arc<Self>,
        name: impl Into<String>,
        decoder: Box<dyn Decoder>,
        reader_config: ReaderConfig,
        start_offset_seconds: f64,
        channel_routing: Option<Vec<usize>>,
    ) -> Result<Arc<Reader>, EngineError> {
        let info = decoder.stream_info();
        if info.channels as usize > MAX_READER_CHANNELS {
            return Err(EngineError::InvalidReaderConfig(
                "reader channel count exceeds the mixer's maximum",
            ));
        }
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let handle = Reader::new(id, name, info, reader_config.clone(), start_offset_seconds)?;
        handle
            .reader
            .set_channel_routing(channel_routing, self.config.channels)?;
        let join = crate::worker::spawn(
            Arc::clone(&handle.reader),
            decoder,
            Arc::clone(&handle.shared),
            handle.producer,
            reader_config,
        );
        handle.reader.record_worker_handle(join);
        self.readers.write().push(Arc::clone(&handle.reader));
        Ok(handle.reader)
    }

    /// Disposes and unregisters a reader.
    pub fn remove_reader(&self, id: u64) {
        let removed = {
            let mut readers = self.readers.write();
            readers
                .iter()
                .position(|r| r.id() == id)
                .map(|pos| readers.remove(pos))
        };
        if let Some(reader) = removed {
            reader.dispose();
        }
    }

    /// One mix iteration (§4.7): read the clock, zero the mix buffer, pull
    /// from every reader (clock-synchronized or legacy), sum into the mix
    /// buffer, apply master volume/mute, push to the sink, advance the
    /// clock. Never allocates in steady state.
    pub fn run_iteration(&self, engine: &dyn AudioEngine) {
        let t = self.clock.current_timestamp();
        let block_frames = self.config.block_frames;
        let channels = self.config.channels as usize;

        let mut scratch = self.scratch.lock();
        let MixScratch {
            mix_buffer,
            reader_buffer,
        } = &mut *scratch;
        mix_buffer.iter_mut().for_each(|s| *s = 0.0);

        if let Some(readers) = self.readers.try_read() {
            for reader in readers.iter() {
                self.mix_one_reader(reader, t, block_frames, channels, mix_buffer, reader_buffer);
            }
        }
        // If the registry lock was contended, this block is silence —
        // matching `vidwall`'s `AudioMixer::fill_buffer` fallback; the clock
        // still advances so readers never fall permanently behind it.

        let muted = self.master_muted.load(Ordering::Relaxed);
        let volume = self.master_volume.load(Ordering::Relaxed);
        if muted {
            mix_buffer.iter_mut().for_each(|s| *s = 0.0);
        } else if volume != 1.0 {
            mix_buffer
                .iter_mut()
                .for_each(|s| *s = (*s * volume).clamp(-1.0, 1.0));
        } else {
            mix_buffer.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
        }

        engine.send(mix_buffer);
        self.clock.advance(block_frames as u64);
    }

    fn mix_one_reader(
        &self,
        reader: &Arc<Reader>,
        t: f64,
        block_frames: usize,
        mix_channels: usize,
        mix_buffer: &mut [f32],
        reader_buffer: &mut [f32],
    ) {
        let reader_channels = reader.stream_info().channels as usize;
        let scratch = &mut reader_buffer[..block_frames * reader_channels];
        scratch.iter_mut().for_each(|s| *s = 0.0);

        let (ok, frames_read, reason) = if reader.is_attached() {
            let result = reader.read_at_time(t, scratch, block_frames);
            (result.ok, result.frames_read, result.reason)
        } else {
            (true, reader.read_samples(scratch), None)
        };

        if !ok {
            self.event_sink.on_mixer_event(MixerEvent::TrackDropout {
                track_id: reader.id(),
                track_name: reader.name().to_string(),
                master_timestamp: t,
                master_sample_position: self.clock.current_sample_position(),
                missed_frames: block_frames.saturating_sub(frames_read),
                reason: reason.map(|r| r.as_str().to_string()).unwrap_or_default(),
            });
        }

        for event in reader.drain_events() {
            if reader.is_attached() && matches!(event, ReaderEvent::Error { .. }) {
                self.event_sink.on_mixer_event(MixerEvent::TrackDropout {
                    track_id: reader.id(),
                    track_name: reader.name().to_string(),
                    master_timestamp: t,
                    master_sample_position: self.clock.current_sample_position(),
                    missed_frames: 0,
                    reason: "source error".to_string(),
                });
            }
            self.event_sink.on_mixer_event(MixerEvent::Reader {
                track_id: reader.id(),
                event,
            });
        }

        reader.with_channel_routing(|routing| match routing {
            Some(map) => {
                for frame in 0..block_frames {
                    for (src_ch, &dst_ch) in map.iter().enumerate() {
                        if dst_ch < mix_channels {
                            mix_buffer[frame * mix_channels + dst_ch] +=
                                scratch[frame * reader_channels + src_ch];
                        }
                    }
                }
            }
            None => {
                for (m, s) in mix_buffer.iter_mut().zip(scratch.iter()) {
                    *m += *s;
                }
            }
        });
    }
}

/// A weak handle other (out-of-core) subsystems may hold to coordinate with
/// a mixer without the mixer depending on them (§5: "any cross-subsystem
/// coordination uses dependency injection, not process-wide state" — this
/// is that injection point, deliberately `Weak` so it cannot keep a mixer
/// alive past its owner).
pub type MixerHandle = Weak<Mixer>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SineDecoder;
    use crate::engine::RecordingEngine;

    fn make_mixer() -> Arc<Mixer> {
        Mixer::new(
            MixerConfig {
                sample_rate: 48_000,
                channels: 2,
                block_frames: 256,
                master_volume: 1.0,
            },
            ClockMode::Offline,
        )
        .unwrap()
    }

    #[test]
    fn offline_mixer_advances_clock_each_iteration() {
        let mixer = make_mixer();
        let engine = RecordingEngine::new();
        for _ in 0..4 {
            mixer.run_iteration(&engine);
        }
        assert_eq!(engine.block_count(), 4);
        assert_eq!(mixer.clock().current_sample_position(), 256 * 4);
    }

    #[test]
    fn unattached_reader_mixes_via_legacy_read_samples() {
        let mixer = make_mixer();
        let decoder = Box::new(SineDecoder::new(48_000, 2, 440.0, Some(1.0)));
        let reader = mixer
            .add_reader("tone", decoder, ReaderConfig::default(), 0.0, None)
            .unwrap();
        reader.play();
        // Give the worker a moment to decode into the ring buffer.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let engine = RecordingEngine::new();
        mixer.run_iteration(&engine);
        let blocks = engine.blocks();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].iter().any(|&s| s != 0.0));
        reader.dispose();
    }

    #[test]
    fn master_mute_zeroes_output_regardless_of_readers() {
        let mixer = make_mixer();
        mixer.mute();
        let engine = RecordingEngine::new();
        mixer.run_iteration(&engine);
        assert!(engine.blocks()[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn channel_routing_maps_mono_reader_into_stereo_mix() {
        let mixer = make_mixer();
        let decoder = Box::new(SineDecoder::new(48_000, 1, 440.0, Some(1.0)));
        let reader = mixer
            .add_reader(
                "mono",
                decoder,
                ReaderConfig::default(),
                0.0,
                Some(vec![0]),
            )
            .unwrap();
        reader.play();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let engine = RecordingEngine::new();
        mixer.run_iteration(&engine);
        let block = &engine.blocks()[0];
        // Left channel (index 0 of every frame) should carry signal; right
        // (index 1) should stay silent since only output channel 0 is routed.
        let left_has_signal = block.iter().step_by(2).any(|&s| s != 0.0);
        let right_all_zero = block.iter().skip(1).step_by(2).all(|&s| s == 0.0);
        assert!(left_has_signal);
        assert!(right_all_zero);
        reader.dispose();
    }

    #[test]
    fn add_reader_rejects_mismatched_channels_without_routing() {
        let mixer = make_mixer();
        let decoder = Box::new(SineDecoder::new(48_000, 1, 440.0, Some(1.0)));
        let err = mixer
            .add_reader("mono", decoder, ReaderConfig::default(), 0.0, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChannelRoutingRequired {
                reader_channels: 1,
                mixer_channels: 2
            }
        ));
        assert_eq!(mixer.reader_count(), 0);
    }

    /// Run with `--test-threads=1` for a reliable signal — the allocation
    /// counter is process-global and shared by every concurrently running
    /// test.
    #[test]
    fn steady_state_run_iteration_allocates_nothing() {
        let mixer = make_mixer();
        let decoder = Box::new(SineDecoder::new(48_000, 2, 440.0, None));
        let reader = mixer
            .add_reader("tone", decoder, ReaderConfig::default(), 0.0, None)
            .unwrap();
        reader.attach_to_clock(&mixer.clock());
        reader.play();
        std::thread::sleep(std::time::Duration::from_millis(100));

        // `NullEngine`, not `RecordingEngine` — the latter's `to_vec()` would
        // allocate on every `send` and swamp the measurement below with the
        // test double's own cost rather than the mixer's.
        let engine = crate::engine::NullEngine;
        // Warm up once so any one-time lazy init happens before measuring.
        mixer.run_iteration(&engine);

        let before = crate::test_alloc::count();
        for _ in 0..50 {
            mixer.run_iteration(&engine);
        }
        assert_eq!(crate::test_alloc::count(), before);

        reader.dispose();
    }
}
