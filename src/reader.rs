//! Synchronized Reader — the three-zone drift controller (§4.4) plus tempo/
//! pitch setters (§4.5) and the reader state machine.
//!
//! The per-reader volume/mute fields are grounded directly on
//! `AudioStreamConsumer` in the top-level `src/audio/stream.rs` and
//! `vidplayer/src/audio/stream.rs` (not `vidwall`, which has no
//! `audio/stream.rs` of its own): an `AtomicF32` volume next to an
//! `AtomicBool` mute flag, applied to the
//! output without disturbing the stored volume value. The drift controller
//! itself has no teacher equivalent (the teacher never synchronizes
//! multiple tracks to a shared clock) and is built from spec.md §4.4 in the
//! same atomics-first, lock-free-on-the-hot-path style as that teacher code.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::clock::MasterClock;
use crate::config::ReaderConfig;
use crate::decoder::StreamInfo;
use crate::error::EngineError;
use crate::events::ReaderEvent;
use crate::ring_buffer::{ring_buffer, RingConsumer, RingProducer};
use crate::stretch::{PITCH_MAX_SEMITONES, PITCH_MIN_SEMITONES, TEMPO_MAX, TEMPO_MIN};

/// Atomic `f32` wrapper, bit-cast over `AtomicU32`.
///
/// Grounded on the identically-named helper in `vidwall`'s/`vidplayer`'s
/// `audio/stream.rs`.
pub(crate) struct AtomicF32 {
    inner: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            inner: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn load(&self, ordering: Ordering) -> f32 {
        f32::from_bits(self.inner.load(ordering))
    }

    pub fn store(&self, value: f32, ordering: Ordering) {
        self.inner.store(value.to_bits(), ordering);
    }
}

/// Atomic `f64` wrapper, bit-cast over `AtomicU64`. Used for the handful of
/// drift-state fields (`track_local_time`, `grace_period_end`) that a
/// control thread may write (on seek/attach/tempo_hard) while the mixer
/// thread reads and writes them lock-free on every block.
struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self {
            inner: AtomicU64::new(value.to_bits()),
        }
    }

    fn load(&self, ordering: Ordering) -> f64 {
        f64::from_bits(self.inner.load(ordering))
    }

    fn store(&self, value: f64, ordering: Ordering) {
        self.inner.store(value.to_bits(), ordering);
    }
}

/// Reader lifecycle state (§3, §4.4 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Idle = 0,
    Playing = 1,
    Paused = 2,
    Stopped = 3,
    EndOfStream = 4,
}

impl ReaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Playing,
            2 => Self::Paused,
            3 => Self::Stopped,
            4 => Self::EndOfStream,
            _ => Self::Idle,
        }
    }
}

/// Why `read_at_time` reported `ok: false` for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureReason {
    Underrun,
    SeekFailed,
    SourceError,
}

impl ReadFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Underrun => "underrun",
            Self::SeekFailed => "seek failed",
            Self::SourceError => "source error",
        }
    }
}

/// Result of one `read_at_time` call (§4.4 entry point, §9's redesign note:
/// the audio path returns a result-like value rather than raising).
#[derive(Debug, Clone, Copy)]
pub struct ReadResult {
    pub ok: bool,
    pub frames_read: usize,
    pub reason: Option<ReadFailureReason>,
}

impl ReadResult {
    fn ok(frames_read: usize) -> Self {
        Self {
            ok: true,
            frames_read,
            reason: None,
        }
    }

    fn failure(frames_read: usize, reason: ReadFailureReason) -> Self {
        Self {
            ok: false,
            frames_read,
            reason: Some(reason),
        }
    }
}

/// A pending tempo/pitch change the worker must apply inside its own
/// critical section, plus a flag requesting the worker clear the stretch
/// stage (the "hard" setters' effect) rather than just update the value.
pub(crate) struct StretchRequest {
    pub clear_requested: bool,
}

/// Seek-request slot. `None` means no seek pending.
pub(crate) type SeekRequest = Option<f64>;

/// State shared between a `Reader` (read from the mixer thread, written from
/// control threads) and its `Worker` (read/written from the decoder-worker
/// thread). Grounded on the atomic-flags-plus-short-mutex shape of
/// `vidplayer/src/playback/audio_pipeline.rs`'s `AudioPipeline`
/// (`stop_flag: Arc<AtomicBool>` etc.), generalized with the seek-request
/// slot and pending-tempo cell spec.md §9 calls for.
pub(crate) struct SharedReaderState {
    pub playing: AtomicBool,
    pub paused: AtomicBool,
    pub stop: AtomicBool,
    pub loop_enabled: AtomicBool,
    pub end_of_stream: AtomicBool,

    /// Set by the worker when a deferred drift-correction seek
    /// (`seek_mutex`-posted by the Red-zone predictive-seek path) fails;
    /// cleared by the next `read_at_time` call, which surfaces it as
    /// `failure(0, SeekFailed)` (§7). The seek itself is asynchronous, so
    /// this is how its result gets back to the mixer thread.
    pub seek_failed: AtomicBool,
    /// Set by the worker when `Decoder::read_frames` reports failure;
    /// cleared by the next `read_at_time` call, which surfaces it as
    /// `failure(0, SourceError)` (§7) before the reader settles into
    /// end-of-stream silence.
    pub source_error: AtomicBool,

    /// Lock-free cross-thread cell: mixer writes, worker polls and applies
    /// within its own critical section. NaN = "restore configured tempo".
    pub pending_soft_sync_tempo: AtomicF32,

    /// Reader's currently configured tempo ratio (1.0 = unmodified), set by
    /// `tempo_hard`/`tempo_smooth`, read by both the drift controller and
    /// the worker (to compute the "restore" value).
    pub configured_tempo: AtomicF32,
    pub configured_pitch: AtomicF32,

    /// Guards the seek-request slot and stretch-stage clears, per §5.
    pub seek_mutex: Mutex<SeekRequest>,
    /// Guards tempo/pitch "hard" clear requests, per §5.
    pub stretch_mutex: Mutex<StretchRequest>,

    /// Woken by the worker when the ring buffer needs a refill signal from
    /// the reader side (fill dropped below half capacity), and by the
    /// worker's own pause/stop transitions.
    pub wake: parking_lot::Condvar,
    pub wake_mutex: Mutex<()>,
}

impl SharedReaderState {
    fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            loop_enabled: AtomicBool::new(false),
            end_of_stream: AtomicBool::new(false),
            seek_failed: AtomicBool::new(false),
            source_error: AtomicBool::new(false),
            pending_soft_sync_tempo: AtomicF32::new(f32::NAN),
            configured_tempo: AtomicF32::new(1.0),
            configured_pitch: AtomicF32::new(0.0),
            seek_mutex: Mutex::new(None),
            stretch_mutex: Mutex::new(StretchRequest {
                clear_requested: false,
            }),
            wake: parking_lot::Condvar::new(),
            wake_mutex: Mutex::new(()),
        }
    }

    pub fn notify_worker(&self) {
        let _guard = self.wake_mutex.lock();
        self.wake.notify_all();
    }
}

/// Drift-controller bookkeeping touched only by the mixer thread inside
/// `read_at_time`. Wrapped in `UnsafeCell` and marked `Send + Sync` because
/// the mixer is the single caller, the same pattern `vidwall`'s
/// `AudioStreamConsumer` uses for its ring-buffer consumer half.
struct ReaderHot {
    fractional_frame_accumulator: f64,
    /// Integer source-position counter the fractional accumulator advances
    /// (§4.4 step 4: "Advance the source-position counter using the
    /// fractional accumulator"). Tracks the reader's position in source
    /// frames at the tempo-scaled rate, separately from `track_local_time`
    /// (which is a physical-time quantity).
    source_position_frames: u64,
    consecutive_underruns: u32,
    soft_sync_active: bool,
    seek_count: u32,
    seek_window_start: f64,
}

struct HotCell(UnsafeCell<ReaderHot>);

// SAFETY: only `Reader::read_at_time`, called exclusively from the mixer
// thread (§5: "read_at_time is only called from the mixer thread"), touches
// this cell.
unsafe impl Send for HotCell {}
unsafe impl Sync for HotCell {}

/// Per-track consumer: pulls from the ring buffer, corrects drift against a
/// master timestamp, and produces mixer-aligned frames (§3, §4.4).
pub struct Reader {
    id: u64,
    name: String,
    stream_info: StreamInfo,
    config: ReaderConfig,

    consumer: RingConsumer,
    shared: Arc<SharedReaderState>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,

    volume: AtomicF32,
    muted: AtomicBool,
    state: AtomicU8,

    attached: AtomicBool,
    start_offset_seconds: AtomicF64,
    track_local_time: AtomicF64,
    grace_period_end: AtomicF64,
    /// The reader's own seconds-based position, advanced by
    /// `frames_read * tempo / sample_rate` on every normal read (§4.4 step
    /// 4's last clause) — distinct from `track_local_time`, which tracks the
    /// physical (master-clock-relative) timeline rather than the tempo-scaled
    /// source position.
    position_seconds: AtomicF64,

    channel_routing: Mutex<Option<Vec<usize>>>,
    hot: HotCell,

    events: Mutex<Vec<ReaderEvent>>,
}

/// Construction output: the `Reader` (mixer/control-thread side) and the
/// pieces a caller hands to `crate::worker::spawn`.
pub struct ReaderHandle {
    pub reader: Arc<Reader>,
    pub(crate) producer: RingProducer,
    pub(crate) shared: Arc<SharedReaderState>,
}

impl Reader {
    /// Builds a reader and its ring buffer, but does not start a decoder
    /// worker — call `crate::worker::spawn` with the returned
    /// `ReaderHandle` to begin background decoding.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        stream_info: StreamInfo,
        config: ReaderConfig,
        start_offset_seconds: f64,
    ) -> Result<ReaderHandle, EngineError> {
        config.validate()?;
        let (producer, consumer) = ring_buffer(config.ring_buffer_capacity_samples);
        let shared = Arc::new(SharedReaderState::new());

        let reader = Arc::new(Reader {
            id,
            name: name.into(),
            stream_info,
            config,
            consumer,
            shared: Arc::clone(&shared),
            worker_handle: Mutex::new(None),
            volume: AtomicF32::new(1.0),
            muted: AtomicBool::new(false),
            state: AtomicU8::new(ReaderState::Idle as u8),
            attached: AtomicBool::new(false),
            start_offset_seconds: AtomicF64::new(start_offset_seconds),
            track_local_time: AtomicF64::new(0.0),
            grace_period_end: AtomicF64::new(0.0),
            position_seconds: AtomicF64::new(0.0),
            channel_routing: Mutex::new(None),
            hot: HotCell(UnsafeCell::new(ReaderHot {
                fractional_frame_accumulator: 0.0,
                source_position_frames: 0,
                consecutive_underruns: 0,
                soft_sync_active: false,
                seek_count: 0,
                seek_window_start: 0.0,
            })),
            events: Mutex::new(Vec::new()),
        });

        Ok(ReaderHandle {
            reader,
            producer,
            shared,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.stream_info
    }

    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new: ReaderState) {
        let old = ReaderState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        if old != new {
            self.push_event(ReaderEvent::StateChanged { old, new });
        }
    }

    pub(crate) fn push_event(&self, event: ReaderEvent) {
        self.events.lock().push(event);
    }

    /// Drains and returns every event queued since the last call. Intended
    /// for the mixer to call once per iteration, per reader.
    pub fn drain_events(&self) -> Vec<ReaderEvent> {
        std::mem::take(&mut self.events.lock())
    }

    pub(crate) fn record_worker_handle(&self, handle: JoinHandle<()>) {
        *self.worker_handle.lock() = Some(handle);
    }

    // ---- control-path: transport ----------------------------------------

    pub fn play(&self) {
        self.shared.playing.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.set_state(ReaderState::Playing);
        self.shared.notify_worker();
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.set_state(ReaderState::Paused);
        self.shared.notify_worker();
    }

    pub fn stop(&self) {
        self.shared.playing.store(false, Ordering::Release);
        self.set_state(ReaderState::Stopped);
        self.shared.notify_worker();
    }

    pub fn set_loop(&self, loop_enabled: bool) {
        self.shared.loop_enabled.store(loop_enabled, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.loop_enabled.load(Ordering::Acquire)
    }

    /// Requests the decoder worker seek to `seconds`. Non-blocking on the
    /// audio path: only the seek-request slot is updated under its mutex
    /// (§5).
    pub fn seek(&self, seconds: f64) {
        *self.shared.seek_mutex.lock() = Some(seconds);
        self.track_local_time.store(seconds, Ordering::Release);
        self.grace_period_end
            .store(seconds + self.config.grace_period_secs, Ordering::Release);
        self.shared.notify_worker();
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_channel_routing(
        &self,
        routing: Option<Vec<usize>>,
        mixer_channels: u16,
    ) -> Result<(), EngineError> {
        if let Some(map) = &routing {
            if map.len() != self.stream_info.channels as usize {
                return Err(EngineError::ChannelRoutingLengthMismatch {
                    expected: self.stream_info.channels as usize,
                    got: map.len(),
                });
            }
            for (index, &value) in map.iter().enumerate() {
                if value >= mixer_channels as usize {
                    return Err(EngineError::ChannelRoutingOutOfRange { index, value });
                }
            }
        } else if self.stream_info.channels != mixer_channels {
            return Err(EngineError::ChannelRoutingRequired {
                reader_channels: self.stream_info.channels,
                mixer_channels,
            });
        }
        *self.channel_routing.lock() = routing;
        Ok(())
    }

    pub fn channel_routing(&self) -> Option<Vec<usize>> {
        self.channel_routing.lock().clone()
    }

    /// Non-allocating accessor for the mixer's hot path: no `Vec` clone, just
    /// a borrow handed to `f` for the duration of the (uncontended, cold-write)
    /// lock.
    pub(crate) fn with_channel_routing<R>(&self, f: impl FnOnce(Option<&[usize]>) -> R) -> R {
        let guard = self.channel_routing.lock();
        f(guard.as_deref())
    }

    // ---- control-path: clock attach --------------------------------------

    /// Computes the initial track position from `clock.timestamp - start_offset`,
    /// seeking the decoder when the result is positive (§3 lifecycle).
    pub fn attach_to_clock(&self, clock: &MasterClock) {
        let rel = clock.current_timestamp() - self.start_offset_seconds.load(Ordering::Acquire);
        self.attached.store(true, Ordering::Release);
        if rel > 0.0 {
            *self.shared.seek_mutex.lock() = Some(rel);
        }
        self.track_local_time.store(rel.max(0.0), Ordering::Release);
        self.grace_period_end
            .store(rel + self.config.grace_period_secs, Ordering::Release);
        self.shared.notify_worker();
    }

    pub fn detach_from_clock(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn start_offset_seconds(&self) -> f64 {
        self.start_offset_seconds.load(Ordering::Acquire)
    }

    pub fn track_local_time(&self) -> f64 {
        self.track_local_time.load(Ordering::Acquire)
    }

    /// The reader's own seconds-based position (§4.4 step 4's last clause),
    /// advanced by `frames_read * tempo / sample_rate` on every normal read —
    /// distinct from `track_local_time`'s physical-timeline tracking.
    pub fn position_seconds(&self) -> f64 {
        self.position_seconds.load(Ordering::Acquire)
    }

    /// Stops the worker (join with a 2s timeout per §5) and releases the
    /// decoder. After `dispose`, the reader must not be read from again.
    pub fn dispose(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.notify_worker();
        if let Some(handle) = self.worker_handle.lock().take() {
            // `JoinHandle` has no built-in timeout; a best-effort join is
            // used here since the worker's own loop checks `stop` at every
            // wait point (§5) and returns promptly.
            let _ = handle.join();
        }
    }

    // ---- control-path: tempo / pitch (§4.5) ------------------------------

    pub fn get_tempo(&self) -> f64 {
        self.shared.configured_tempo.load(Ordering::Acquire) as f64
    }

    pub fn tempo_hard(&self, v: f64) -> f64 {
        let clamped = v.clamp(TEMPO_MIN, TEMPO_MAX);
        self.shared
            .configured_tempo
            .store(clamped as f32, Ordering::Release);
        {
            let mut req = self.shared.stretch_mutex.lock();
            req.clear_requested = true;
        }
        let local_time = self.track_local_time.load(Ordering::Acquire);
        self.grace_period_end
            .store(local_time + self.config.grace_period_secs, Ordering::Release);
        clamped
    }

    pub fn tempo_smooth(&self, v: f64) -> f64 {
        let clamped = v.clamp(TEMPO_MIN, TEMPO_MAX);
        self.shared
            .configured_tempo
            .store(clamped as f32, Ordering::Release);
        clamped
    }

    pub fn get_pitch(&self) -> f64 {
        self.shared.configured_pitch.load(Ordering::Acquire) as f64
    }

    pub fn pitch_hard(&self, s: f64) -> f64 {
        let clamped = s.clamp(PITCH_MIN_SEMITONES, PITCH_MAX_SEMITONES);
        self.shared
            .configured_pitch
            .store(clamped as f32, Ordering::Release);
        {
            let mut req = self.shared.stretch_mutex.lock();
            req.clear_requested = true;
        }
        let local_time = self.track_local_time.load(Ordering::Acquire);
        self.grace_period_end
            .store(local_time + self.config.grace_period_secs, Ordering::Release);
        clamped
    }

    pub fn pitch_smooth(&self, s: f64) -> f64 {
        let clamped = s.clamp(PITCH_MIN_SEMITONES, PITCH_MAX_SEMITONES);
        self.shared
            .configured_pitch
            .store(clamped as f32, Ordering::Release);
        clamped
    }

    // ---- audio path: the hard core (§4.4) --------------------------------

    /// Entry point called by the mixer with the master timestamp and a
    /// frame count. `out` must hold `frame_count * stream_info.channels`
    /// samples.
    pub fn read_at_time(&self, master_timestamp: f64, out: &mut [f32], frame_count: usize) -> ReadResult {
        let channels = self.stream_info.channels as usize;
        debug_assert_eq!(out.len(), frame_count * channels);

        let start_offset = self.start_offset_seconds.load(Ordering::Acquire);
        let rel = master_timestamp - start_offset;

        // 1. Pre-track region.
        if rel < 0.0 {
            out.iter_mut().for_each(|s| *s = 0.0);
            return ReadResult::ok(frame_count);
        }

        // 1.5. Surface an asynchronously-reported worker failure from the
        // previous block: a deferred drift-correction seek that failed, or a
        // decode error. Both are posted by the worker (which has no direct
        // way to return a value to `read_at_time`) and consumed here exactly
        // once (§7: "seek failures during drift correction: return
        // failure(0, \"seek failed\")").
        if self.shared.seek_failed.swap(false, Ordering::AcqRel) {
            out.iter_mut().for_each(|s| *s = 0.0);
            self.apply_volume(out);
            return ReadResult::failure(0, ReadFailureReason::SeekFailed);
        }
        if self.shared.source_error.swap(false, Ordering::AcqRel) {
            out.iter_mut().for_each(|s| *s = 0.0);
            self.apply_volume(out);
            return ReadResult::failure(0, ReadFailureReason::SourceError);
        }

        // 2. Grace period.
        let grace_period_end = self.grace_period_end.load(Ordering::Acquire);
        if rel < grace_period_end {
            self.track_local_time.store(rel, Ordering::Release);
        }

        // SAFETY: only the mixer thread calls read_at_time (§5).
        let hot = unsafe { &mut *self.hot.0.get() };

        let track_local_time = self.track_local_time.load(Ordering::Acquire);
        let drift = (rel - track_local_time).abs();

        let sync_tolerance = self.config.sync_tolerance_secs;
        let soft_sync_tolerance = self.config.soft_sync_tolerance_secs;

        let behind_due_to_recovery = hot.consecutive_underruns > 0;

        if drift <= sync_tolerance {
            // Green zone.
            if hot.soft_sync_active {
                self.shared
                    .pending_soft_sync_tempo
                    .store(f32::NAN, Ordering::Release);
                hot.soft_sync_active = false;
            }
            if hot.consecutive_underruns > 0 {
                hot.consecutive_underruns = 0;
            }
        } else if drift <= soft_sync_tolerance {
            // Yellow zone. Recovery no longer forces a skip straight to Red
            // here — it instead raises the correction rate below so the
            // controller converges faster while it's biased aggressive
            // (§4.4's post-underrun-recovery rate tier).
            let span = soft_sync_tolerance - sync_tolerance;
            let normalized = ((drift - sync_tolerance) / span).clamp(0.0, 1.0);
            let adjustment = normalized * self.config.max_soft_sync_adjustment;
            let behind = rel > track_local_time;
            let sign = if behind { 1.0 } else { -1.0 };
            let tempo = self.shared.configured_tempo.load(Ordering::Acquire) as f64;
            let pending = (tempo - 1.0) * 100.0 + sign * adjustment * 100.0;
            self.shared
                .pending_soft_sync_tempo
                .store(pending as f32, Ordering::Release);
            hot.soft_sync_active = true;

            let rate = if drift > 0.100 {
                0.10
            } else if drift > 0.050 {
                0.05
            } else if behind_due_to_recovery {
                0.05
            } else {
                0.01
            };
            let correction = (rel - track_local_time) * rate;
            let new_local_time = track_local_time + correction;
            self.track_local_time.store(new_local_time, Ordering::Release);
        } else {
            // Red zone (drift > soft_sync_tolerance).
            if hot.soft_sync_active {
                self.shared
                    .pending_soft_sync_tempo
                    .store(f32::NAN, Ordering::Release);
                hot.soft_sync_active = false;
            }

            let sample_rate = self.stream_info.sample_rate as f64;
            let behind_frames = ((rel - track_local_time) * sample_rate).round();
            let available = self.consumer.available();

            if behind_frames > 0.0
                && (behind_frames as usize) * channels <= available
            {
                // Buffer-skip resync (preferred).
                self.consumer.skip(behind_frames as usize * channels);
                self.track_local_time.store(rel, Ordering::Release);
            } else {
                // Predictive seek (fallback) / hard reset.
                if rel - hot.seek_window_start > self.config.seek_cascade_window_secs {
                    hot.seek_window_start = rel;
                    hot.seek_count = 0;
                }
                hot.seek_count += 1;

                if hot.seek_count > self.config.seek_cascade_limit {
                    self.hard_reset(rel);
                } else {
                    let latency_compensation = if behind_due_to_recovery {
                        self.config.latency_compensation_recovery_secs
                    } else {
                        self.config.latency_compensation_secs
                    };
                    let tempo = self.shared.configured_tempo.load(Ordering::Acquire) as f64;
                    let seek_target = (rel + latency_compensation) * tempo;
                    *self.shared.seek_mutex.lock() = Some(seek_target);
                    self.shared.notify_worker();

                    self.grace_period_end
                        .store(rel + self.config.grace_period_secs, Ordering::Release);
                    self.track_local_time
                        .store(rel + latency_compensation, Ordering::Release);
                }
                out.iter_mut().for_each(|s| *s = 0.0);
                return ReadResult::ok(frame_count);
            }
        }

        // 4. Normal read.
        let frames_read = self.consumer.read(out) / channels;
        if self.consumer.available() < self.consumer.capacity() / 2 {
            self.shared.notify_worker();
        }

        let sample_rate = self.stream_info.sample_rate as f64;
        let current_local_time = self.track_local_time.load(Ordering::Acquire);
        self.track_local_time
            .store(current_local_time + frames_read as f64 / sample_rate, Ordering::Release);

        let tempo = self.shared.configured_tempo.load(Ordering::Acquire) as f64;
        hot.fractional_frame_accumulator += frames_read as f64 * tempo;
        let advance_int = hot.fractional_frame_accumulator.floor();
        hot.fractional_frame_accumulator -= advance_int;
        hot.source_position_frames += advance_int as u64;

        let current_position_seconds = self.position_seconds.load(Ordering::Acquire);
        self.position_seconds.store(
            current_position_seconds + frames_read as f64 * tempo / sample_rate,
            Ordering::Release,
        );

        let end_of_stream = self.shared.end_of_stream.load(Ordering::Acquire);

        // 5. Underrun handling.
        if frames_read < frame_count && !end_of_stream {
            for sample in out[frames_read * channels..].iter_mut() {
                *sample = 0.0;
            }
            hot.consecutive_underruns = 5;
            self.push_event(ReaderEvent::BufferUnderrun {
                missed_frames: frame_count - frames_read,
                position_secs: current_local_time,
            });
            self.apply_volume(out);
            return ReadResult::failure(frame_count, ReadFailureReason::Underrun);
        }

        // 6. End-of-stream + loop.
        if end_of_stream && self.consumer.is_empty() {
            if self.shared.loop_enabled.load(Ordering::Acquire) {
                *self.shared.seek_mutex.lock() = Some(0.0);
                self.shared.end_of_stream.store(false, Ordering::Release);
                self.track_local_time.store(0.0, Ordering::Release);
                self.shared.notify_worker();
            } else {
                self.set_state(ReaderState::EndOfStream);
            }
        }

        // 7. Apply per-reader volume.
        self.apply_volume(out);
        ReadResult::ok(frame_count)
    }

    fn hard_reset(&self, rel: f64) {
        *self.shared.seek_mutex.lock() = Some(rel);
        self.shared.notify_worker();
        self.consumer.clear();
        let hot = unsafe { &mut *self.hot.0.get() };
        hot.consecutive_underruns = 0;
        hot.seek_count = 0;
        hot.seek_window_start = rel;
        hot.soft_sync_active = false;
        self.shared
            .pending_soft_sync_tempo
            .store(f32::NAN, Ordering::Release);
        self.grace_period_end
            .store(rel + self.config.grace_period_secs, Ordering::Release);
        self.track_local_time.store(rel, Ordering::Release);
    }

    fn apply_volume(&self, out: &mut [f32]) {
        if self.muted.load(Ordering::Relaxed) {
            out.iter_mut().for_each(|s| *s = 0.0);
            return;
        }
        let volume = self.volume.load(Ordering::Relaxed);
        if volume != 1.0 {
            out.iter_mut().for_each(|s| *s *= volume);
        }
    }

    /// Legacy, clock-independent read path (§4.7 step 3 `else` branch): for
    /// sources not attached to the master clock, simply drain whatever is
    /// available from the ring buffer.
    pub fn read_samples(&self, out: &mut [f32]) -> usize {
        let channels = self.stream_info.channels as usize;
        let read = self.consumer.read(out);
        for sample in out[read..].iter_mut() {
            *sample = 0.0;
        }
        self.apply_volume(out);
        read / channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::decoder::StreamInfo;

    fn make_reader() -> ReaderHandle {
        let info = StreamInfo {
            sample_rate: 48_000,
            channels: 2,
            duration_secs: Some(5.0),
        };
        Reader::new(1, "test", info, ReaderConfig::default(), 0.0).unwrap()
    }

    #[test]
    fn tempo_clamp_property() {
        let handle = make_reader();
        assert_eq!(handle.reader.tempo_hard(5.0), TEMPO_MAX);
        assert_eq!(handle.reader.get_tempo(), TEMPO_MAX);
        assert_eq!(handle.reader.tempo_hard(-5.0), TEMPO_MIN);
        assert_eq!(handle.reader.get_tempo(), TEMPO_MIN);
    }

    #[test]
    fn pitch_clamp_property() {
        let handle = make_reader();
        assert_eq!(handle.reader.pitch_hard(99.0), PITCH_MAX_SEMITONES);
        assert_eq!(handle.reader.pitch_hard(-99.0), PITCH_MIN_SEMITONES);
    }

    #[test]
    fn positive_start_offset_yields_silence_before_offset() {
        let info = StreamInfo {
            sample_rate: 48_000,
            channels: 2,
            duration_secs: Some(5.0),
        };
        let handle = Reader::new(1, "test", info, ReaderConfig::default(), 2.0).unwrap();
        let mut out = [1.0_f32; 512 * 2];
        let result = handle.reader.read_at_time(0.5, &mut out, 512);
        assert!(result.ok);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn muted_reader_outputs_silence_without_losing_volume() {
        let handle = make_reader();
        handle.reader.set_volume(0.7);
        handle.reader.set_muted(true);
        let mut out = [1.0_f32; 8];
        handle.reader.apply_volume(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(handle.reader.volume(), 0.7);
    }

    #[test]
    fn channel_routing_required_on_mismatch() {
        let info = StreamInfo {
            sample_rate: 48_000,
            channels: 1,
            duration_secs: None,
        };
        let handle = Reader::new(1, "mono", info, ReaderConfig::default(), 0.0).unwrap();
        assert!(handle.reader.set_channel_routing(None, 2).is_err());
        assert!(handle.reader.set_channel_routing(Some(vec![0]), 2).is_ok());
        assert!(handle
            .reader
            .set_channel_routing(Some(vec![5]), 2)
            .is_err());
    }

    #[test]
    fn reports_seek_failed_once_then_resumes_normally() {
        let handle = make_reader();
        handle.shared.seek_failed.store(true, Ordering::Release);
        let mut out = [1.0_f32; 512 * 2];
        let result = handle.reader.read_at_time(0.0, &mut out, 512);
        assert!(!result.ok);
        assert_eq!(result.reason, Some(ReadFailureReason::SeekFailed));
        assert!(out.iter().all(|&s| s == 0.0));

        // The flag is consumed, so the next call sees it cleared.
        assert!(!handle.shared.seek_failed.load(Ordering::Acquire));
    }

    #[test]
    fn reports_source_error_once_then_resumes_normally() {
        let handle = make_reader();
        handle.shared.source_error.store(true, Ordering::Release);
        let mut out = [1.0_f32; 512 * 2];
        let result = handle.reader.read_at_time(0.0, &mut out, 512);
        assert!(!result.ok);
        assert_eq!(result.reason, Some(ReadFailureReason::SourceError));
        assert!(!handle.shared.source_error.load(Ordering::Acquire));
    }

    /// Run with `--test-threads=1` for a reliable signal — the allocation
    /// counter is process-global and shared by every concurrently running
    /// test.
    #[test]
    fn pre_track_silence_path_allocates_nothing() {
        let info = StreamInfo {
            sample_rate: 48_000,
            channels: 2,
            duration_secs: Some(5.0),
        };
        let handle = Reader::new(1, "test", info, ReaderConfig::default(), 2.0).unwrap();
        let mut out = [0.0_f32; 512 * 2];

        let before = crate::test_alloc::count();
        for i in 0..100 {
            handle.reader.read_at_time(i as f64 * 0.001, &mut out, 512);
        }
        assert_eq!(crate::test_alloc::count(), before);
    }
}
