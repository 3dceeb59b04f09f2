//! Reader and mixer event types (§6, §2 row 7).
//!
//! The audio path reports anomalies here instead of returning errors, so the
//! mix loop can stay total. Logging (§10) happens alongside emission, not
//! instead of it — callers that need the typed payload register a sink.

use crate::reader::ReaderState;

/// Events a [`crate::reader::Reader`] emits about itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    StateChanged {
        old: ReaderState,
        new: ReaderState,
    },
    BufferUnderrun {
        missed_frames: usize,
        position_secs: f64,
    },
    Error {
        message: String,
        cause: Option<String>,
    },
}

/// Events the [`crate::mixer::Mixer`] emits, including reader events it
/// forwards on their behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    TrackDropout {
        track_id: u64,
        track_name: String,
        master_timestamp: f64,
        master_sample_position: u64,
        missed_frames: usize,
        reason: String,
    },
    Reader {
        track_id: u64,
        event: ReaderEvent,
    },
}

/// Receives events emitted by readers and the mixer.
///
/// A plain callback trait rather than a channel: the mixer thread must not
/// allocate or block in steady state, so the sink is expected to be cheap
/// (e.g. push onto a pre-sized queue, or forward to `tracing`) or to run on
/// its own thread if it needs to do more.
pub trait EventSink: Send + Sync {
    fn on_mixer_event(&self, event: MixerEvent);
}

/// An [`EventSink`] that only logs via `tracing`, used when no programmatic
/// consumer is registered.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_mixer_event(&self, event: MixerEvent) {
        match &event {
            MixerEvent::TrackDropout {
                track_id,
                track_name,
                missed_frames,
                reason,
                ..
            } => {
                tracing::error!(
                    track_id,
                    track_name,
                    missed_frames,
                    reason,
                    "track dropout"
                );
            }
            MixerEvent::Reader { track_id, event } => log_reader_event(*track_id, event),
        }
    }
}

fn log_reader_event(track_id: u64, event: &ReaderEvent) {
    match event {
        ReaderEvent::StateChanged { old, new } => {
            tracing::info!(track_id, ?old, ?new, "reader state changed");
        }
        ReaderEvent::BufferUnderrun {
            missed_frames,
            position_secs,
        } => {
            tracing::warn!(track_id, missed_frames, position_secs, "buffer underrun");
        }
        ReaderEvent::Error { message, cause } => {
            tracing::error!(track_id, message, ?cause, "reader error");
        }
    }
}
