// Change detector
// Classifies each accepted sample as a new track, a repeat, or no change

use crate::track::{PlaybackProgress, Track, TrackKey};
use std::sync::Arc;

/// A backward jump within the same track larger than this (seconds) is
/// reported as a repeat. A manual rewind of the same size looks identical and
/// is reported the same way.
pub const REPEAT_REWIND_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoChange,
    NewTrack,
    Repeat,
    Seek,
}

impl Verdict {
    /// Whether this verdict starts a fresh play of the track
    pub fn starts_play(&self) -> bool {
        matches!(self, Self::NewTrack | Self::Repeat)
    }
}

/// Classification of one sample. The track is shared read-only with every
/// downstream consumer.
#[derive(Debug, Clone)]
pub struct ChangeVerdict {
    pub kind: Verdict,
    pub track: Arc<Track>,
    pub progress: PlaybackProgress,
}

#[derive(Debug, Clone, PartialEq)]
enum DetectorState {
    Idle,
    Tracking { key: TrackKey, last_time: f64 },
}

/// Mealy machine over the sample stream: one verdict per sample, in arrival
/// order, never re-emitted.
#[derive(Debug)]
pub struct ChangeDetector {
    state: DetectorState,
    rewind_threshold: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(REPEAT_REWIND_THRESHOLD)
    }
}

impl ChangeDetector {
    pub fn new(rewind_threshold: f64) -> Self {
        Self {
            state: DetectorState::Idle,
            rewind_threshold,
        }
    }

    pub fn observe(&mut self, track: Track, progress: PlaybackProgress) -> ChangeVerdict {
        let key = track.key();
        let now = progress.current_time;

        let kind = match &mut self.state {
            DetectorState::Tracking {
                key: last_key,
                last_time,
            } if *last_key == key => {
                let rewind = *last_time - now;
                *last_time = now;
                if rewind > self.rewind_threshold {
                    Verdict::Repeat
                } else {
                    Verdict::NoChange
                }
            }
            _ => {
                self.state = DetectorState::Tracking { key, last_time: now };
                Verdict::NewTrack
            }
        };

        if kind.starts_play() {
            log::debug!("Detector: {:?} for {} at {:.1}s", kind, track, now);
        }

        ChangeVerdict {
            kind,
            track: Arc::new(track),
            progress,
        }
    }
}
