// Presence payload
// Builds the listening activity shown by the presence service

use super::NowPlaying;
use crate::config::PresenceConfig;
use serde::Serialize;

/// Longest string the presence service accepts in any text field
pub const MAX_TEXT_LEN: usize = 128;

/// A recomputed start time closer than this to the current anchor is sampling
/// noise and keeps the anchor
pub const ANCHOR_TOLERANCE_MS: i64 = 2000;

const ACTIVITY_LISTENING: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: u8,
    pub details: String,
    pub state: String,
    pub assets: Assets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    pub instance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assets {
    pub large_image: String,
    pub large_text: String,
    pub small_image: String,
    pub small_text: String,
}

/// Epoch milliseconds bounding the displayed progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamps {
    pub start: i64,
    pub end: i64,
}

/// Keeps the displayed start time steady across noisy samples
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimestampAnchor {
    anchor: Option<i64>,
}

impl TimestampAnchor {
    /// Returns the start time to display for a freshly computed candidate
    pub fn stabilize(&mut self, candidate_ms: i64) -> i64 {
        match self.anchor {
            Some(previous) if candidate_ms.abs_diff(previous) < ANCHOR_TOLERANCE_MS.unsigned_abs() => {
                previous
            }
            _ => {
                self.anchor = Some(candidate_ms);
                candidate_ms
            }
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<i64> {
        self.anchor
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

/// Whole milliseconds in `seconds`, if that fits an epoch-millisecond value
fn to_millis(seconds: f64) -> Option<i64> {
    let millis = (seconds * 1000.0).round();
    (millis.is_finite() && millis.abs() < i64::MAX as f64).then(|| millis as i64)
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_TEXT_LEN).collect()
}

/// Start/end of the displayed progress bar; `None` when the reported
/// position or duration cannot be expressed in epoch milliseconds
fn progress_window(
    observed_ms: i64,
    current_time: f64,
    duration: f64,
    anchor: &mut TimestampAnchor,
) -> Option<Timestamps> {
    let elapsed_ms = to_millis(current_time)?;
    let duration_ms = to_millis(duration)?;
    let candidate = observed_ms.checked_sub(elapsed_ms)?;
    // Only adopt an anchor whose window end is representable
    candidate.checked_add(duration_ms)?;

    let start = anchor.stabilize(candidate);
    Some(Timestamps {
        start,
        end: start.checked_add(duration_ms)?,
    })
}

/// Turns now-playing snapshots into presence payloads
#[derive(Debug, Clone)]
pub struct ActivityBuilder {
    app_name: String,
    fallback_icon: String,
}

impl ActivityBuilder {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            fallback_icon: config.fallback_icon.clone(),
        }
    }

    pub fn build(&self, now_playing: &NowPlaying, anchor: &mut TimestampAnchor) -> Activity {
        let track = &now_playing.track;
        let progress = &now_playing.progress;
        let service = track.source.display_name().unwrap_or(self.app_name.as_str());

        let timestamps = match track.known_duration() {
            Some(duration) if !progress.paused => {
                progress_window(
                    progress.observed_at.timestamp_millis(),
                    progress.current_time,
                    duration,
                    anchor,
                )
            }
            _ => None,
        };

        Activity {
            kind: ACTIVITY_LISTENING,
            details: truncate(&track.title),
            state: truncate(&track.artist),
            assets: Assets {
                large_image: track
                    .artwork
                    .clone()
                    .unwrap_or_else(|| self.fallback_icon.clone()),
                large_text: truncate(track.album.as_deref().unwrap_or(service)),
                small_image: self.fallback_icon.clone(),
                small_text: if progress.paused {
                    "Paused".to_string()
                } else {
                    truncate(service)
                },
            },
            timestamps,
            instance: false,
        }
    }
}
