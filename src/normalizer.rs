// Sample normalizer
// Validates raw scraper samples into a canonical track and playback progress

use crate::config::CleanupConfig;
use crate::track::{PlaybackProgress, Source, Track};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// One raw observation from the upstream scraper.
///
/// The payload is whatever JSON the page script produced; nothing about it is
/// trusted until it has been through [`Normalizer::normalize`].
#[derive(Debug, Clone)]
pub struct RawPlaybackSample {
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl RawPlaybackSample {
    pub fn new(payload: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            received_at,
        }
    }
}

/// Why a sample was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedSample {
    #[error("sample is not a JSON object")]
    NotAnObject,
    #[error("sample has no title")]
    MissingTitle,
    #[error("sample has no artist")]
    MissingArtist,
}

/// Strips configured patterns (e.g. "[Explicit]") from track text
pub struct TextCleaner {
    patterns: Vec<Regex>,
}

impl TextCleaner {
    pub fn new(config: &CleanupConfig) -> Self {
        if !config.enabled {
            return Self {
                patterns: Vec::new(),
            };
        }

        let patterns = config
            .patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("Ignoring invalid cleanup pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    /// Apply every pattern in order and trim; empty results become `None`
    pub fn clean(&self, text: &str) -> Option<String> {
        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern.replace_all(&result, "").into_owned();
        }
        let trimmed = result.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Converts raw samples into `(Track, PlaybackProgress)` pairs. Pure: no I/O,
/// no state carried between calls.
pub struct Normalizer {
    cleaner: TextCleaner,
}

impl Normalizer {
    pub fn new(cleanup: &CleanupConfig) -> Self {
        Self {
            cleaner: TextCleaner::new(cleanup),
        }
    }

    pub fn normalize(
        &self,
        sample: &RawPlaybackSample,
    ) -> Result<(Track, PlaybackProgress), MalformedSample> {
        let fields = sample
            .payload
            .as_object()
            .ok_or(MalformedSample::NotAnObject)?;

        let title = text_field(fields, &["title", "track"])
            .and_then(|t| self.cleaner.clean(&t))
            .ok_or(MalformedSample::MissingTitle)?;
        let artist = text_field(fields, &["artist"])
            .and_then(|a| self.cleaner.clean(&a))
            .ok_or(MalformedSample::MissingArtist)?;
        let album = text_field(fields, &["album"]).and_then(|a| self.cleaner.clean(&a));

        let track = Track {
            title,
            artist,
            album,
            duration: seconds_field(fields, "duration"),
            artwork: text_field(fields, &["albumArt", "artwork"]),
            source: text_field(fields, &["service"])
                .map(|s| Source::from_code(&s))
                .unwrap_or_default(),
        };

        let progress = PlaybackProgress {
            current_time: seconds_field(fields, "currentTime"),
            paused: bool_field(fields, "paused"),
            observed_at: sample.received_at,
        };

        Ok((track, progress))
    }
}

/// First non-empty string among `keys`
fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .filter_map(|value| match value {
            Value::String(s) => Some(s.trim()),
            _ => None,
        })
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Seconds value clamped to >= 0; missing, unparsable and non-finite values are 0
fn seconds_field(fields: &Map<String, Value>, key: &str) -> f64 {
    let raw = match fields.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    sanitize_seconds(raw.unwrap_or(0.0))
}

fn sanitize_seconds(value: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        0.0
    } else {
        value
    }
}

fn bool_field(fields: &Map<String, Value>, key: &str) -> bool {
    match fields.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
