// Track model
// Canonical track identity and playback progress produced by the normalizer

use chrono::{DateTime, Utc};
use std::fmt;

/// Separator between artist and title in a track key (U+241F SYMBOL FOR UNIT SEPARATOR)
const KEY_SEPARATOR: char = '\u{241F}';

/// Site the sample was scraped from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    YouTubeMusic,
    SoundCloud,
    #[default]
    Unknown,
}

impl Source {
    /// Parse the short service code reported by the scraper ("yt", "sc")
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "yt" | "youtube" | "ytmusic" => Self::YouTubeMusic,
            "sc" | "soundcloud" => Self::SoundCloud,
            _ => Self::Unknown,
        }
    }

    /// Human readable service name, if the source is known
    pub fn display_name(&self) -> Option<&'static str> {
        match self {
            Self::YouTubeMusic => Some("YouTube Music"),
            Self::SoundCloud => Some("SoundCloud"),
            Self::Unknown => None,
        }
    }
}

/// Identity of a track: exact artist and title, no fuzzy matching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey(String);

impl TrackKey {
    pub fn new(artist: &str, title: &str) -> Self {
        let mut key = String::with_capacity(artist.len() + title.len() + 3);
        key.push_str(artist);
        key.push(KEY_SEPARATOR);
        key.push_str(title);
        Self(key)
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a music track
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Duration in seconds, 0.0 when unknown
    pub duration: f64,
    pub artwork: Option<String>,
    pub source: Source,
}

impl Track {
    pub fn key(&self) -> TrackKey {
        TrackKey::new(&self.artist, &self.title)
    }

    /// Duration in seconds when the scraper reported one
    pub fn known_duration(&self) -> Option<f64> {
        (self.duration > 0.0).then_some(self.duration)
    }

    pub fn is_same(&self, other: &Track) -> bool {
        self.artist == other.artist && self.title == other.title
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Playback position observed alongside a track.
///
/// `current_time` only means something relative to the track it was paired
/// with; it is expected to grow but the scraper gives no guarantee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackProgress {
    /// Seconds elapsed in the track
    pub current_time: f64,
    pub paused: bool,
    /// Wall-clock time the sample was produced
    pub observed_at: DateTime<Utc>,
}
