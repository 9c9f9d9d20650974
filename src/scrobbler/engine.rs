// Scrobble engine
// Per-track play session: one "now playing" per play, one commit once the threshold is crossed

use super::traits::ScrobbleSink;
use crate::detector::{ChangeVerdict, Verdict};
use crate::track::{Track, TrackKey};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;

/// Minimum played seconds before any scrobble
pub const MIN_PLAY_SECONDS: f64 = 30.0;
/// Scrobble after 4 minutes even if the percentage threshold is further away
pub const SCROBBLE_TIME_CAP: f64 = 240.0;
/// Nominal duration used when the scraper did not report one
pub const FALLBACK_DURATION: f64 = 180.0;

/// Represents the current play session state
#[derive(Debug, Clone)]
struct ScrobbleSession {
    track: Arc<Track>,
    started_at: DateTime<Utc>,
    now_playing_sent: bool,
    committed: bool,
    /// Started by a repeat of the previous track
    repeat: bool,
}

impl ScrobbleSession {
    fn new(track: Arc<Track>, started_at: DateTime<Utc>, repeat: bool) -> Self {
        Self {
            track,
            started_at,
            now_playing_sent: false,
            committed: false,
            repeat,
        }
    }
}

/// Seconds of playback after which a track of `duration` seconds may be scrobbled
pub fn scrobble_threshold(duration: f64, threshold_percent: u8) -> f64 {
    let duration = if duration > 0.0 {
        duration
    } else {
        FALLBACK_DURATION
    };
    (duration * f64::from(threshold_percent) / 100.0).min(SCROBBLE_TIME_CAP)
}

/// Fans play sessions out to every enabled scrobble sink.
///
/// Sink calls run as detached tasks; callers never wait on the network.
pub struct ScrobbleEngine {
    sinks: Vec<Arc<dyn ScrobbleSink>>,
    threshold_percent: u8,
    session: Option<ScrobbleSession>,
    last_committed: Arc<Mutex<Option<TrackKey>>>,
    in_flight: JoinSet<()>,
}

impl ScrobbleEngine {
    pub fn new(sinks: Vec<Arc<dyn ScrobbleSink>>, threshold_percent: u8) -> Self {
        Self {
            sinks,
            threshold_percent,
            session: None,
            last_committed: Arc::new(Mutex::new(None)),
            in_flight: JoinSet::new(),
        }
    }

    #[cfg(test)]
    pub fn active_track(&self) -> Option<&Track> {
        self.session.as_ref().map(|s| s.track.as_ref())
    }

    #[cfg(test)]
    pub fn now_playing_sent(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.now_playing_sent)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn is_committed(&self) -> bool {
        self.session.as_ref().map(|s| s.committed).unwrap_or(false)
    }

    pub fn on_verdict(&mut self, verdict: &ChangeVerdict) {
        if !verdict.kind.starts_play() {
            return;
        }

        let repeat = verdict.kind == Verdict::Repeat;
        if repeat {
            *self.lock_last_committed() = None;
            log::info!("Track repeat detected, resetting scrobble state");
        }

        log::info!(
            "Now playing: {}{}",
            verdict.track,
            if repeat { " (repeat)" } else { "" }
        );

        let mut session = ScrobbleSession::new(
            Arc::clone(&verdict.track),
            verdict.progress.observed_at,
            repeat,
        );

        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let track = Arc::clone(&session.track);
            self.in_flight.spawn(async move {
                if let Err(e) = sink.now_playing(&track).await {
                    log::warn!("{}: now playing failed for {}: {:#}", sink.name(), track, e);
                }
            });
        }
        session.now_playing_sent = true;

        self.session = Some(session);
        self.reap();
    }

    pub fn on_progress(&mut self, current_time: f64, duration: f64) {
        let Some(session) = &self.session else {
            return;
        };
        if session.committed {
            return;
        }

        let threshold = scrobble_threshold(duration, self.threshold_percent);
        if current_time > threshold && current_time > MIN_PLAY_SECONDS {
            log::info!(
                "Threshold reached ({:.1}s > {:.1}s) for {}",
                current_time,
                threshold,
                session.track
            );
            self.commit();
        }
    }

    /// Submit the active session to every sink. Runs at most once per session:
    /// the session is marked committed before any sink call starts.
    pub fn commit(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.committed {
            return;
        }
        session.committed = true;

        let track = Arc::clone(&session.track);
        let started_at = session.started_at;
        let repeat = session.repeat;
        let key = track.key();

        if !repeat && self.lock_last_committed().as_ref() == Some(&key) {
            log::info!("Already scrobbled {}, skipping", track);
            return;
        }

        log::info!("Scrobbling: {}", track);

        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let track = Arc::clone(&track);
            let key = key.clone();
            let last_committed = Arc::clone(&self.last_committed);
            self.in_flight.spawn(async move {
                match sink.scrobble(&track, started_at).await {
                    Ok(()) => {
                        *last_committed
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(key);
                    }
                    Err(e) => log::error!("{}: scrobble failed for {}: {:#}", sink.name(), track, e),
                }
            });
        }
        self.reap();
    }

    /// Wait for every in-flight sink call to finish
    pub async fn drain(&mut self) {
        while let Some(result) = self.in_flight.join_next().await {
            if let Err(e) = result {
                log::error!("Sink task ended abnormally: {}", e);
            }
        }
    }

    fn reap(&mut self) {
        while self.in_flight.try_join_next().is_some() {}
    }

    fn lock_last_committed(&self) -> std::sync::MutexGuard<'_, Option<TrackKey>> {
        self.last_committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
