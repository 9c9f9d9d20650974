// Presence update throttling
// Rate-limits presence publishes, coalescing bursts into one trailing update

use super::NowPlaying;
use crate::timer::Timer;
use std::time::Duration;
use tokio::time::Instant;

/// How soon after the previous publish an update may go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Track, repeat, or play/pause changes
    StateChange,
    /// Position jumps within the same track
    Seek,
}

impl Urgency {
    pub fn window(self) -> Duration {
        match self {
            Urgency::StateChange => Duration::from_millis(500),
            Urgency::Seek => Duration::from_millis(2000),
        }
    }
}

/// Single-slot throttle: the latest request inside a window replaces any
/// earlier one and is emitted once the window closes.
///
/// Leading edge: a request with no publish inside its window goes out at
/// once and opens the window. A burst therefore yields one trailing publish
/// only when an earlier publish already opened the window; starting from
/// idle, the first request is sent immediately and the last of the rest
/// trails.
#[derive(Default)]
pub struct PresenceThrottle {
    last_sent_at: Option<Instant>,
    pending: Option<NowPlaying>,
    trailing: Timer,
}

impl PresenceThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the update when it may be published right away. Otherwise it
    /// is held and later yielded by [`PresenceThrottle::fired`].
    pub fn request(&mut self, update: NowPlaying, urgency: Urgency) -> Option<NowPlaying> {
        let window = urgency.window();
        let now = Instant::now();

        if let Some(last) = self.last_sent_at {
            let elapsed = now.duration_since(last);
            if elapsed < window {
                self.pending = Some(update);
                self.trailing.start(window - elapsed);
                return None;
            }
        }

        self.trailing.cancel();
        self.pending = None;
        self.last_sent_at = Some(now);
        Some(update)
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves with the held update once its window closes. Cancel safe.
    pub async fn fired(&mut self) -> NowPlaying {
        loop {
            self.trailing.fired().await;
            if let Some(update) = self.pending.take() {
                self.last_sent_at = Some(Instant::now());
                return update;
            }
        }
    }

    /// Drop any held update
    pub fn discard(&mut self) {
        self.trailing.cancel();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{PlaybackProgress, Source, Track};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::time::{advance, timeout};

    fn update(current_time: f64) -> NowPlaying {
        NowPlaying {
            track: Arc::new(Track {
                title: "Title".into(),
                artist: "Artist".into(),
                album: None,
                duration: 240.0,
                artwork: None,
                source: Source::YouTubeMusic,
            }),
            progress: PlaybackProgress {
                current_time,
                paused: false,
                observed_at: Utc::now(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_goes_out_immediately() {
        let mut throttle = PresenceThrottle::new();
        let sent = throttle.request(update(1.0), Urgency::StateChange);
        assert_eq!(sent.map(|u| u.progress.current_time), Some(1.0));
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_window_yields_latest_once() {
        let mut throttle = PresenceThrottle::new();
        let started = Instant::now();
        assert!(throttle.request(update(0.0), Urgency::StateChange).is_some());

        advance(Duration::from_millis(100)).await;
        assert!(throttle.request(update(1.0), Urgency::StateChange).is_none());
        assert!(throttle.request(update(2.0), Urgency::StateChange).is_none());
        assert!(throttle.request(update(3.0), Urgency::StateChange).is_none());

        let emitted = throttle.fired().await;
        assert_eq!(emitted.progress.current_time, 3.0);
        assert!(started.elapsed() >= Urgency::StateChange.window());
        assert!(!throttle.has_pending());

        // Only one trailing publish for the whole burst
        assert!(timeout(Duration::from_secs(5), throttle.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_from_idle_sends_first_then_latest() {
        let mut throttle = PresenceThrottle::new();

        let immediate: Vec<f64> = [1.0, 2.0, 3.0]
            .into_iter()
            .filter_map(|t| throttle.request(update(t), Urgency::StateChange))
            .map(|u| u.progress.current_time)
            .collect();
        assert_eq!(immediate, vec![1.0]);

        let trailing = throttle.fired().await;
        assert_eq!(trailing.progress.current_time, 3.0);
        assert!(timeout(Duration::from_secs(5), throttle.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seeks_use_the_longer_window() {
        let mut throttle = PresenceThrottle::new();
        let started = Instant::now();
        assert!(throttle.request(update(0.0), Urgency::StateChange).is_some());

        advance(Duration::from_millis(600)).await;
        assert!(throttle.request(update(90.0), Urgency::Seek).is_none());

        let emitted = throttle.fired().await;
        assert_eq!(emitted.progress.current_time, 90.0);
        assert!(started.elapsed() >= Urgency::Seek.window());
    }

    #[tokio::test(start_paused = true)]
    async fn request_after_window_supersedes_held_update() {
        let mut throttle = PresenceThrottle::new();
        assert!(throttle.request(update(0.0), Urgency::StateChange).is_some());

        advance(Duration::from_millis(100)).await;
        assert!(throttle.request(update(1.0), Urgency::StateChange).is_none());

        advance(Duration::from_millis(600)).await;
        let sent = throttle.request(update(2.0), Urgency::StateChange);
        assert_eq!(sent.map(|u| u.progress.current_time), Some(2.0));
        assert!(!throttle.has_pending());
        assert!(timeout(Duration::from_secs(5), throttle.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn discard_drops_held_update() {
        let mut throttle = PresenceThrottle::new();
        throttle.request(update(0.0), Urgency::StateChange);
        throttle.request(update(1.0), Urgency::StateChange);
        assert!(throttle.has_pending());

        throttle.discard();
        assert!(!throttle.has_pending());
        assert!(timeout(Duration::from_secs(5), throttle.fired()).await.is_err());
    }
}
