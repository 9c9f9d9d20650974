// Dispatch fanout
// Wires normalized samples through the change detector into the scrobble and presence engines

use crate::detector::{ChangeDetector, ChangeVerdict, Verdict};
use crate::normalizer::{Normalizer, RawPlaybackSample};
use crate::presence::{NowPlaying, PresenceHandle, PresenceThrottle, Urgency};
use crate::scrobbler::ScrobbleEngine;
use crate::track::PlaybackProgress;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Playhead drift (seconds) beyond which an unchanged track counts as seeked
pub const SEEK_DRIFT_TOLERANCE: f64 = 2.0;

/// How long in-flight sink calls may run after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Whether `now` lands away from where `previous` would have played to
fn is_seek(previous: &PlaybackProgress, now: &PlaybackProgress) -> bool {
    if previous.paused != now.paused {
        return false;
    }

    let expected = if previous.paused {
        previous.current_time
    } else {
        let elapsed = (now.observed_at - previous.observed_at).num_milliseconds() as f64 / 1000.0;
        previous.current_time + elapsed.max(0.0)
    };
    (now.current_time - expected).abs() > SEEK_DRIFT_TOLERANCE
}

enum Event {
    Sample(RawPlaybackSample),
    Trailing(NowPlaying),
}

/// Owns the detector and both engines; every sample passes through here in
/// arrival order.
pub struct DispatchFanout {
    normalizer: Normalizer,
    detector: ChangeDetector,
    scrobble: ScrobbleEngine,
    throttle: PresenceThrottle,
    presence: Option<PresenceHandle>,
    last_progress: Option<PlaybackProgress>,
}

impl DispatchFanout {
    pub fn new(
        normalizer: Normalizer,
        scrobble: ScrobbleEngine,
        presence: Option<PresenceHandle>,
    ) -> Self {
        Self {
            normalizer,
            detector: ChangeDetector::default(),
            scrobble,
            throttle: PresenceThrottle::new(),
            presence,
            last_progress: None,
        }
    }

    /// Classify one sample and hand it to both engines. Never waits on a
    /// sink or the presence service. Returns `None` for rejected samples.
    pub fn ingest(&mut self, sample: &RawPlaybackSample) -> Option<Verdict> {
        let (track, progress) = match self.normalizer.normalize(sample) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("Dropping sample: {}", e);
                return None;
            }
        };

        let mut verdict = self.detector.observe(track, progress);
        let previous = self.last_progress.replace(progress);
        if verdict.kind == Verdict::NoChange
            && previous.map_or(false, |prev| is_seek(&prev, &progress))
        {
            log::debug!("Seek to {:.1}s in {}", progress.current_time, verdict.track);
            verdict.kind = Verdict::Seek;
        }

        self.scrobble.on_verdict(&verdict);
        self.scrobble
            .on_progress(progress.current_time, verdict.track.duration);
        self.sync_presence(&verdict, previous);

        Some(verdict.kind)
    }

    fn sync_presence(&mut self, verdict: &ChangeVerdict, previous: Option<PlaybackProgress>) {
        let Some(presence) = &self.presence else {
            return;
        };

        let urgency = match verdict.kind {
            Verdict::NewTrack | Verdict::Repeat => Urgency::StateChange,
            Verdict::Seek => Urgency::Seek,
            Verdict::NoChange => match previous {
                Some(prev) if prev.paused != verdict.progress.paused => Urgency::StateChange,
                _ => return,
            },
        };

        let update = NowPlaying {
            track: Arc::clone(&verdict.track),
            progress: verdict.progress,
        };
        if let Some(update) = self.throttle.request(update, urgency) {
            presence.update(update);
        }
    }

    /// Process samples until the source closes or `shutdown` resolves
    pub async fn run<F>(mut self, mut samples: mpsc::Receiver<RawPlaybackSample>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                sample = samples.recv() => match sample {
                    Some(sample) => Event::Sample(sample),
                    None => {
                        log::info!("Sample source closed");
                        break;
                    }
                },
                update = self.throttle.fired() => Event::Trailing(update),
                () = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
            };

            match event {
                Event::Sample(sample) => {
                    self.ingest(&sample);
                }
                Event::Trailing(update) => {
                    if let Some(presence) = &self.presence {
                        presence.update(update);
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Clear presence and give in-flight sink calls a bounded time to land
    pub async fn finish(mut self) {
        self.throttle.discard();
        if let Some(presence) = self.presence.take() {
            presence.clear();
            presence.disconnect();
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.scrobble.drain())
            .await
            .is_err()
        {
            log::warn!("Abandoning scrobble submissions still in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanupConfig;
    use crate::presence::engine::PresenceCommand;
    use crate::scrobbler::testing::RecordingSink;
    use crate::scrobbler::ScrobbleSink;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn sample(title: &str, duration: f64, current_time: f64, at_ms: i64) -> RawPlaybackSample {
        RawPlaybackSample::new(
            json!({
                "title": title,
                "artist": "A",
                "duration": duration,
                "currentTime": current_time,
                "service": "yt",
            }),
            base() + ChronoDuration::milliseconds(at_ms),
        )
    }

    fn paused_sample(current_time: f64, at_ms: i64) -> RawPlaybackSample {
        RawPlaybackSample::new(
            json!({
                "title": "T1",
                "artist": "A",
                "duration": 200,
                "currentTime": current_time,
                "paused": true,
            }),
            base() + ChronoDuration::milliseconds(at_ms),
        )
    }

    fn fanout(sinks: &[Arc<RecordingSink>], presence: Option<PresenceHandle>) -> DispatchFanout {
        let sinks: Vec<Arc<dyn ScrobbleSink>> = sinks
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ScrobbleSink>)
            .collect();
        DispatchFanout::new(
            Normalizer::new(&CleanupConfig::default()),
            ScrobbleEngine::new(sinks, 50),
            presence,
        )
    }

    #[tokio::test]
    async fn single_play_notifies_once_and_commits_on_threshold() {
        let sink = RecordingSink::new("sink");
        let mut fanout = fanout(&[Arc::clone(&sink)], None);

        assert_eq!(fanout.ingest(&sample("T1", 300.0, 0.0, 0)), Some(Verdict::NewTrack));
        fanout.scrobble.drain().await;
        assert_eq!(sink.now_playing_count(), 1);

        assert_eq!(fanout.ingest(&sample("T1", 300.0, 31.0, 31_000)), Some(Verdict::NoChange));
        fanout.scrobble.drain().await;
        assert_eq!(sink.scrobble_count(), 0);

        assert_eq!(fanout.ingest(&sample("T1", 300.0, 151.0, 151_000)), Some(Verdict::NoChange));
        fanout.scrobble.drain().await;
        assert_eq!(sink.now_playing_count(), 1);
        assert_eq!(sink.scrobble_count(), 1);
    }

    #[tokio::test]
    async fn repeat_allows_a_second_commit() {
        let sink = RecordingSink::new("sink");
        let mut fanout = fanout(&[Arc::clone(&sink)], None);

        assert_eq!(fanout.ingest(&sample("T1", 180.0, 170.0, 0)), Some(Verdict::NewTrack));
        assert_eq!(fanout.ingest(&sample("T1", 180.0, 179.0, 9_000)), Some(Verdict::NoChange));
        fanout.scrobble.drain().await;
        assert_eq!(sink.scrobble_count(), 1);

        assert_eq!(fanout.ingest(&sample("T1", 180.0, 2.0, 10_000)), Some(Verdict::Repeat));
        assert!(!fanout.scrobble.is_committed());

        assert_eq!(fanout.ingest(&sample("T1", 180.0, 95.0, 103_000)), Some(Verdict::NoChange));
        fanout.scrobble.drain().await;
        assert_eq!(sink.now_playing_count(), 2);
        assert_eq!(sink.scrobble_count(), 2);
    }

    #[tokio::test]
    async fn playhead_jumps_are_refined_into_seeks() {
        let mut fanout = fanout(&[], None);

        fanout.ingest(&sample("T1", 200.0, 10.0, 0));
        assert_eq!(fanout.ingest(&sample("T1", 200.0, 70.0, 1_000)), Some(Verdict::Seek));
        assert_eq!(fanout.ingest(&sample("T1", 200.0, 71.0, 2_000)), Some(Verdict::NoChange));
        // Small backward seek stays below the repeat threshold
        assert_eq!(fanout.ingest(&sample("T1", 200.0, 68.0, 3_000)), Some(Verdict::Seek));
        // A pause toggle is a state change, not a seek
        assert_eq!(fanout.ingest(&paused_sample(69.0, 4_000)), Some(Verdict::NoChange));
        assert_eq!(fanout.ingest(&paused_sample(69.0, 9_000)), Some(Verdict::NoChange));
    }

    #[tokio::test]
    async fn failing_sink_does_not_affect_the_other() {
        let broken = RecordingSink::failing("broken");
        let healthy = RecordingSink::new("healthy");
        let mut fanout = fanout(&[Arc::clone(&broken), Arc::clone(&healthy)], None);

        fanout.ingest(&sample("T1", 100.0, 0.0, 0));
        fanout.ingest(&sample("T1", 100.0, 51.0, 51_000));
        fanout.ingest(&sample("T1", 100.0, 52.0, 52_000));
        fanout.scrobble.drain().await;

        assert_eq!(broken.scrobble_count(), 1);
        assert_eq!(healthy.now_playing_count(), 1);
        assert_eq!(healthy.scrobble_count(), 1);
    }

    #[tokio::test]
    async fn malformed_samples_are_dropped() {
        let mut fanout = fanout(&[], None);

        assert_eq!(fanout.ingest(&sample("T1", 200.0, 10.0, 0)), Some(Verdict::NewTrack));
        let junk = RawPlaybackSample::new(json!({"title": "", "artist": "A"}), base());
        assert_eq!(fanout.ingest(&junk), None);
        let junk = RawPlaybackSample::new(json!("not an object"), base());
        assert_eq!(fanout.ingest(&junk), None);
        assert_eq!(fanout.ingest(&sample("T1", 200.0, 11.0, 1_000)), Some(Verdict::NoChange));
    }

    #[tokio::test(start_paused = true)]
    async fn presence_updates_are_throttled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fanout = fanout(&[], Some(PresenceHandle::new(tx)));

        fanout.ingest(&sample("T1", 200.0, 10.0, 0));
        assert!(matches!(rx.try_recv(), Ok(PresenceCommand::Update(_))));

        // Plain progress publishes nothing
        fanout.ingest(&sample("T1", 200.0, 10.5, 500));
        assert!(rx.try_recv().is_err());

        // Pause toggle inside the window waits for the trailing edge
        fanout.ingest(&paused_sample(10.6, 600));
        assert!(rx.try_recv().is_err());
        let trailing = fanout.throttle.fired().await;
        assert!(trailing.progress.paused);

        fanout.finish().await;
        assert!(matches!(rx.try_recv(), Ok(PresenceCommand::Clear)));
        assert!(matches!(rx.try_recv(), Ok(PresenceCommand::Disconnect)));
    }

    #[tokio::test]
    async fn run_drains_until_source_closes() {
        let sink = RecordingSink::new("sink");
        let fanout = fanout(&[Arc::clone(&sink)], None);
        let (tx, rx) = mpsc::channel(8);

        for (t, at) in [(0.0, 0), (31.0, 31_000), (151.0, 151_000)] {
            tx.send(sample("T1", 300.0, t, at)).await.unwrap();
        }
        drop(tx);

        fanout.run(rx, std::future::pending()).await;
        assert_eq!(sink.now_playing_count(), 1);
        assert_eq!(sink.scrobble_count(), 1);
    }
}
