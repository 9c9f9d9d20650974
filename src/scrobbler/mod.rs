// Scrobbler module
// Scrobble engine plus the Last.fm and ListenBrainz sinks it fans out to

pub mod engine;
pub mod lastfm;
pub mod lastfm_auth;
pub mod listenbrainz;
pub mod traits;

pub use engine::ScrobbleEngine;
pub use traits::ScrobbleSink;

use crate::config::Config;
use std::sync::Arc;

/// Build a sink for every enabled scrobbling service in the config
pub fn build_sinks(config: &Config) -> Vec<Arc<dyn ScrobbleSink>> {
    let mut sinks: Vec<Arc<dyn ScrobbleSink>> = Vec::new();

    if let Some(lastfm) = config.lastfm.as_ref().filter(|l| l.enabled) {
        log::info!("Last.fm scrobbling enabled");
        sinks.push(Arc::new(lastfm::LastFmScrobbler::new(
            lastfm.api_key.clone(),
            lastfm.api_secret.clone(),
            lastfm.session_key.clone(),
        )));
    }

    for lb in config.listenbrainz.iter().filter(|l| l.enabled) {
        log::info!("ListenBrainz scrobbling enabled ({})", lb.name);
        sinks.push(Arc::new(listenbrainz::ListenBrainzScrobbler::new(
            lb.name.clone(),
            lb.token.clone(),
            lb.api_url.clone(),
        )));
    }

    sinks
}

#[cfg(test)]
pub mod testing {
    use super::traits::ScrobbleSink;
    use crate::track::Track;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall {
        NowPlaying(String),
        Scrobble(String, DateTime<Utc>),
    }

    /// Sink that records every call, optionally failing all of them
    pub struct RecordingSink {
        name: String,
        fail: bool,
        calls: Mutex<Vec<SinkCall>>,
    }

    impl RecordingSink {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn now_playing_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, SinkCall::NowPlaying(_)))
                .count()
        }

        pub fn scrobble_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, SinkCall::Scrobble(..)))
                .count()
        }

        fn record(&self, call: SinkCall) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                anyhow::bail!("{} is down", self.name);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ScrobbleSink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn now_playing(&self, track: &Track) -> Result<()> {
            self.record(SinkCall::NowPlaying(track.title.clone()))
        }

        async fn scrobble(&self, track: &Track, started_at: DateTime<Utc>) -> Result<()> {
            self.record(SinkCall::Scrobble(track.title.clone(), started_at))
        }
    }
}
