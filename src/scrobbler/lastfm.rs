// Last.fm scrobbler implementation
// API Documentation: https://www.last.fm/api/scrobbling

use super::traits::ScrobbleSink;
use crate::track::Track;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustfm_scrobble_proxy::{Scrobble, Scrobbler};

pub struct LastFmScrobbler {
    api_key: String,
    api_secret: String,
    session_key: String,
}

impl LastFmScrobbler {
    pub fn new(api_key: String, api_secret: String, session_key: String) -> Self {
        Self {
            api_key,
            api_secret,
            session_key,
        }
    }

    /// Run a blocking client call off the async workers
    async fn with_client<F>(&self, call: F) -> Result<()>
    where
        F: FnOnce(&Scrobbler) -> Result<()> + Send + 'static,
    {
        let mut client = Scrobbler::new(&self.api_key, &self.api_secret);
        client.authenticate_with_session_key(&self.session_key);

        tokio::task::spawn_blocking(move || call(&client))
            .await
            .context("Last.fm worker stopped unexpectedly")?
    }
}

/// Owned copy of the fields a submission needs, movable onto a blocking thread
#[derive(Debug, Clone, PartialEq)]
struct Submission {
    artist: String,
    title: String,
    album: Option<String>,
    timestamp: Option<u64>,
}

impl Submission {
    fn new(track: &Track, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            artist: track.artist.clone(),
            title: track.title.clone(),
            album: track.album.clone(),
            // Last.fm rejects timestamps before the epoch anyway
            timestamp: started_at.map(|t| t.timestamp().max(0) as u64),
        }
    }

    fn to_scrobble(&self) -> Scrobble {
        let mut scrobble = Scrobble::new(&self.artist, &self.title, self.album.as_deref());
        if let Some(timestamp) = self.timestamp {
            scrobble.with_timestamp(timestamp);
        }
        scrobble
    }
}

#[async_trait]
impl ScrobbleSink for LastFmScrobbler {
    fn name(&self) -> &str {
        "Last.fm"
    }

    async fn now_playing(&self, track: &Track) -> Result<()> {
        log::debug!("Sending now playing to Last.fm: {}", track);

        let submission = Submission::new(track, None);
        self.with_client(move |client| {
            client
                .now_playing(&submission.to_scrobble())
                .context("Failed to update now playing on Last.fm")?;
            Ok(())
        })
        .await?;

        log::info!("Last.fm: Now playing updated");
        Ok(())
    }

    async fn scrobble(&self, track: &Track, started_at: DateTime<Utc>) -> Result<()> {
        log::debug!("Scrobbling to Last.fm: {}", track);

        let submission = Submission::new(track, Some(started_at));
        self.with_client(move |client| {
            client
                .scrobble(&submission.to_scrobble())
                .context("Failed to scrobble to Last.fm")?;
            Ok(())
        })
        .await?;

        log::info!("Last.fm: Scrobbled successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Source;
    use chrono::TimeZone;

    fn track(album: Option<&str>) -> Track {
        Track {
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            album: album.map(str::to_string),
            duration: 215.9,
            artwork: None,
            source: Source::Unknown,
        }
    }

    #[test]
    fn scrobble_carries_session_start() {
        let started_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let submission = Submission::new(&track(Some("Album")), Some(started_at));

        assert_eq!(
            submission,
            Submission {
                artist: "Artist".into(),
                title: "Title".into(),
                album: Some("Album".into()),
                timestamp: Some(1_700_000_000),
            }
        );
        // Builds without touching the network
        let _ = submission.to_scrobble();
    }

    #[test]
    fn now_playing_has_no_timestamp() {
        let submission = Submission::new(&track(None), None);
        assert_eq!(submission.timestamp, None);
        assert_eq!(submission.album, None);
    }

    #[test]
    fn pre_epoch_start_is_clamped() {
        let started_at = Utc.timestamp_opt(-10, 0).unwrap();
        let submission = Submission::new(&track(None), Some(started_at));
        assert_eq!(submission.timestamp, Some(0));
    }

    #[test]
    fn sink_is_named_after_the_service() {
        let sink = LastFmScrobbler::new("k".into(), "s".into(), "sk".into());
        assert_eq!(sink.name(), "Last.fm");
    }
}
