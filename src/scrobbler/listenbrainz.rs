// ListenBrainz scrobbler implementation
// API Documentation: https://listenbrainz.readthedocs.io/

use super::traits::ScrobbleSink;
use crate::config::DEFAULT_LISTENBRAINZ_URL;
use crate::track::Track;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::listenbrainz::ListenBrainz;
use reqwest::Client;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenType {
    PlayingNow,
    Single,
}

impl ListenType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PlayingNow => "playing_now",
            Self::Single => "single",
        }
    }
}

pub struct ListenBrainzScrobbler {
    name: String,
    token: String,
    api_url: String,
    client: Client,
}

impl ListenBrainzScrobbler {
    pub fn new(name: String, token: String, api_url: String) -> Self {
        Self {
            name,
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Submit a listen to ListenBrainz
    async fn submit_listen(
        &self,
        listen_type: ListenType,
        track: &Track,
        listened_at: Option<i64>,
    ) -> Result<()> {
        let payload = listen_payload(listen_type, track, listened_at);
        let url = format!("{}/1/submit-listens", self.api_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.token))
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to ListenBrainz")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ListenBrainz API error ({}): {}", status, body);
        }

        Ok(())
    }
}

/// Check a user token against the instance at `api_url`. Blocking.
pub fn validate_token(name: &str, token: &str, api_url: &str) -> Result<()> {
    let mut client = if api_url.trim_end_matches('/') == DEFAULT_LISTENBRAINZ_URL {
        ListenBrainz::new()
    } else {
        ListenBrainz::new_with_url(api_url)
    };

    client
        .authenticate(token)
        .with_context(|| format!("Failed to authenticate with ListenBrainz ({})", name))?;

    Ok(())
}

fn listen_payload(listen_type: ListenType, track: &Track, listened_at: Option<i64>) -> Value {
    let mut track_metadata = json!({
        "artist_name": track.artist,
        "track_name": track.title,
    });

    if let Some(ref album) = track.album {
        track_metadata["release_name"] = json!(album);
    }

    if let Some(duration) = track.known_duration() {
        track_metadata["additional_info"] = json!({
            "duration_ms": (duration * 1000.0).floor() as u64,
        });
    }

    let mut listen = json!({ "track_metadata": track_metadata });
    if listen_type == ListenType::Single {
        // "single" listens require a timestamp
        let ts = listened_at.unwrap_or_else(|| Utc::now().timestamp());
        listen["listened_at"] = json!(ts);
    }

    json!({
        "listen_type": listen_type.as_str(),
        "payload": [listen],
    })
}

#[async_trait]
impl ScrobbleSink for ListenBrainzScrobbler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn now_playing(&self, track: &Track) -> Result<()> {
        log::debug!("Sending now playing to ListenBrainz ({}): {}", self.name, track);

        self.submit_listen(ListenType::PlayingNow, track, None)
            .await
            .context("Failed to update now playing on ListenBrainz")?;

        log::info!("ListenBrainz ({}): Now playing updated", self.name);
        Ok(())
    }

    async fn scrobble(&self, track: &Track, started_at: DateTime<Utc>) -> Result<()> {
        log::debug!("Scrobbling to ListenBrainz ({}): {}", self.name, track);

        self.submit_listen(ListenType::Single, track, Some(started_at.timestamp()))
            .await
            .context("Failed to scrobble to ListenBrainz")?;

        log::info!("ListenBrainz ({}): Scrobbled successfully", self.name);
        Ok(())
    }
}
