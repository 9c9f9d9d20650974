// Common traits for scrobbling services

use crate::track::Track;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A scrobble-recording service. Calls are best effort: the engine logs a
/// failure and never retries it.
#[async_trait]
pub trait ScrobbleSink: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Update "now playing" status
    async fn now_playing(&self, track: &Track) -> Result<()>;

    /// Submit a scrobble for a play that started at `started_at`
    async fn scrobble(&self, track: &Track, started_at: DateTime<Utc>) -> Result<()>;
}
