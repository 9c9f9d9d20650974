// Presence module
// Rich presence session lifecycle, payload building, and update throttling

pub mod activity;
pub mod engine;
pub mod ipc;
pub mod throttle;

pub use activity::Activity;
pub use engine::{PresenceEngine, PresenceHandle};
pub use throttle::{PresenceThrottle, Urgency};

use crate::track::{PlaybackProgress, Track};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence service is not running")]
    Unavailable,
    #[error("presence handshake rejected: {0}")]
    Handshake(String),
    #[error("presence session is not connected")]
    NotConnected,
    #[error("presence connect timed out")]
    Timeout,
    #[error("malformed presence frame: {0}")]
    Protocol(String),
    #[error("presence I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the presence display should show: the track and the progress it was
/// observed with
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: Arc<Track>,
    pub progress: PlaybackProgress,
}

/// A freshly established presence session plus its drop notification.
/// The receiver resolves (or errors) once the service goes away.
pub struct Connection {
    pub session: Box<dyn PresenceSession>,
    pub dropped: oneshot::Receiver<()>,
}

/// Opens sessions to the presence service
#[async_trait]
pub trait PresenceConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, PresenceError>;
}

#[async_trait]
pub trait PresenceSession: Send {
    async fn publish(&mut self, activity: &Activity) -> Result<(), PresenceError>;

    async fn clear(&mut self) -> Result<(), PresenceError>;

    async fn close(&mut self);
}
