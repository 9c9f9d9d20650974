// Presence sync engine
// Owns the presence session: connect, reconnect with backoff, and publishing

use super::activity::{ActivityBuilder, TimestampAnchor};
use super::{Connection, NowPlaying, PresenceConnector, PresenceError, PresenceSession};
use crate::timer::Timer;
use std::future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Retry delay after a failed connect attempt
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Retry delay after the service dropped a ready session
pub const DROP_RETRY_DELAY: Duration = Duration::from_secs(15);
/// Retry delay after a publish found the session gone
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on a single connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// Disconnected with a reconnect attempt scheduled
    Reconnecting,
}

#[derive(Debug)]
pub enum PresenceCommand {
    Update(NowPlaying),
    Clear,
    Disconnect,
}

enum Event {
    Command(PresenceCommand),
    ReconnectDue,
    SessionDropped,
}

async fn wait_dropped(dropped: &mut Option<oneshot::Receiver<()>>) {
    match dropped {
        // A closed channel means the session's reader is gone as well
        Some(rx) => {
            let _ = rx.await;
        }
        None => future::pending::<()>().await,
    }
}

/// Presence session state machine. Long-lived: the only way out of the
/// connect/reconnect cycle is [`PresenceEngine::disconnect`].
pub struct PresenceEngine<C: PresenceConnector> {
    connector: C,
    builder: ActivityBuilder,
    connected: bool,
    connecting: bool,
    session: Option<Box<dyn PresenceSession>>,
    dropped: Option<oneshot::Receiver<()>>,
    /// Latest track to show; buffered while disconnected
    displayed: Option<NowPlaying>,
    anchor: TimestampAnchor,
    reconnect: Timer,
}

impl<C: PresenceConnector> PresenceEngine<C> {
    pub fn new(connector: C, builder: ActivityBuilder) -> Self {
        Self {
            connector,
            builder,
            connected: false,
            connecting: false,
            session: None,
            dropped: None,
            displayed: None,
            anchor: TimestampAnchor::default(),
            reconnect: Timer::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Ready
        } else if self.connecting {
            ConnectionState::Connecting
        } else if self.reconnect.is_pending() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub async fn connect(&mut self) {
        if self.connected {
            return;
        }
        self.teardown().await;

        self.connecting = true;
        log::info!("Presence: connecting...");
        let result = match tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(PresenceError::Timeout),
        };
        self.connecting = false;

        match result {
            Ok(Connection { session, dropped }) => {
                log::info!("Presence: connected");
                self.session = Some(session);
                self.dropped = Some(dropped);
                self.connected = true;
                self.reconnect.cancel();

                if self.displayed.is_some() {
                    self.publish().await;
                }
            }
            Err(e) => {
                log::warn!("Presence: connect failed: {}", e);
                self.schedule_reconnect(CONNECT_RETRY_DELAY);
            }
        }
    }

    /// Schedule a reconnect attempt unless one is already pending.
    /// Returns whether a new attempt was scheduled.
    pub fn schedule_reconnect(&mut self, delay: Duration) -> bool {
        let scheduled = self.reconnect.start_if_idle(delay);
        if scheduled {
            log::info!("Presence: retry in {}s", delay.as_secs());
        }
        scheduled
    }

    pub fn on_session_dropped(&mut self) {
        log::info!("Presence: disconnected");
        self.mark_disconnected();
        self.schedule_reconnect(DROP_RETRY_DELAY);
    }

    pub async fn update_presence(&mut self, now_playing: NowPlaying) {
        let track_changed = self
            .displayed
            .as_ref()
            .map(|shown| !shown.track.is_same(&now_playing.track))
            .unwrap_or(true);
        if track_changed {
            self.anchor.reset();
        }
        self.displayed = Some(now_playing);

        if !self.connected {
            log::debug!("Presence: not ready, buffering update");
            return;
        }
        self.publish().await;
    }

    pub async fn clear(&mut self) {
        self.displayed = None;
        self.anchor.reset();

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = session.clear().await;
        if let Err(e) = result {
            self.handle_session_error("clear", e);
        }
    }

    /// Leave the connect/reconnect cycle: cancel any pending retry and close
    /// the session
    pub async fn disconnect(&mut self) {
        self.reconnect.cancel();
        self.displayed = None;
        self.anchor.reset();
        if let Some(session) = self.session.as_mut() {
            let _ = session.clear().await;
        }
        self.teardown().await;
        log::info!("Presence: disconnected by request");
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PresenceCommand>) {
        self.connect().await;

        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },
                () = self.reconnect.fired() => Event::ReconnectDue,
                () = wait_dropped(&mut self.dropped) => Event::SessionDropped,
            };

            match event {
                Event::Command(PresenceCommand::Update(now_playing)) => {
                    self.update_presence(now_playing).await
                }
                Event::Command(PresenceCommand::Clear) => self.clear().await,
                Event::Command(PresenceCommand::Disconnect) => self.disconnect().await,
                Event::ReconnectDue => self.connect().await,
                Event::SessionDropped => self.on_session_dropped(),
            }
            log::debug!("Presence state: {:?}", self.state());
        }

        self.disconnect().await;
    }

    async fn publish(&mut self) {
        let (Some(session), Some(now_playing)) = (self.session.as_mut(), self.displayed.as_ref())
        else {
            return;
        };

        let activity = self.builder.build(now_playing, &mut self.anchor);
        let result = session.publish(&activity).await;
        match result {
            Ok(()) => log::debug!("Presence: showing {} - {}", activity.state, activity.details),
            Err(e) => self.handle_session_error("update", e),
        }
    }

    fn handle_session_error(&mut self, action: &str, error: PresenceError) {
        log::warn!("Presence: {} failed: {}", action, error);
        if matches!(error, PresenceError::NotConnected) {
            self.mark_disconnected();
            self.schedule_reconnect(PUBLISH_RETRY_DELAY);
        }
    }

    fn mark_disconnected(&mut self) {
        self.connected = false;
        self.session = None;
        self.dropped = None;
    }

    async fn teardown(&mut self) {
        self.connected = false;
        self.dropped = None;
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Cheap cloneable front for a running [`PresenceEngine`]
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    commands: mpsc::UnboundedSender<PresenceCommand>,
}

impl PresenceHandle {
    pub fn new(commands: mpsc::UnboundedSender<PresenceCommand>) -> Self {
        Self { commands }
    }

    /// Run `engine` on its own task. The engine disconnects and stops once
    /// every handle is dropped.
    pub fn spawn<C: PresenceConnector>(engine: PresenceEngine<C>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(engine.run(rx));
        (Self::new(tx), task)
    }

    pub fn update(&self, now_playing: NowPlaying) {
        self.send(PresenceCommand::Update(now_playing));
    }

    pub fn clear(&self) {
        self.send(PresenceCommand::Clear);
    }

    pub fn disconnect(&self) {
        self.send(PresenceCommand::Disconnect);
    }

    fn send(&self, command: PresenceCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Presence engine has stopped; dropping command");
        }
    }
}
