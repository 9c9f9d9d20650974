// Cancelable single-slot timer
// At most one pending deadline per timer; replacing or cancelling aborts the old one

use std::future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A timer slot holding at most one pending deadline.
///
/// Every schedule bumps a generation counter, so a fire that raced with
/// `cancel` or `start` is recognised as stale and swallowed by [`Timer::fired`].
pub struct Timer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
    fire_tx: mpsc::UnboundedSender<u64>,
    fire_rx: mpsc::UnboundedReceiver<u64>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Self {
            handle: None,
            generation: 0,
            fire_tx,
            fire_rx,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }

    /// Schedule a fire after `delay`, replacing any pending one
    pub fn start(&mut self, delay: Duration) {
        self.cancel();

        let generation = self.generation;
        let fire_tx = self.fire_tx.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fire_tx.send(generation);
        }));
    }

    /// Schedule a fire after `delay` unless one is already pending.
    /// Returns whether a new deadline was scheduled.
    pub fn start_if_idle(&mut self, delay: Duration) -> bool {
        if self.is_pending() {
            return false;
        }
        self.start(delay);
        true
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Resolves when the current deadline elapses. Never resolves while idle.
    /// Cancel safe.
    pub async fn fired(&mut self) {
        loop {
            match self.fire_rx.recv().await {
                Some(generation) if generation == self.generation && self.handle.is_some() => {
                    self.handle = None;
                    return;
                }
                Some(_) => continue,
                // We hold a sender, so the channel never closes
                None => future::pending::<()>().await,
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
