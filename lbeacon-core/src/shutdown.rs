//! Cooperative shutdown signal shared by every long-lived task (spec §5:
//! "A shutdown flag (atomic boolean) is polled between iterations by every
//! loop").
//!
//! Async tasks additionally get a `tokio::sync::watch`-backed waiter so
//! they can `select!` on shutdown instead of polling, the way
//! `examples/bluez-bluer/bluer-tools/src/blumon.rs` selects on a signal
//! stream. Blocking tasks (the HCI scan loops, run inside
//! `spawn_blocking`) only ever see the plain [`std::sync::atomic::AtomicBool`]
//! handle, since they cannot `.await` anything.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

/// Owned by the supervisor; cloning shares the same underlying flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(AtomicBool::new(false)), tx }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.tx.send(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// A raw handle suitable for a `spawn_blocking` task that cannot
    /// `.await` a watch channel.
    pub fn flag_handle(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    /// An async waiter for tasks that run on the Tokio runtime.
    pub fn watcher(&self) -> ShutdownWatcher {
        ShutdownWatcher(self.tx.subscribe())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownWatcher(watch::Receiver<bool>);

impl ShutdownWatcher {
    /// Resolves once shutdown has been requested. Safe to `select!` against.
    pub async fn wait(&mut self) {
        loop {
            if *self.0.borrow() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check, for loops that poll rather than select.
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watcher_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let mut watcher = signal.watcher();
        assert!(!watcher.is_requested());

        signal.trigger();
        watcher.wait().await;
        assert!(watcher.is_requested());
    }

    #[test]
    fn flag_handle_reflects_trigger_without_async() {
        let signal = ShutdownSignal::new();
        let handle = signal.flag_handle();
        assert!(!handle.load(Ordering::Acquire));
        signal.trigger();
        assert!(handle.load(Ordering::Acquire));
    }
}
