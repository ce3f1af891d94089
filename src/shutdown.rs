//! Sweep-wide cancellation signal.
//!
//! A single [`Shutdown`] is held by whoever may cancel the sweep (the CLI's
//! Ctrl-C handler, a test). Every activity that must react holds a cloned
//! [`ShutdownSignal`]. Built on `tokio::sync::watch`, so a late subscriber
//! still observes a stop that already happened.

use tokio::sync::watch;

/// Triggers cancellation.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Observes cancellation.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/observer pair.
pub fn channel() -> (Shutdown, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (Shutdown { tx }, ShutdownSignal { rx })
}

impl Shutdown {
    /// Request cancellation. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // The sender is dropped; `stopped` then pends forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    ///
    /// Pends forever if the trigger is dropped without firing.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
