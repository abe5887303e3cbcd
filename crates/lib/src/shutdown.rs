//! Process-wide exit event.
//!
//! The controller's accept loop, pending command reads, and every listener's accept and relay
//! wait on a [`ShutdownSignal`] alongside their socket so they can return on exit without any
//! peer activity.

use tokio::sync::watch;

/// Fires the exit event. Dropping the trigger without calling [`ShutdownTrigger::trigger`]
/// also counts as exit.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable handle that waits for the exit event.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another handle to wait on, for components created after startup.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the exit event has fired (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // Err means the trigger was dropped, which is treated as exit.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
