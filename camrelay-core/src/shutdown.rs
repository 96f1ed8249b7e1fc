//! Cooperative termination flag
//!
//! The CLI owns the [`ShutdownTrigger`] and fires it from its signal task;
//! the monitor loop holds the [`Shutdown`] side and checks it at every
//! iteration (and races it against every bounded wait).

use tokio::sync::watch;

/// Create a linked trigger / listener pair
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx, fired: false })
}

/// Sending side of the termination flag
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was already requested
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Listening side of the termination flag
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    fired: bool,
}

impl Shutdown {
    /// Non-blocking check
    pub fn is_set(&mut self) -> bool {
        if !self.fired {
            // A dropped trigger can never fire, so it is not a request.
            self.fired = *self.rx.borrow();
        }
        self.fired
    }

    /// Resolve once shutdown is requested
    ///
    /// Cancel safe. If every trigger is dropped without firing, this never
    /// resolves.
    pub async fn wait(&mut self) {
        if self.fired {
            return;
        }
        loop {
            if *self.rx.borrow_and_update() {
                self.fired = true;
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
