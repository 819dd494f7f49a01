//! One-shot stop signalling between a run and its workers.

use tokio::sync::watch;

/// Fires a stop signal. Dropping the trigger does not fire it.
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

/// Observes a stop signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopTrigger {
    /// Creates an unfired trigger.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a new observer.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        StopTrigger::new().signal()
    }

    /// Returns true once the trigger fired.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when the trigger fires. Pends forever if the trigger is
    /// dropped unfired.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
