// Async manual-reset gate used as the pause checkpoint.
//
// The gate starts open. Pausing closes it; every task awaiting `wait_open`
// parks until the gate is re-opened by a resume, a cancellation, or a
// dispose. Built on a watch channel so waiters never miss an open that
// races their subscription.

use tokio::sync::watch;

#[derive(Clone)]
pub struct KeepGoing {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl KeepGoing {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        Self { tx, rx }
    }

    pub fn open(&self) {
        let _ = self.tx.send(true);
    }

    pub fn close(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_closed(&self) -> bool {
        !*self.rx.borrow()
    }

    /// Wait until the gate is open. Returns immediately when it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.rx.clone();
        // wait_for resolves immediately if the current value already matches
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for KeepGoing {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
