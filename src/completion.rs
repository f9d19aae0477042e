// One-shot completion source for a single transfer attempt.
//
// Every retry attempt gets a fresh `Completion`; transient event handlers
// resolve it, the orchestrator awaits it. A timed-out wait fossilizes the
// source: the sender is dropped on the spot, so a late resolution from a
// straggling callback is a no-op instead of leaking into the next attempt.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
    rx: Mutex<Option<oneshot::Receiver<T>>>,
}

#[derive(Debug, PartialEq)]
pub enum CompletionOutcome<T> {
    Resolved(T),
    Cancelled,
    TimedOut,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Resolve the attempt. Returns false when the attempt was already
    /// resolved, fossilized, or cancelled.
    pub fn try_resolve(&self, value: T) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop the sender so the pending (or any future) wait observes
    /// cancellation and late resolutions become no-ops.
    pub fn force_cancel(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    /// Await the resolution, optionally bounded by a timeout. On timeout the
    /// source is fossilized before returning.
    pub async fn wait(&self, timeout: Option<Duration>) -> CompletionOutcome<T> {
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let rx = match rx {
            Some(rx) => rx,
            None => return CompletionOutcome::Cancelled,
        };

        match timeout {
            None => match rx.await {
                Ok(value) => CompletionOutcome::Resolved(value),
                Err(_) => CompletionOutcome::Cancelled,
            },
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(value)) => CompletionOutcome::Resolved(value),
                Ok(Err(_)) => CompletionOutcome::Cancelled,
                Err(_) => {
                    self.force_cancel();
                    CompletionOutcome::TimedOut
                }
            },
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_then_wait() {
        let completion = Completion::new();
        assert!(completion.try_resolve(42));
        assert_eq!(completion.wait(None).await, CompletionOutcome::Resolved(42));
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let completion = Completion::new();
        assert!(completion.try_resolve(1));
        assert!(!completion.try_resolve(2));
        assert_eq!(completion.wait(None).await, CompletionOutcome::Resolved(1));
    }

    #[tokio::test]
    async fn test_force_cancel_makes_wait_observe_cancellation() {
        let completion: Completion<u32> = Completion::new();
        completion.force_cancel();
        assert_eq!(completion.wait(None).await, CompletionOutcome::Cancelled);
        assert!(!completion.try_resolve(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fossilizes_the_source() {
        let completion: Completion<u32> = Completion::new();
        let outcome = completion.wait(Some(Duration::from_secs(5))).await;
        assert_eq!(outcome, CompletionOutcome::TimedOut);
        // Late resolution after the deadline is a no-op
        assert!(!completion.try_resolve(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_before_deadline_beats_the_timeout() {
        let completion = Arc::new(Completion::new());
        let resolver = completion.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            resolver.try_resolve("done");
        });
        let outcome = completion.wait(Some(Duration::from_secs(10))).await;
        assert_eq!(outcome, CompletionOutcome::Resolved("done"));
    }
}
