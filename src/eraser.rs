// Firmware slot erasure.
//
// Much simpler than the transfer components: a single fire-and-forget native
// command plus an awaitable wrapper with an optional timeout. No retries, no
// pause gate.

use crate::completion::{Completion, CompletionOutcome};
use crate::events::{EventHub, GlobalErrorCode, LogLevel, SubscriptionId};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum ErasureState {
    None = 0,
    Idle = 1,
    Erasing = 2,
    Complete = 3,
    Failed = 4,
}

#[derive(Debug, Clone)]
pub enum ErasureEvent {
    StateChanged {
        old_state: ErasureState,
        new_state: ErasureState,
    },
    BusyStateChanged {
        busy: bool,
    },
    LogEmitted {
        level: LogLevel,
        message: String,
        category: String,
    },
    FatalErrorOccurred {
        error_message: String,
        error_code: GlobalErrorCode,
    },
}

/// Event facade for the eraser. Tracks the state itself so native proxies
/// only ever push the new state in.
pub struct ErasureHub {
    hub: EventHub<ErasureEvent>,
    state: Mutex<ErasureState>,
}

impl ErasureHub {
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
            state: Mutex::new(ErasureState::None),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ErasureEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> ErasureState {
        self.state.lock().map(|s| *s).unwrap_or(ErasureState::None)
    }

    pub fn state_changed_advertisement(&self, new_state: ErasureState) {
        let old_state = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if *state == new_state {
                return;
            }
            let old_state = *state;
            *state = new_state;
            old_state
        };
        self.hub.emit(&ErasureEvent::StateChanged {
            old_state,
            new_state,
        });
    }

    pub fn busy_state_changed_advertisement(&self, busy: bool) {
        self.hub.emit(&ErasureEvent::BusyStateChanged { busy });
    }

    pub fn fatal_error_advertisement(&self, error_message: &str, error_code: GlobalErrorCode) {
        tlog!("[eraser] Fatal error ({:?}): {}", error_code, error_message);
        self.hub.emit(&ErasureEvent::FatalErrorOccurred {
            error_message: error_message.to_string(),
            error_code,
        });
    }

    pub fn log_advertisement(&self, level: LogLevel, message: &str) {
        tlog!("[eraser] [{}] {}", level, message);
        self.hub.emit(&ErasureEvent::LogEmitted {
            level,
            message: message.to_string(),
            category: "firmware-eraser".to_string(),
        });
    }
}

impl Default for ErasureHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait NativeFirmwareEraserProxy: Send + Sync {
    fn bind(&self, hub: Arc<ErasureHub>);
    async fn begin_erasure(&self, image_index: u8);
    fn disconnect(&self);
}

#[derive(Debug, Error)]
pub enum EraseError {
    #[error("eraser has been disposed")]
    Disposed,
    #[error("erasure timed out after {0:?}")]
    Timeout(Duration),
    #[error("erasure errored out ({code:?}): {message}")]
    ErroredOut {
        message: String,
        code: GlobalErrorCode,
    },
}

enum AttemptOutcome {
    Completed,
    FatalError {
        message: String,
        code: GlobalErrorCode,
    },
}

struct AttemptGuard {
    hub: Arc<ErasureHub>,
    completion: Arc<Completion<AttemptOutcome>>,
    sub_id: SubscriptionId,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sub_id);
        self.completion.force_cancel();
    }
}

pub struct FirmwareEraser {
    proxy: Arc<dyn NativeFirmwareEraserProxy>,
    hub: Arc<ErasureHub>,
    disposed: AtomicBool,
    last_fatal_error_message: Arc<Mutex<String>>,
}

impl FirmwareEraser {
    pub fn new(proxy: Arc<dyn NativeFirmwareEraserProxy>) -> Self {
        let hub = Arc::new(ErasureHub::new());
        proxy.bind(hub.clone());

        let last_fatal_error_message = Arc::new(Mutex::new(String::new()));
        let last_fatal = last_fatal_error_message.clone();
        hub.subscribe(move |event| {
            if let ErasureEvent::FatalErrorOccurred { error_message, .. } = event {
                if let Ok(mut message) = last_fatal.lock() {
                    *message = error_message.clone();
                }
            }
        });

        Self {
            proxy,
            hub,
            disposed: AtomicBool::new(false),
            last_fatal_error_message,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ErasureEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> ErasureState {
        self.hub.current_state()
    }

    pub fn last_fatal_error_message(&self) -> String {
        self.last_fatal_error_message
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Fire-and-forget variant; callers observe the outcome through events.
    pub async fn begin_erasure(&self, image_index: u8) -> Result<(), EraseError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EraseError::Disposed);
        }
        self.proxy.begin_erasure(image_index).await;
        Ok(())
    }

    /// Erase the firmware image in the given slot and await the outcome.
    pub async fn erase(
        &self,
        image_index: u8,
        timeout: Option<Duration>,
    ) -> Result<(), EraseError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EraseError::Disposed);
        }

        let completion = Arc::new(Completion::<AttemptOutcome>::new());
        let listener_completion = completion.clone();
        let sub_id = self.hub.subscribe(move |event| match event {
            ErasureEvent::StateChanged {
                new_state: ErasureState::Complete,
                ..
            } => {
                listener_completion.try_resolve(AttemptOutcome::Completed);
            }
            ErasureEvent::FatalErrorOccurred {
                error_message,
                error_code,
            } => {
                listener_completion.try_resolve(AttemptOutcome::FatalError {
                    message: error_message.clone(),
                    code: *error_code,
                });
            }
            _ => {}
        });
        let _attempt = AttemptGuard {
            hub: self.hub.clone(),
            completion: completion.clone(),
            sub_id,
        };

        self.proxy.begin_erasure(image_index).await;

        match completion.wait(timeout).await {
            CompletionOutcome::Resolved(AttemptOutcome::Completed) => Ok(()),
            CompletionOutcome::Resolved(AttemptOutcome::FatalError { message, code }) => {
                Err(EraseError::ErroredOut {
                    message,
                    code,
                })
            }
            CompletionOutcome::TimedOut => Err(EraseError::Timeout(timeout.unwrap_or_default())),
            CompletionOutcome::Cancelled => Err(EraseError::ErroredOut {
                message: "erasure was torn down before completing".to_string(),
                code: GlobalErrorCode::Generic,
            }),
        }
    }

    pub fn disconnect(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.proxy.disconnect();
    }
}

impl Drop for FirmwareEraser {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    enum Script {
        Complete,
        Fail,
        Stall,
    }

    struct MockProxy {
        hub: Mutex<Option<Arc<ErasureHub>>>,
        script: Script,
        erased_indices: Mutex<Vec<u8>>,
    }

    impl MockProxy {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                hub: Mutex::new(None),
                script,
                erased_indices: Mutex::new(Vec::new()),
            })
        }

        fn hub(&self) -> Arc<ErasureHub> {
            self.hub.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl NativeFirmwareEraserProxy for MockProxy {
        fn bind(&self, hub: Arc<ErasureHub>) {
            *self.hub.lock().unwrap() = Some(hub);
        }

        async fn begin_erasure(&self, image_index: u8) {
            self.erased_indices.lock().unwrap().push(image_index);
            let hub = self.hub();
            match self.script {
                Script::Complete => {
                    hub.state_changed_advertisement(ErasureState::Idle);
                    hub.busy_state_changed_advertisement(true);
                    hub.state_changed_advertisement(ErasureState::Erasing);
                    hub.state_changed_advertisement(ErasureState::Complete);
                    hub.busy_state_changed_advertisement(false);
                }
                Script::Fail => {
                    hub.state_changed_advertisement(ErasureState::Idle);
                    hub.state_changed_advertisement(ErasureState::Erasing);
                    hub.state_changed_advertisement(ErasureState::Failed);
                    hub.fatal_error_advertisement(
                        "slot is write-protected",
                        GlobalErrorCode::AccessDenied,
                    );
                }
                Script::Stall => {}
            }
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn test_numeric_stability_of_erasure_states() {
        assert_eq!(ErasureState::None as i32, 0);
        assert_eq!(ErasureState::Idle as i32, 1);
        assert_eq!(ErasureState::Erasing as i32, 2);
        assert_eq!(ErasureState::Complete as i32, 3);
        assert_eq!(ErasureState::Failed as i32, 4);
    }

    #[tokio::test]
    async fn test_erase_awaits_completion() {
        let proxy = MockProxy::new(Script::Complete);
        let eraser = FirmwareEraser::new(proxy.clone());

        eraser.erase(1, None).await.unwrap();
        assert_eq!(eraser.current_state(), ErasureState::Complete);
        assert_eq!(*proxy.erased_indices.lock().unwrap(), [1]);
    }

    #[tokio::test]
    async fn test_erase_surfaces_fatal_errors() {
        let proxy = MockProxy::new(Script::Fail);
        let eraser = FirmwareEraser::new(proxy.clone());

        let error = eraser.erase(0, None).await.unwrap_err();
        assert!(matches!(
            error,
            EraseError::ErroredOut {
                code: GlobalErrorCode::AccessDenied,
                ..
            }
        ));
        assert_eq!(eraser.last_fatal_error_message(), "slot is write-protected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_erase_times_out() {
        let proxy = MockProxy::new(Script::Stall);
        let eraser = FirmwareEraser::new(proxy.clone());

        let error = eraser
            .erase(1, Some(Duration::from_secs(3)))
            .await
            .unwrap_err();
        assert!(matches!(error, EraseError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disconnected_eraser_rejects_operations() {
        let proxy = MockProxy::new(Script::Complete);
        let eraser = FirmwareEraser::new(proxy.clone());

        eraser.disconnect();
        assert!(matches!(
            eraser.erase(1, None).await.unwrap_err(),
            EraseError::Disposed
        ));
        assert!(matches!(
            eraser.begin_erasure(1).await.unwrap_err(),
            EraseError::Disposed
        ));
    }
}
