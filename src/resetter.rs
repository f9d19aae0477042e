// Device reboot.
//
// Same one-shot shape as the eraser: a single native command awaited through
// the hub with an optional timeout.

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
pub enum ResetState {
    None = 0,
    Idle = 1,
    Resetting = 2,
    Complete = 3,
    Failed = 4,
}

#[derive(Debug, Clone)]
pub enum ResetEvent {
    StateChanged {
        old_state: ResetState,
        new_state: ResetState,
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

pub struct ResetHub {
    hub: EventHub<ResetEvent>,
    state: Mutex<ResetState>,
}

impl ResetHub {
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
            state: Mutex::new(ResetState::None),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ResetEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> ResetState {
        self.state.lock().map(|s| *s).unwrap_or(ResetState::None)
    }

    pub fn state_changed_advertisement(&self, new_state: ResetState) {
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
        self.hub.emit(&ResetEvent::StateChanged {
            old_state,
            new_state,
        });
    }

    pub fn fatal_error_advertisement(&self, error_message: &str, error_code: GlobalErrorCode) {
        tlog!("[resetter] Fatal error ({:?}): {}", error_code, error_message);
        self.hub.emit(&ResetEvent::FatalErrorOccurred {
            error_message: error_message.to_string(),
            error_code,
        });
    }

    pub fn log_advertisement(&self, level: LogLevel, message: &str) {
        tlog!("[resetter] [{}] {}", level, message);
        self.hub.emit(&ResetEvent::LogEmitted {
            level,
            message: message.to_string(),
            category: "device-resetter".to_string(),
        });
    }
}

impl Default for ResetHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait NativeDeviceResetterProxy: Send + Sync {
    fn bind(&self, hub: Arc<ResetHub>);
    async fn begin_reset(&self);
    fn disconnect(&self);
}

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("resetter has been disposed")]
    Disposed,
    #[error("device reset timed out after {0:?}")]
    Timeout(Duration),
    #[error("device reset errored out ({code:?}): {message}")]
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
    hub: Arc<ResetHub>,
    completion: Arc<Completion<AttemptOutcome>>,
    sub_id: SubscriptionId,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sub_id);
        self.completion.force_cancel();
    }
}

pub struct DeviceResetter {
    proxy: Arc<dyn NativeDeviceResetterProxy>,
    hub: Arc<ResetHub>,
    disposed: AtomicBool,
    last_fatal_error_message: Arc<Mutex<String>>,
}

impl DeviceResetter {
    pub fn new(proxy: Arc<dyn NativeDeviceResetterProxy>) -> Self {
        let hub = Arc::new(ResetHub::new());
        proxy.bind(hub.clone());

        let last_fatal_error_message = Arc::new(Mutex::new(String::new()));
        let last_fatal = last_fatal_error_message.clone();
        hub.subscribe(move |event| {
            if let ResetEvent::FatalErrorOccurred { error_message, .. } = event {
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
        F: Fn(&ResetEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> ResetState {
        self.hub.current_state()
    }

    pub fn last_fatal_error_message(&self) -> String {
        self.last_fatal_error_message
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Fire-and-forget variant; callers observe the outcome through events.
    pub async fn begin_reset(&self) -> Result<(), ResetError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ResetError::Disposed);
        }
        self.proxy.begin_reset().await;
        Ok(())
    }

    /// Reboot the device and await the outcome.
    pub async fn reset(&self, timeout: Option<Duration>) -> Result<(), ResetError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ResetError::Disposed);
        }

        let completion = Arc::new(Completion::<AttemptOutcome>::new());
        let listener_completion = completion.clone();
        let sub_id = self.hub.subscribe(move |event| match event {
            ResetEvent::StateChanged {
                new_state: ResetState::Complete,
                ..
            } => {
                listener_completion.try_resolve(AttemptOutcome::Completed);
            }
            ResetEvent::FatalErrorOccurred {
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

        self.proxy.begin_reset().await;

        match completion.wait(timeout).await {
            CompletionOutcome::Resolved(AttemptOutcome::Completed) => Ok(()),
            CompletionOutcome::Resolved(AttemptOutcome::FatalError { message, code }) => {
                Err(ResetError::ErroredOut { message, code })
            }
            CompletionOutcome::TimedOut => Err(ResetError::Timeout(timeout.unwrap_or_default())),
            CompletionOutcome::Cancelled => Err(ResetError::ErroredOut {
                message: "reset was torn down before completing".to_string(),
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

impl Drop for DeviceResetter {
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
        hub: Mutex<Option<Arc<ResetHub>>>,
        script: Script,
    }

    impl MockProxy {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                hub: Mutex::new(None),
                script,
            })
        }

        fn hub(&self) -> Arc<ResetHub> {
            self.hub.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl NativeDeviceResetterProxy for MockProxy {
        fn bind(&self, hub: Arc<ResetHub>) {
            *self.hub.lock().unwrap() = Some(hub);
        }

        async fn begin_reset(&self) {
            let hub = self.hub();
            match self.script {
                Script::Complete => {
                    hub.state_changed_advertisement(ResetState::Idle);
                    hub.state_changed_advertisement(ResetState::Resetting);
                    hub.state_changed_advertisement(ResetState::Complete);
                }
                Script::Fail => {
                    hub.state_changed_advertisement(ResetState::Idle);
                    hub.state_changed_advertisement(ResetState::Failed);
                    hub.fatal_error_advertisement("device went dark", GlobalErrorCode::Timeout);
                }
                Script::Stall => {}
            }
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn test_numeric_stability_of_reset_states() {
        assert_eq!(ResetState::None as i32, 0);
        assert_eq!(ResetState::Idle as i32, 1);
        assert_eq!(ResetState::Resetting as i32, 2);
        assert_eq!(ResetState::Complete as i32, 3);
        assert_eq!(ResetState::Failed as i32, 4);
    }

    #[tokio::test]
    async fn test_reset_awaits_completion() {
        let proxy = MockProxy::new(Script::Complete);
        let resetter = DeviceResetter::new(proxy.clone());

        resetter.reset(None).await.unwrap();
        assert_eq!(resetter.current_state(), ResetState::Complete);
    }

    #[tokio::test]
    async fn test_reset_surfaces_fatal_errors() {
        let proxy = MockProxy::new(Script::Fail);
        let resetter = DeviceResetter::new(proxy.clone());

        let error = resetter.reset(None).await.unwrap_err();
        assert!(matches!(
            error,
            ResetError::ErroredOut {
                code: GlobalErrorCode::Timeout,
                ..
            }
        ));
        assert_eq!(resetter.last_fatal_error_message(), "device went dark");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_times_out() {
        let proxy = MockProxy::new(Script::Stall);
        let resetter = DeviceResetter::new(proxy.clone());

        let error = resetter.reset(Some(Duration::from_secs(3))).await.unwrap_err();
        assert!(matches!(error, ResetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disconnected_resetter_rejects_operations() {
        let proxy = MockProxy::new(Script::Complete);
        let resetter = DeviceResetter::new(proxy.clone());

        resetter.disconnect();
        assert!(matches!(
            resetter.reset(None).await.unwrap_err(),
            ResetError::Disposed
        ));
    }
}
