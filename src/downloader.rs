// File download orchestration.
//
// Same retry machinery as the uploader with the download-specific twists:
// the awaited result carries the downloaded bytes, the terminal error set is
// wider (missing file, path-is-a-directory, unauthorized) and the fail-safe
// escalation only touches the two tunables downloads expose (MTU and window
// capacity).

use crate::completion::{Completion, CompletionOutcome};
use crate::events::{
    GlobalErrorCode, LogLevel, SubscriptionId, TransferEvent, TransferHub, TransferState,
    TransferVerdict,
};
use crate::gate::KeepGoing;
use crate::paths::{self, PathError};
use crate::settings::{
    failsafe_settings_if_connection_proves_unstable, failsafe_settings_if_device_is_problematic,
    ConnectionSettings,
};
use crate::uploader::DEFAULT_GRACEFUL_CANCELLATION_TIMEOUT;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const SUSPICIOUS_PROGRESS_EVENT_THRESHOLD: u32 = 10;

// ============================================================================
// Native proxy seam
// ============================================================================

/// Callback surface handed to the native download layer. Wraps the transfer
/// hub and adds the data hand-off that uploads have no need for.
pub struct DownloaderCallbacks {
    hub: Arc<TransferHub>,
    received: Mutex<Option<Vec<u8>>>,
}

impl DownloaderCallbacks {
    fn new(hub: Arc<TransferHub>) -> Self {
        Self {
            hub,
            received: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &TransferHub {
        &self.hub
    }

    /// Stash the downloaded bytes and drive the state machine to Complete.
    pub fn download_completed_advertisement(&self, data: Vec<u8>) {
        if let Ok(mut slot) = self.received.lock() {
            *slot = Some(data);
        }
        self.hub.state_changed_advertisement(TransferState::Complete);
    }

    fn take_received(&self) -> Option<Vec<u8>> {
        self.received.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
pub trait NativeFileDownloaderProxy: Send + Sync {
    fn bind(&self, callbacks: Arc<DownloaderCallbacks>);

    async fn begin_download(
        &self,
        settings: ConnectionSettings,
        remote_file_path: &str,
    ) -> TransferVerdict;

    fn try_pause(&self);
    fn try_resume(&self);
    fn try_cancel(&self, reason: &str);
    fn disconnect(&self);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("downloader has been disposed")]
    Disposed,
    #[error("another operation is already ongoing on this downloader")]
    AnotherOperationOngoing,
    #[error(transparent)]
    InvalidRemotePath(#[from] PathError),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    #[error("download was cancelled ({reason})")]
    Cancelled { reason: String },
    #[error("remote file '{path}' not found on the device: {message}")]
    RemoteFileNotFound { path: String, message: String },
    #[error("remote path '{path}' points to a directory: {message}")]
    RemotePathPointsToDirectory { path: String, message: String },
    #[error("unauthorized to download '{path}': {message}")]
    Unauthorized { path: String, message: String },
    #[error("download errored out in state {state:?} ({code:?}): {message}")]
    ErroredOut {
        state: TransferState,
        code: GlobalErrorCode,
        message: String,
    },
    #[error("all {tries} attempt(s) to download '{path}' failed")]
    AllAttemptsFailed {
        path: String,
        tries: u32,
        #[source]
        cause: Box<DownloadError>,
    },
    #[error("internal downloader error: {0}")]
    Internal(String),
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_file_path: String,
    pub host_device_manufacturer: String,
    pub host_device_model: String,
    pub settings: ConnectionSettings,
    pub timeout: Option<Duration>,
    pub max_tries: u32,
    pub sleep_between_retries: Duration,
    pub graceful_cancellation_timeout: Duration,
}

impl Default for DownloadRequest {
    fn default() -> Self {
        Self {
            remote_file_path: String::new(),
            host_device_manufacturer: String::new(),
            host_device_model: String::new(),
            settings: ConnectionSettings::default(),
            timeout: None,
            max_tries: 10,
            sleep_between_retries: Duration::from_millis(100),
            graceful_cancellation_timeout: DEFAULT_GRACEFUL_CANCELLATION_TIMEOUT,
        }
    }
}

// ============================================================================
// Attempt plumbing
// ============================================================================

#[derive(Debug)]
enum AttemptOutcome {
    Completed(Vec<u8>),
    FatalError {
        state: TransferState,
        message: String,
        code: GlobalErrorCode,
    },
    Cancelled {
        reason: String,
    },
}

struct AttemptGuard {
    hub: Arc<TransferHub>,
    completion: Arc<Completion<AttemptOutcome>>,
    sub_id: SubscriptionId,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sub_id);
        self.completion.force_cancel();
    }
}

struct OperationGuard<'a> {
    downloader: &'a FileDownloader,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.downloader.abort_cancellation_watchdog();
        self.downloader.ongoing.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// FileDownloader
// ============================================================================

pub struct FileDownloader {
    proxy: Arc<dyn NativeFileDownloaderProxy>,
    callbacks: Arc<DownloaderCallbacks>,
    keep_going: KeepGoing,
    ongoing: AtomicBool,
    disposed: AtomicBool,
    cancellation_requested: Arc<AtomicBool>,
    cancellation_reason: Arc<Mutex<String>>,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
    last_fatal_error_message: Arc<Mutex<String>>,
}

impl FileDownloader {
    pub fn new(proxy: Arc<dyn NativeFileDownloaderProxy>) -> Self {
        let hub = Arc::new(TransferHub::new("downloader"));
        let callbacks = Arc::new(DownloaderCallbacks::new(hub.clone()));
        proxy.bind(callbacks.clone());

        let last_fatal_error_message = Arc::new(Mutex::new(String::new()));
        let last_fatal = last_fatal_error_message.clone();
        hub.subscribe(move |event| {
            if let TransferEvent::FatalErrorOccurred { error_message, .. } = event {
                if let Ok(mut message) = last_fatal.lock() {
                    *message = error_message.clone();
                }
            }
        });

        Self {
            proxy,
            callbacks,
            keep_going: KeepGoing::new(),
            ongoing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancellation_requested: Arc::new(AtomicBool::new(false)),
            cancellation_reason: Arc::new(Mutex::new(String::new())),
            watchdog: Arc::new(Mutex::new(None)),
            last_fatal_error_message,
        }
    }

    fn hub(&self) -> &Arc<TransferHub> {
        &self.callbacks.hub
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.hub().subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub().unsubscribe(id)
    }

    pub fn current_state(&self) -> TransferState {
        self.hub().current_state()
    }

    pub fn last_fatal_error_message(&self) -> String {
        self.last_fatal_error_message
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Download `remote_file_path` from the device, retrying transient
    /// failures up to the request's budget. Resolves with the file contents.
    pub async fn download(&self, request: DownloadRequest) -> Result<Vec<u8>, DownloadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DownloadError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;
        self.download_core(request).await
    }

    /// Download several files back to back, deduplicating paths first. Each
    /// entry in the result maps the sanitized path to `Some(bytes)` on
    /// success or `None` when that file's retry budget was exhausted.
    pub async fn download_many(
        &self,
        remote_file_paths: &[String],
        request: DownloadRequest,
    ) -> Result<HashMap<String, Option<Vec<u8>>>, DownloadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DownloadError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;

        let unique_paths = paths::sanitize_unique_remote_paths(remote_file_paths)?;
        let mut results = HashMap::new();

        for path in unique_paths {
            let single = DownloadRequest {
                remote_file_path: path.clone(),
                ..request.clone()
            };
            match self.download_core(single).await {
                Ok(data) => {
                    results.insert(path, Some(data));
                }
                Err(
                    error @ (DownloadError::AllAttemptsFailed { .. }
                    | DownloadError::RemoteFileNotFound { .. }
                    | DownloadError::RemotePathPointsToDirectory { .. }
                    | DownloadError::Unauthorized { .. }),
                ) => {
                    self.hub().log_advertisement(
                        LogLevel::Error,
                        &format!("Download of '{}' failed, moving on to the next file: {}", path, error),
                    );
                    results.insert(path, None);
                }
                Err(other) => return Err(other),
            }
        }

        Ok(results)
    }

    /// Fire-and-forget variant; callers observe the outcome through events.
    pub async fn begin_download(
        &self,
        settings: ConnectionSettings,
        host_device_manufacturer: &str,
        host_device_model: &str,
        remote_file_path: &str,
    ) -> Result<(), DownloadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DownloadError::Disposed);
        }
        paths::validate_remote_file_path(remote_file_path)?;
        let remote_file_path = paths::sanitize_remote_file_path(remote_file_path);

        let settings =
            self.apply_device_advisory(host_device_manufacturer, host_device_model, settings);
        self.hub().set_resource(&remote_file_path);

        self.translate_verdict(self.proxy.begin_download(settings, &remote_file_path).await)
    }

    pub fn try_pause(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst)
            || self.cancellation_requested.load(Ordering::SeqCst)
            || !self.ongoing.load(Ordering::SeqCst)
        {
            return false;
        }
        self.keep_going.close();
        self.hub().arm_pause_echo_guard();
        self.proxy.try_pause();
        true
    }

    pub fn try_resume(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) || !self.ongoing.load(Ordering::SeqCst) {
            return false;
        }
        self.hub().disarm_pause_echo_guard();
        self.proxy.try_resume();
        self.keep_going.open();
        true
    }

    pub fn try_cancel(&self, reason: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.cancellation_requested.store(true, Ordering::SeqCst);
        if let Ok(mut stored) = self.cancellation_reason.lock() {
            *stored = reason.to_string();
        }
        self.hub().disarm_pause_echo_guard();
        self.proxy.try_cancel(reason);
        self.keep_going.open();
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.keep_going.open();
        self.abort_cancellation_watchdog();
        self.proxy.disconnect();
    }

    // ------------------------------------------------------------------------
    // Core retry loop
    // ------------------------------------------------------------------------

    async fn download_core(&self, request: DownloadRequest) -> Result<Vec<u8>, DownloadError> {
        paths::validate_remote_file_path(&request.remote_file_path)?;
        let remote_file_path = paths::sanitize_remote_file_path(&request.remote_file_path);
        if request.max_tries == 0 {
            return Err(DownloadError::InvalidSettings(
                "max_tries must be at least 1".to_string(),
            ));
        }
        if request.host_device_manufacturer.trim().is_empty()
            || request.host_device_model.trim().is_empty()
        {
            return Err(DownloadError::InvalidSettings(
                "host device manufacturer and model must be given".to_string(),
            ));
        }

        self.cancellation_requested.store(false, Ordering::SeqCst);
        if let Ok(mut reason) = self.cancellation_reason.lock() {
            reason.clear();
        }
        self.abort_cancellation_watchdog();
        self.keep_going.open();
        self.hub().disarm_pause_echo_guard();
        self.hub().set_resource(&remote_file_path);

        let settings = self.apply_device_advisory(
            &request.host_device_manufacturer,
            &request.host_device_model,
            request.settings,
        );

        let mut tries: u32 = 0;
        let mut suspicious_failures: u32 = 0;
        let mut warned_about_instability = false;

        let downloaded = loop {
            self.check_if_paused_or_cancelled().await?;

            let attempt_settings = match failsafe_settings_if_connection_proves_unstable(
                false,
                tries + 1,
                request.max_tries,
                suspicious_failures,
            ) {
                Some(fail_safe) => {
                    if !warned_about_instability {
                        self.hub().log_advertisement(
                            LogLevel::Warning,
                            "Connection is proving unstable, resorting to fail-safe connection settings for the remaining attempts",
                        );
                        warned_about_instability = true;
                    }
                    fail_safe
                }
                None => settings,
            };

            let completion = Arc::new(Completion::<AttemptOutcome>::new());
            let progress_events = Arc::new(AtomicU32::new(0));
            let sub_id = self.wire_attempt_handlers(
                &completion,
                &progress_events,
                request.graceful_cancellation_timeout,
            );
            let _attempt = AttemptGuard {
                hub: self.hub().clone(),
                completion: completion.clone(),
                sub_id,
            };

            self.translate_verdict(
                self.proxy
                    .begin_download(attempt_settings, &remote_file_path)
                    .await,
            )?;

            match completion.wait(request.timeout).await {
                CompletionOutcome::Resolved(AttemptOutcome::Completed(data)) => break data,
                CompletionOutcome::Resolved(AttemptOutcome::Cancelled { reason }) => {
                    return Err(DownloadError::Cancelled { reason });
                }
                CompletionOutcome::Resolved(AttemptOutcome::FatalError {
                    state,
                    message,
                    code,
                }) => {
                    match code {
                        GlobalErrorCode::FilesystemNotFound => {
                            return Err(DownloadError::RemoteFileNotFound {
                                path: remote_file_path,
                                message,
                            });
                        }
                        GlobalErrorCode::FilesystemIsDirectory => {
                            return Err(DownloadError::RemotePathPointsToDirectory {
                                path: remote_file_path,
                                message,
                            });
                        }
                        GlobalErrorCode::AccessDenied => {
                            return Err(DownloadError::Unauthorized {
                                path: remote_file_path,
                                message,
                            });
                        }
                        _ => {}
                    }

                    tries += 1;
                    if progress_events.load(Ordering::Relaxed)
                        <= SUSPICIOUS_PROGRESS_EVENT_THRESHOLD
                    {
                        suspicious_failures += 1;
                    }
                    if tries >= request.max_tries {
                        return Err(DownloadError::AllAttemptsFailed {
                            path: remote_file_path,
                            tries,
                            cause: Box::new(DownloadError::ErroredOut {
                                state,
                                code,
                                message,
                            }),
                        });
                    }

                    self.hub().log_advertisement(
                        LogLevel::Warning,
                        &format!(
                            "Download attempt {}/{} failed in state {:?} ({:?}: {}), retrying",
                            tries, request.max_tries, state, code, message
                        ),
                    );
                    tokio::time::sleep(request.sleep_between_retries).await;
                }
                CompletionOutcome::TimedOut => {
                    self.hub()
                        .synthesize_transition(TransferState::None, TransferState::Error);
                    return Err(DownloadError::Timeout(request.timeout.unwrap_or_default()));
                }
                CompletionOutcome::Cancelled => {
                    return Err(DownloadError::Cancelled {
                        reason: self.cancellation_reason(),
                    });
                }
            }
        };

        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }

        Ok(downloaded)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn wire_attempt_handlers(
        &self,
        completion: &Arc<Completion<AttemptOutcome>>,
        progress_events: &Arc<AtomicU32>,
        grace_period: Duration,
    ) -> SubscriptionId {
        let completion = completion.clone();
        let progress_events = progress_events.clone();
        let callbacks = self.callbacks.clone();
        let watchdog = self.watchdog.clone();
        let cancellation_requested = self.cancellation_requested.clone();
        let cancellation_reason = self.cancellation_reason.clone();

        self.hub().subscribe(move |event| match event {
            TransferEvent::StateChanged {
                new_state: TransferState::Idle,
                ..
            } => {
                progress_events.store(0, Ordering::Relaxed);
            }
            TransferEvent::ProgressChanged { .. } => {
                progress_events.fetch_add(1, Ordering::Relaxed);
            }
            TransferEvent::Completed { .. } => {
                let data = callbacks.take_received().unwrap_or_default();
                completion.try_resolve(AttemptOutcome::Completed(data));
            }
            TransferEvent::FatalErrorOccurred {
                state,
                error_message,
                error_code,
            } => {
                completion.try_resolve(AttemptOutcome::FatalError {
                    state: *state,
                    message: error_message.clone(),
                    code: *error_code,
                });
            }
            TransferEvent::Cancelling { reason } => {
                // A cancellation may also originate on the device side, so
                // the request flag is latched here rather than in try_cancel
                // alone. Once latched, the operation ends in Cancelled no
                // matter what the native layer reports afterwards.
                cancellation_requested.store(true, Ordering::SeqCst);
                if let Ok(mut stored) = cancellation_reason.lock() {
                    if stored.is_empty() {
                        *stored = reason.clone();
                    }
                }

                let mut slot = match watchdog.lock() {
                    Ok(slot) => slot,
                    Err(_) => return,
                };
                if slot.is_some() {
                    return;
                }
                let hub = callbacks.hub.clone();
                let reason = reason.clone();
                *slot = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    tlog!(
                        "[downloader] Grace period expired, force-declaring the download cancelled"
                    );
                    hub.state_changed_advertisement(TransferState::Cancelled);
                    hub.cancelled_advertisement(&reason);
                }));
            }
            TransferEvent::Cancelled { reason } => {
                if let Ok(mut slot) = watchdog.lock() {
                    if let Some(handle) = slot.take() {
                        handle.abort();
                    }
                }
                completion.try_resolve(AttemptOutcome::Cancelled {
                    reason: reason.clone(),
                });
            }
            _ => {}
        })
    }

    async fn check_if_paused_or_cancelled(&self) -> Result<(), DownloadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DownloadError::Disposed);
        }
        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }
        if !self.keep_going.is_closed() {
            return Ok(());
        }

        self.hub()
            .synthesize_transition(TransferState::None, TransferState::Paused);
        self.keep_going.wait_open().await;

        if self.disposed.load(Ordering::SeqCst) {
            return Err(DownloadError::Disposed);
        }
        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }

        self.hub()
            .synthesize_transition(TransferState::Paused, TransferState::None);
        Ok(())
    }

    fn ensure_exclusive_operation(&self) -> Result<OperationGuard<'_>, DownloadError> {
        if self.ongoing.swap(true, Ordering::SeqCst) {
            return Err(DownloadError::AnotherOperationOngoing);
        }
        Ok(OperationGuard { downloader: self })
    }

    fn apply_device_advisory(
        &self,
        manufacturer: &str,
        model: &str,
        settings: ConnectionSettings,
    ) -> ConnectionSettings {
        match failsafe_settings_if_device_is_problematic(manufacturer, model, settings) {
            Some(fail_safe) => {
                self.hub().log_advertisement(
                    LogLevel::Warning,
                    &format!(
                        "Host device '{} {}' is known to be problematic, using fail-safe connection settings",
                        manufacturer, model
                    ),
                );
                fail_safe
            }
            None => settings,
        }
    }

    fn translate_verdict(&self, verdict: TransferVerdict) -> Result<(), DownloadError> {
        match verdict {
            TransferVerdict::Success => Ok(()),
            TransferVerdict::FailedInvalidData => Err(DownloadError::InvalidSettings(
                "native layer rejected the download parameters".to_string(),
            )),
            TransferVerdict::FailedInvalidSettings => Err(DownloadError::InvalidSettings(
                "native layer rejected the connection settings".to_string(),
            )),
            TransferVerdict::FailedAlreadyInProgress => {
                Err(DownloadError::AnotherOperationOngoing)
            }
            TransferVerdict::FailedErrorUponCommencing => Err(DownloadError::Internal(
                "native layer failed to commence the download".to_string(),
            )),
        }
    }

    fn cancellation_reason(&self) -> String {
        self.cancellation_reason
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn abort_cancellation_watchdog(&self) {
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for FileDownloader {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// Tests
// ============================================================================
