// File upload orchestration.
//
// Drives a native single-flight transfer layer to completion over a flaky
// link: each `upload` call validates its arguments, takes the uploader's
// exclusive-operation slot, then loops attempts. Every attempt wires a
// transient listener set into the event hub, kicks the native layer off and
// awaits a fresh completion source with an optional fossilizing timeout.
// Transient failures burn retry budget (with escalating fail-safe connection
// settings once the link proves unstable); terminal failures and
// cancellation short-circuit. Cancellation is graceful-then-forceful: the
// native layer gets a grace period to confirm, after which a watchdog
// declares the transfer cancelled on its behalf.

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
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_GRACEFUL_CANCELLATION_TIMEOUT: Duration = Duration::from_millis(2_500);

/// An attempt that dies having seen at most this many progress events is
/// counted as a suspicious transport failure rather than a legitimate one.
const SUSPICIOUS_PROGRESS_EVENT_THRESHOLD: u32 = 10;

// ============================================================================
// Native proxy seam
// ============================================================================

/// The platform transfer layer behind the uploader. `begin_upload` must
/// return its verdict before any transfer callback fires; all further
/// outcomes are advertised through the bound hub.
#[async_trait]
pub trait NativeFileUploaderProxy: Send + Sync {
    fn bind(&self, hub: Arc<TransferHub>);

    async fn begin_upload(
        &self,
        settings: ConnectionSettings,
        remote_file_path: &str,
        data: &[u8],
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
pub enum UploadError {
    #[error("uploader has been disposed")]
    Disposed,
    #[error("another operation is already ongoing on this uploader")]
    AnotherOperationOngoing,
    #[error(transparent)]
    InvalidRemotePath(#[from] PathError),
    #[error("given data are empty or invalid")]
    InvalidData,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
    #[error("upload was cancelled ({reason})")]
    Cancelled { reason: String },
    #[error("remote folder for '{path}' not found on the device: {message}")]
    RemoteFolderNotFound { path: String, message: String },
    #[error("upload errored out in state {state:?} ({code:?}): {message}")]
    ErroredOut {
        state: TransferState,
        code: GlobalErrorCode,
        message: String,
    },
    #[error("all {tries} attempt(s) to upload '{path}' failed")]
    AllAttemptsFailed {
        path: String,
        tries: u32,
        #[source]
        cause: Box<UploadError>,
    },
    #[error("internal uploader error: {0}")]
    Internal(String),
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub remote_file_path: String,
    pub data: Vec<u8>,
    pub host_device_manufacturer: String,
    pub host_device_model: String,
    pub settings: ConnectionSettings,
    /// Per-attempt deadline. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub max_tries: u32,
    pub sleep_between_retries: Duration,
    pub graceful_cancellation_timeout: Duration,
}

impl Default for UploadRequest {
    fn default() -> Self {
        Self {
            remote_file_path: String::new(),
            data: Vec::new(),
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

#[derive(Debug, Clone)]
pub struct MultiUploadRequest {
    pub entries: Vec<(String, Vec<u8>)>,
    pub host_device_manufacturer: String,
    pub host_device_model: String,
    pub settings: ConnectionSettings,
    pub timeout_per_upload: Option<Duration>,
    pub max_tries_per_upload: u32,
    pub sleep_between_retries: Duration,
    pub sleep_between_uploads: Duration,
    /// Record exhausted uploads and keep going instead of aborting the batch.
    pub move_to_next_upload_in_case_of_error: bool,
    pub graceful_cancellation_timeout: Duration,
}

impl Default for MultiUploadRequest {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            host_device_manufacturer: String::new(),
            host_device_model: String::new(),
            settings: ConnectionSettings::default(),
            timeout_per_upload: None,
            max_tries_per_upload: 10,
            sleep_between_retries: Duration::from_millis(100),
            sleep_between_uploads: Duration::from_millis(100),
            move_to_next_upload_in_case_of_error: true,
            graceful_cancellation_timeout: DEFAULT_GRACEFUL_CANCELLATION_TIMEOUT,
        }
    }
}

// ============================================================================
// Attempt plumbing
// ============================================================================

#[derive(Debug)]
enum AttemptOutcome {
    Completed,
    FatalError {
        state: TransferState,
        message: String,
        code: GlobalErrorCode,
    },
    Cancelled {
        reason: String,
    },
}

/// Unwires the attempt's transient listener and fossilizes its completion
/// source on every exit path of a loop iteration.
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

/// Releases the exclusive-operation slot when the operation unwinds.
struct OperationGuard<'a> {
    uploader: &'a FileUploader,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.uploader.abort_cancellation_watchdog();
        self.uploader.ongoing.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// FileUploader
// ============================================================================

pub struct FileUploader {
    proxy: Arc<dyn NativeFileUploaderProxy>,
    hub: Arc<TransferHub>,
    keep_going: KeepGoing,
    ongoing: AtomicBool,
    disposed: AtomicBool,
    cancellation_requested: Arc<AtomicBool>,
    cancellation_reason: Arc<Mutex<String>>,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
    last_fatal_error_message: Arc<Mutex<String>>,
}

impl FileUploader {
    pub fn new(proxy: Arc<dyn NativeFileUploaderProxy>) -> Self {
        let hub = Arc::new(TransferHub::new("uploader"));
        proxy.bind(hub.clone());

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
            hub,
            keep_going: KeepGoing::new(),
            ongoing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancellation_requested: Arc::new(AtomicBool::new(false)),
            cancellation_reason: Arc::new(Mutex::new(String::new())),
            watchdog: Arc::new(Mutex::new(None)),
            last_fatal_error_message,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> TransferState {
        self.hub.current_state()
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

    /// Upload `data` to `remote_file_path` on the device, retrying transient
    /// failures up to the request's budget.
    pub async fn upload(&self, request: UploadRequest) -> Result<(), UploadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UploadError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;
        self.upload_core(request).await
    }

    /// Upload several files back to back. Duplicate paths collapse to one
    /// entry (last data wins). Returns the paths whose uploads exhausted
    /// their budget when `move_to_next_upload_in_case_of_error` is set.
    pub async fn upload_many(
        &self,
        request: MultiUploadRequest,
    ) -> Result<Vec<String>, UploadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UploadError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;

        let entries = paths::sanitize_and_dedupe_uploads(request.entries.clone())?;
        let total = entries.len();
        let mut failed_paths = Vec::new();

        for (index, (path, data)) in entries.into_iter().enumerate() {
            let single = UploadRequest {
                remote_file_path: path.clone(),
                data,
                host_device_manufacturer: request.host_device_manufacturer.clone(),
                host_device_model: request.host_device_model.clone(),
                settings: request.settings,
                timeout: request.timeout_per_upload,
                max_tries: request.max_tries_per_upload,
                sleep_between_retries: request.sleep_between_retries,
                graceful_cancellation_timeout: request.graceful_cancellation_timeout,
            };

            match self.upload_core(single).await {
                Ok(()) => {}
                Err(
                    error @ (UploadError::AllAttemptsFailed { .. }
                    | UploadError::RemoteFolderNotFound { .. }),
                ) => {
                    if !request.move_to_next_upload_in_case_of_error {
                        return Err(error);
                    }
                    self.hub.log_advertisement(
                        LogLevel::Error,
                        &format!("Upload of '{}' failed, moving on to the next file: {}", path, error),
                    );
                    failed_paths.push(path);
                }
                Err(other) => return Err(other),
            }

            if index + 1 < total && !request.sleep_between_uploads.is_zero() {
                tokio::time::sleep(request.sleep_between_uploads).await;
            }
        }

        Ok(failed_paths)
    }

    /// Fire-and-forget variant: validate, apply the device-based advisory and
    /// commence the upload without awaiting its outcome. Callers observe the
    /// result through the event stream.
    pub async fn begin_upload(
        &self,
        settings: ConnectionSettings,
        host_device_manufacturer: &str,
        host_device_model: &str,
        remote_file_path: &str,
        data: &[u8],
    ) -> Result<(), UploadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UploadError::Disposed);
        }
        paths::validate_remote_file_path(remote_file_path)?;
        let remote_file_path = paths::sanitize_remote_file_path(remote_file_path);
        if data.is_empty() {
            return Err(UploadError::InvalidData);
        }

        let settings = self.apply_device_advisory(
            host_device_manufacturer,
            host_device_model,
            settings,
        );
        self.hub.set_resource(&remote_file_path);

        self.translate_verdict(
            self.proxy
                .begin_upload(settings, &remote_file_path, data)
                .await,
        )
    }

    /// Close the pause gate and ask the native layer to pause. Reports
    /// false when there is nothing to pause.
    pub fn try_pause(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst)
            || self.cancellation_requested.load(Ordering::SeqCst)
            || !self.ongoing.load(Ordering::SeqCst)
        {
            return false;
        }
        self.keep_going.close();
        self.hub.arm_pause_echo_guard();
        self.proxy.try_pause();
        true
    }

    pub fn try_resume(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) || !self.ongoing.load(Ordering::SeqCst) {
            return false;
        }
        self.hub.disarm_pause_echo_guard();
        self.proxy.try_resume();
        self.keep_going.open();
        true
    }

    /// Request cancellation. The gate is opened afterwards so a paused
    /// operation wakes up and observes the request.
    pub fn try_cancel(&self, reason: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.cancellation_requested.store(true, Ordering::SeqCst);
        if let Ok(mut stored) = self.cancellation_reason.lock() {
            *stored = reason.to_string();
        }
        self.hub.disarm_pause_echo_guard();
        self.proxy.try_cancel(reason);
        self.keep_going.open();
    }

    /// Tear the uploader down. Waiters parked on the pause gate are released
    /// so they can observe the disposal.
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

    async fn upload_core(&self, request: UploadRequest) -> Result<(), UploadError> {
        paths::validate_remote_file_path(&request.remote_file_path)?;
        let remote_file_path = paths::sanitize_remote_file_path(&request.remote_file_path);
        if request.data.is_empty() {
            return Err(UploadError::InvalidData);
        }
        if request.max_tries == 0 {
            return Err(UploadError::InvalidSettings(
                "max_tries must be at least 1".to_string(),
            ));
        }
        if request.host_device_manufacturer.trim().is_empty()
            || request.host_device_model.trim().is_empty()
        {
            return Err(UploadError::InvalidSettings(
                "host device manufacturer and model must be given".to_string(),
            ));
        }

        self.cancellation_requested.store(false, Ordering::SeqCst);
        if let Ok(mut reason) = self.cancellation_reason.lock() {
            reason.clear();
        }
        self.abort_cancellation_watchdog();
        self.keep_going.open();
        self.hub.disarm_pause_echo_guard();
        self.hub.set_resource(&remote_file_path);

        let settings = self.apply_device_advisory(
            &request.host_device_manufacturer,
            &request.host_device_model,
            request.settings,
        );

        let mut tries: u32 = 0;
        let mut suspicious_failures: u32 = 0;
        let mut warned_about_instability = false;

        loop {
            self.check_if_paused_or_cancelled().await?;

            let attempt_settings = match failsafe_settings_if_connection_proves_unstable(
                true,
                tries + 1,
                request.max_tries,
                suspicious_failures,
            ) {
                Some(fail_safe) => {
                    if !warned_about_instability {
                        self.hub.log_advertisement(
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
                hub: self.hub.clone(),
                completion: completion.clone(),
                sub_id,
            };

            self.translate_verdict(
                self.proxy
                    .begin_upload(attempt_settings, &remote_file_path, &request.data)
                    .await,
            )?;

            match completion.wait(request.timeout).await {
                CompletionOutcome::Resolved(AttemptOutcome::Completed) => break,
                CompletionOutcome::Resolved(AttemptOutcome::Cancelled { reason }) => {
                    return Err(UploadError::Cancelled { reason });
                }
                CompletionOutcome::Resolved(AttemptOutcome::FatalError {
                    state,
                    message,
                    code,
                }) => {
                    if code == GlobalErrorCode::FilesystemNotFound {
                        return Err(UploadError::RemoteFolderNotFound {
                            path: remote_file_path,
                            message,
                        });
                    }

                    tries += 1;
                    if progress_events.load(Ordering::Relaxed)
                        <= SUSPICIOUS_PROGRESS_EVENT_THRESHOLD
                    {
                        suspicious_failures += 1;
                    }
                    if tries >= request.max_tries {
                        return Err(UploadError::AllAttemptsFailed {
                            path: remote_file_path,
                            tries,
                            cause: Box::new(UploadError::ErroredOut {
                                state,
                                code,
                                message,
                            }),
                        });
                    }

                    self.hub.log_advertisement(
                        LogLevel::Warning,
                        &format!(
                            "Upload attempt {}/{} failed in state {:?} ({:?}: {}), retrying",
                            tries, request.max_tries, state, code, message
                        ),
                    );
                    tokio::time::sleep(request.sleep_between_retries).await;
                }
                CompletionOutcome::TimedOut => {
                    self.hub
                        .synthesize_transition(TransferState::None, TransferState::Error);
                    return Err(UploadError::Timeout(request.timeout.unwrap_or_default()));
                }
                CompletionOutcome::Cancelled => {
                    return Err(UploadError::Cancelled {
                        reason: self.cancellation_reason(),
                    });
                }
            }
        }

        // A cancellation request always wins, even over a racing success.
        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(UploadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }

        Ok(())
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
        let hub = self.hub.clone();
        let watchdog = self.watchdog.clone();
        let cancellation_requested = self.cancellation_requested.clone();
        let cancellation_reason = self.cancellation_reason.clone();

        self.hub.subscribe(move |event| match event {
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
                completion.try_resolve(AttemptOutcome::Completed);
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

                // Grace-period watchdog: if the native layer never confirms,
                // declare the cancellation ourselves.
                let mut slot = match watchdog.lock() {
                    Ok(slot) => slot,
                    Err(_) => return,
                };
                if slot.is_some() {
                    return;
                }
                let hub = hub.clone();
                let reason = reason.clone();
                *slot = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    tlog!("[uploader] Grace period expired, force-declaring the upload cancelled");
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

    /// Park at the pause gate between attempts. With no native transfer
    /// active, the pause has to be made visible by synthesizing the state
    /// pairs the native layer would normally advertise.
    async fn check_if_paused_or_cancelled(&self) -> Result<(), UploadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UploadError::Disposed);
        }
        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(UploadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }
        if !self.keep_going.is_closed() {
            return Ok(());
        }

        self.hub
            .synthesize_transition(TransferState::None, TransferState::Paused);
        self.keep_going.wait_open().await;

        if self.disposed.load(Ordering::SeqCst) {
            return Err(UploadError::Disposed);
        }
        if self.cancellation_requested.load(Ordering::SeqCst) {
            return Err(UploadError::Cancelled {
                reason: self.cancellation_reason(),
            });
        }

        self.hub
            .synthesize_transition(TransferState::Paused, TransferState::None);
        Ok(())
    }

    fn ensure_exclusive_operation(&self) -> Result<OperationGuard<'_>, UploadError> {
        if self.ongoing.swap(true, Ordering::SeqCst) {
            return Err(UploadError::AnotherOperationOngoing);
        }
        Ok(OperationGuard { uploader: self })
    }

    fn apply_device_advisory(
        &self,
        manufacturer: &str,
        model: &str,
        settings: ConnectionSettings,
    ) -> ConnectionSettings {
        match failsafe_settings_if_device_is_problematic(manufacturer, model, settings) {
            Some(fail_safe) => {
                self.hub.log_advertisement(
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

    fn translate_verdict(&self, verdict: TransferVerdict) -> Result<(), UploadError> {
        match verdict {
            TransferVerdict::Success => Ok(()),
            TransferVerdict::FailedInvalidData => Err(UploadError::InvalidData),
            TransferVerdict::FailedInvalidSettings => Err(UploadError::InvalidSettings(
                "native layer rejected the connection settings".to_string(),
            )),
            TransferVerdict::FailedAlreadyInProgress => Err(UploadError::AnotherOperationOngoing),
            TransferVerdict::FailedErrorUponCommencing => Err(UploadError::Internal(
                "native layer failed to commence the upload".to_string(),
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

impl Drop for FileUploader {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// Tests
// ============================================================================
