// Firmware installation orchestration.
//
// Installation reuses the retry loop shape of the file transfer components
// but with its own vocabulary: a wider state machine (validate, upload, test,
// reset, confirm), an overall-progress model that maps each state to a
// milestone percentage and threads the upload progress through the 10%-50%
// band, and a failure taxonomy where only uploading-stage errors are worth
// retrying. Unlike the transfer hub, derived events fire BEFORE the raw
// StateChanged here: subscribers unwire themselves on StateChanged, so
// anything derived from the same transition has to reach them first.

use crate::completion::{Completion, CompletionOutcome};
use crate::events::{EventHub, GlobalErrorCode, LogLevel, SubscriptionId};
use crate::settings::{
    failsafe_settings_if_connection_proves_unstable, failsafe_settings_if_device_is_problematic,
    ConnectionSettings,
};
use crate::uploader::DEFAULT_GRACEFUL_CANCELLATION_TIMEOUT;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const SUSPICIOUS_PROGRESS_EVENT_THRESHOLD: u32 = 10;

// ============================================================================
// Vocabulary
// ============================================================================

/// Installation lifecycle states. The discriminants are load-bearing: host
/// apps persist and compare them across platform layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum InstallationState {
    None = 0,
    Idle = 1,
    Validating = 2,
    Uploading = 3,
    Paused = 4,
    Testing = 5,
    Confirming = 6,
    Resetting = 7,
    Complete = 8,
    Cancelled = 9,
    Error = 10,
    Cancelling = 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum InstallationVerdict {
    Success = 0,
    FailedGivenFirmwareUnhealthy = 1,
    FailedInvalidSettings = 3,
    FailedInstallationInitializationErroredOut = 5,
    FailedAlreadyInProgress = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum InstallerFatalErrorType {
    Generic = 0,
    InstallationAlreadyInProgress = 1,
    InvalidSettings = 2,
    GivenFirmwareDataUnhealthy = 3,
    InstallationInitializationFailed = 4,
    ExtendedDataIntegrityChecksFailed = 5,
    UploadingErroredOut = 6,
    PostInstallationHealthcheckFailed = 7,
    PostInstallationRebootFailed = 8,
    ImageSwapTimeout = 9,
    ConfirmationFailed = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum FirmwareInstallationMode {
    /// Upload and mark the image for a one-shot test boot; the device falls
    /// back to the old image on the next reset.
    TestOnly = 0,
    /// Upload and confirm immediately without a test boot.
    ConfirmOnly = 1,
    TestAndConfirm = 2,
}

/// Fired when the target turns out to already hold the exact firmware being
/// installed, detected through a suspiciously progress-free run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CachedFirmwareKind {
    CachedButInactive,
    CachedAndActive,
}

#[derive(Debug, Clone)]
pub enum InstallationEvent {
    StateChanged {
        old_state: InstallationState,
        new_state: InstallationState,
    },
    BusyStateChanged {
        busy: bool,
    },
    /// Progress of the uploading stage specifically.
    UploadProgressChanged {
        progress_percentage: u8,
        average_throughput_kbps: f32,
    },
    /// Progress of the installation as a whole, derived from state
    /// milestones plus the upload band.
    OverallProgressChanged {
        progress_percentage: i32,
    },
    IdenticalFirmwareCachedOnTargetDeviceDetected {
        kind: CachedFirmwareKind,
    },
    LogEmitted {
        level: LogLevel,
        message: String,
        category: String,
    },
    FatalErrorOccurred {
        state: InstallationState,
        fatal_error_type: InstallerFatalErrorType,
        error_message: String,
        error_code: GlobalErrorCode,
    },
    Cancelled,
}

// ============================================================================
// Installation hub
// ============================================================================

fn progress_milestone_for_state(state: InstallationState) -> Option<i32> {
    match state {
        InstallationState::None => Some(0),
        InstallationState::Idle => Some(1),
        InstallationState::Validating => Some(2),
        InstallationState::Uploading => Some(10),
        InstallationState::Testing => Some(50),
        InstallationState::Resetting => Some(70),
        InstallationState::Confirming => Some(80),
        InstallationState::Complete => Some(100),
        _ => None,
    }
}

const UPLOADING_BAND_START: i32 = 10;

/// Event facade for the installer. Tracks the installation state itself so
/// native proxies only ever push the new state in.
pub struct InstallationHub {
    hub: EventHub<InstallationEvent>,
    state: Mutex<InstallationState>,
    overall_progress: Mutex<i32>,
    upload_progress_events: AtomicU32,
}

impl InstallationHub {
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
            state: Mutex::new(InstallationState::None),
            overall_progress: Mutex::new(0),
            upload_progress_events: AtomicU32::new(0),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&InstallationEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> InstallationState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(InstallationState::None)
    }

    pub fn state_changed_advertisement(&self, new_state: InstallationState) {
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
        self.drive_transition(old_state, new_state);
    }

    /// Force a transition pair without the native layer's involvement, e.g.
    /// the error pair on a timed-out attempt.
    pub fn synthesize_transition(&self, old_state: InstallationState, new_state: InstallationState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
        self.drive_transition(old_state, new_state);
    }

    fn drive_transition(&self, old_state: InstallationState, new_state: InstallationState) {
        if let Some(milestone) = progress_milestone_for_state(new_state) {
            self.set_overall_progress(milestone);
        }

        match new_state {
            InstallationState::Idle => {
                // vital for retries: every attempt starts counting afresh
                self.upload_progress_events.store(0, Ordering::Relaxed);
            }
            InstallationState::Testing
                if self.upload_progress_events.load(Ordering::Relaxed) <= 1 =>
            {
                self.hub
                    .emit(&InstallationEvent::IdenticalFirmwareCachedOnTargetDeviceDetected {
                        kind: CachedFirmwareKind::CachedButInactive,
                    });
            }
            InstallationState::Complete
                if self.upload_progress_events.load(Ordering::Relaxed) <= 1 =>
            {
                self.hub
                    .emit(&InstallationEvent::IdenticalFirmwareCachedOnTargetDeviceDetected {
                        kind: CachedFirmwareKind::CachedAndActive,
                    });
            }
            _ => {}
        }

        // StateChanged must go dead last: callers unwire their handlers on it
        self.hub.emit(&InstallationEvent::StateChanged {
            old_state,
            new_state,
        });
    }

    pub fn upload_progress_advertisement(&self, progress_percentage: u8, throughput_kbps: f32) {
        self.upload_progress_events.fetch_add(1, Ordering::Relaxed);
        self.hub.emit(&InstallationEvent::UploadProgressChanged {
            progress_percentage,
            average_throughput_kbps: throughput_kbps,
        });

        // the uploading stage owns the 10%-50% band of the overall progress
        self.set_overall_progress(
            UPLOADING_BAND_START + (f32::from(progress_percentage) * 0.4) as i32,
        );
    }

    fn set_overall_progress(&self, value: i32) {
        let mut current = match self.overall_progress.lock() {
            Ok(current) => current,
            Err(_) => return,
        };
        // fend off out-of-order updates except for the initial 1% value
        if value >= 1 && *current >= value {
            return;
        }
        *current = value;
        drop(current);
        self.hub.emit(&InstallationEvent::OverallProgressChanged {
            progress_percentage: value,
        });
    }

    pub fn busy_state_changed_advertisement(&self, busy: bool) {
        self.hub.emit(&InstallationEvent::BusyStateChanged { busy });
    }

    pub fn cancelled_advertisement(&self) {
        self.hub.emit(&InstallationEvent::Cancelled);
    }

    pub fn fatal_error_advertisement(
        &self,
        state: InstallationState,
        fatal_error_type: InstallerFatalErrorType,
        error_message: &str,
        error_code: GlobalErrorCode,
    ) {
        tlog!(
            "[installer] Fatal error in state {:?} ({:?}, {:?}): {}",
            state,
            fatal_error_type,
            error_code,
            error_message
        );
        self.hub.emit(&InstallationEvent::FatalErrorOccurred {
            state,
            fatal_error_type,
            error_message: error_message.to_string(),
            error_code,
        });
    }

    pub fn log_advertisement(&self, level: LogLevel, message: &str) {
        tlog!("[installer] [{}] {}", level, message);
        self.hub.emit(&InstallationEvent::LogEmitted {
            level,
            message: message.to_string(),
            category: "installer".to_string(),
        });
    }
}

impl Default for InstallationHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Native proxy seam
// ============================================================================

/// Per-attempt parameters handed down to the native installation layer.
#[derive(Debug, Clone, Copy)]
pub struct InstallationParameters<'a> {
    pub firmware_data: &'a [u8],
    pub mode: FirmwareInstallationMode,
    pub erase_settings: Option<bool>,
    pub estimated_swap_time: Option<Duration>,
    pub settings: ConnectionSettings,
}

#[async_trait]
pub trait NativeFirmwareInstallerProxy: Send + Sync {
    fn bind(&self, hub: Arc<InstallationHub>);

    async fn begin_installation(&self, parameters: InstallationParameters<'_>)
        -> InstallationVerdict;

    fn try_pause(&self);
    fn try_resume(&self);
    fn try_cancel(&self);
    fn disconnect(&self);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("installer has been disposed")]
    Disposed,
    #[error("another operation is already ongoing on this installer")]
    AnotherOperationOngoing,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("the given firmware data are unhealthy: {0}")]
    UnhealthyFirmware(String),
    #[error("unauthorized to install firmware: {0}")]
    Unauthorized(String),
    #[error("device did not complete the image swap within the estimated time ({estimated_swap_time:?})")]
    ImageSwapTimedOut {
        estimated_swap_time: Option<Duration>,
    },
    #[error("installation timed out after {0:?}")]
    Timeout(Duration),
    #[error("installation was cancelled")]
    Cancelled,
    #[error("all {tries} attempt(s) to install the firmware failed")]
    AllAttemptsFailed {
        tries: u32,
        #[source]
        cause: Box<InstallError>,
    },
    #[error("installation errored out in state {state:?}: {message}")]
    ErroredOut {
        state: InstallationState,
        message: String,
    },
    #[error("internal installer error: {0}")]
    Internal(String),
}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub firmware_data: Vec<u8>,
    pub host_device_manufacturer: String,
    pub host_device_model: String,
    pub mode: FirmwareInstallationMode,
    pub erase_settings: Option<bool>,
    pub estimated_swap_time: Option<Duration>,
    pub settings: ConnectionSettings,
    pub timeout: Option<Duration>,
    pub max_tries: u32,
    pub sleep_between_retries: Duration,
    pub graceful_cancellation_timeout: Duration,
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            firmware_data: Vec::new(),
            host_device_manufacturer: String::new(),
            host_device_model: String::new(),
            mode: FirmwareInstallationMode::TestAndConfirm,
            erase_settings: None,
            estimated_swap_time: None,
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
    Completed,
    Cancelled,
    /// Transfer died during the uploading stage. The only retryable failure.
    UploadingStageErroredOut { message: String },
    Terminal(InstallError),
}

struct AttemptGuard {
    hub: Arc<InstallationHub>,
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
    installer: &'a FirmwareInstaller,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.installer.abort_cancellation_watchdog();
        self.installer.ongoing.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// FirmwareInstaller
// ============================================================================

pub struct FirmwareInstaller {
    proxy: Arc<dyn NativeFirmwareInstallerProxy>,
    hub: Arc<InstallationHub>,
    ongoing: AtomicBool,
    disposed: AtomicBool,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
    last_fatal_error_message: Arc<Mutex<String>>,
}

impl FirmwareInstaller {
    pub fn new(proxy: Arc<dyn NativeFirmwareInstallerProxy>) -> Self {
        let hub = Arc::new(InstallationHub::new());
        proxy.bind(hub.clone());

        let last_fatal_error_message = Arc::new(Mutex::new(String::new()));
        let last_fatal = last_fatal_error_message.clone();
        hub.subscribe(move |event| {
            if let InstallationEvent::FatalErrorOccurred { error_message, .. } = event {
                if let Ok(mut message) = last_fatal.lock() {
                    *message = error_message.clone();
                }
            }
        });

        Self {
            proxy,
            hub,
            ongoing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            watchdog: Arc::new(Mutex::new(None)),
            last_fatal_error_message,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&InstallationEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn current_state(&self) -> InstallationState {
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

    /// Install the given firmware image, retrying uploading-stage failures up
    /// to the request's budget. All other failures are terminal.
    pub async fn install(&self, request: InstallRequest) -> Result<(), InstallError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(InstallError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;
        self.install_core(request).await
    }

    /// Fire-and-forget variant; callers observe the outcome through events.
    pub async fn begin_installation(
        &self,
        request: InstallRequest,
    ) -> Result<(), InstallError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(InstallError::Disposed);
        }
        let _guard = self.ensure_exclusive_operation()?;

        Self::validate(&request)?;
        let settings = self.apply_device_advisory(
            &request.host_device_manufacturer,
            &request.host_device_model,
            request.settings,
        );
        self.translate_verdict(
            self.proxy
                .begin_installation(InstallationParameters {
                    firmware_data: &request.firmware_data,
                    mode: request.mode,
                    erase_settings: request.erase_settings,
                    estimated_swap_time: request.estimated_swap_time,
                    settings,
                })
                .await,
        )
    }

    pub fn try_pause(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) || !self.ongoing.load(Ordering::SeqCst) {
            return false;
        }
        self.proxy.try_pause();
        true
    }

    pub fn try_resume(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) || !self.ongoing.load(Ordering::SeqCst) {
            return false;
        }
        self.proxy.try_resume();
        true
    }

    /// Ask the native layer to cancel. The installation ends once the native
    /// side confirms, or once the grace-period watchdog gives up waiting.
    pub fn try_cancel(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.proxy.try_cancel();
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_cancellation_watchdog();
        self.proxy.disconnect();
    }

    // ------------------------------------------------------------------------
    // Core retry loop
    // ------------------------------------------------------------------------

    async fn install_core(&self, request: InstallRequest) -> Result<(), InstallError> {
        Self::validate(&request)?;
        self.abort_cancellation_watchdog();

        let cancellation_requested = Arc::new(AtomicBool::new(false));

        let settings = self.apply_device_advisory(
            &request.host_device_manufacturer,
            &request.host_device_model,
            request.settings,
        );

        let mut tries: u32 = 0;
        let mut suspicious_failures: u32 = 0;
        let mut warned_about_instability = false;

        loop {
            if cancellation_requested.load(Ordering::SeqCst) {
                return Err(InstallError::Cancelled);
            }

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
                            "Connection is too unstable for uploading the firmware, resorting to fail-safe connection settings for the remaining attempts",
                        );
                        warned_about_instability = true;
                    }
                    fail_safe
                }
                None => settings,
            };

            let completion = Arc::new(Completion::<AttemptOutcome>::new());
            let sub_id = self.wire_attempt_handlers(
                &completion,
                &cancellation_requested,
                request.estimated_swap_time,
                request.graceful_cancellation_timeout,
            );
            let _attempt = AttemptGuard {
                hub: self.hub.clone(),
                completion: completion.clone(),
                sub_id,
            };

            self.translate_verdict(
                self.proxy
                    .begin_installation(InstallationParameters {
                        firmware_data: &request.firmware_data,
                        mode: request.mode,
                        erase_settings: request.erase_settings,
                        estimated_swap_time: request.estimated_swap_time,
                        settings: attempt_settings,
                    })
                    .await,
            )?;

            match completion.wait(request.timeout).await {
                CompletionOutcome::Resolved(AttemptOutcome::Completed) => break,
                CompletionOutcome::Resolved(AttemptOutcome::Cancelled) => {
                    return Err(InstallError::Cancelled);
                }
                CompletionOutcome::Resolved(AttemptOutcome::Terminal(error)) => {
                    return Err(error);
                }
                CompletionOutcome::Resolved(AttemptOutcome::UploadingStageErroredOut {
                    message,
                }) => {
                    tries += 1;
                    if self.hub.upload_progress_events.load(Ordering::Relaxed)
                        <= SUSPICIOUS_PROGRESS_EVENT_THRESHOLD
                    {
                        suspicious_failures += 1;
                    }
                    if tries >= request.max_tries {
                        return Err(InstallError::AllAttemptsFailed {
                            tries,
                            cause: Box::new(InstallError::ErroredOut {
                                state: InstallationState::Uploading,
                                message,
                            }),
                        });
                    }

                    self.hub.log_advertisement(
                        LogLevel::Warning,
                        &format!(
                            "Installation attempt {}/{} died during the uploading stage ({}), retrying",
                            tries, request.max_tries, message
                        ),
                    );
                    tokio::time::sleep(request.sleep_between_retries).await;
                }
                CompletionOutcome::TimedOut => {
                    self.hub
                        .synthesize_transition(InstallationState::None, InstallationState::Error);
                    return Err(InstallError::Timeout(request.timeout.unwrap_or_default()));
                }
                CompletionOutcome::Cancelled => {
                    return Err(InstallError::Cancelled);
                }
            }
        }

        if cancellation_requested.load(Ordering::SeqCst) {
            return Err(InstallError::Cancelled);
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn validate(request: &InstallRequest) -> Result<(), InstallError> {
        if request.firmware_data.is_empty() {
            return Err(InstallError::UnhealthyFirmware(
                "the firmware data byte-array is empty".to_string(),
            ));
        }
        if request.max_tries == 0 {
            return Err(InstallError::InvalidSettings(
                "max_tries must be at least 1".to_string(),
            ));
        }
        if request.host_device_manufacturer.trim().is_empty()
            || request.host_device_model.trim().is_empty()
        {
            return Err(InstallError::InvalidSettings(
                "host device manufacturer and model must be given".to_string(),
            ));
        }
        Ok(())
    }

    fn wire_attempt_handlers(
        &self,
        completion: &Arc<Completion<AttemptOutcome>>,
        cancellation_requested: &Arc<AtomicBool>,
        estimated_swap_time: Option<Duration>,
        grace_period: Duration,
    ) -> SubscriptionId {
        let completion = completion.clone();
        let cancellation_requested = cancellation_requested.clone();
        let hub = self.hub.clone();
        let watchdog = self.watchdog.clone();

        self.hub.subscribe(move |event| match event {
            InstallationEvent::StateChanged {
                new_state: InstallationState::Complete,
                ..
            } => {
                completion.try_resolve(AttemptOutcome::Completed);
            }
            InstallationEvent::StateChanged {
                new_state: InstallationState::Cancelling,
                ..
            } => {
                if cancellation_requested.swap(true, Ordering::SeqCst) {
                    return;
                }
                let mut slot = match watchdog.lock() {
                    Ok(slot) => slot,
                    Err(_) => return,
                };
                if slot.is_some() {
                    return;
                }
                let hub = hub.clone();
                *slot = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    tlog!("[installer] Grace period expired, force-declaring the installation cancelled");
                    hub.state_changed_advertisement(InstallationState::Cancelled);
                    hub.cancelled_advertisement();
                }));
            }
            InstallationEvent::Cancelled => {
                if let Ok(mut slot) = watchdog.lock() {
                    if let Some(handle) = slot.take() {
                        handle.abort();
                    }
                }
                completion.try_resolve(AttemptOutcome::Cancelled);
            }
            InstallationEvent::FatalErrorOccurred {
                state,
                fatal_error_type,
                error_message,
                error_code,
            } => {
                completion.try_resolve(Self::classify_fatal_error(
                    *state,
                    *fatal_error_type,
                    error_message,
                    *error_code,
                    estimated_swap_time,
                ));
            }
            _ => {}
        })
    }

    fn classify_fatal_error(
        state: InstallationState,
        fatal_error_type: InstallerFatalErrorType,
        message: &str,
        code: GlobalErrorCode,
        estimated_swap_time: Option<Duration>,
    ) -> AttemptOutcome {
        if code == GlobalErrorCode::AccessDenied {
            return AttemptOutcome::Terminal(InstallError::Unauthorized(message.to_string()));
        }
        match fatal_error_type {
            InstallerFatalErrorType::InstallationAlreadyInProgress => {
                AttemptOutcome::Terminal(InstallError::AnotherOperationOngoing)
            }
            InstallerFatalErrorType::GivenFirmwareDataUnhealthy
            | InstallerFatalErrorType::ExtendedDataIntegrityChecksFailed => {
                AttemptOutcome::Terminal(InstallError::UnhealthyFirmware(message.to_string()))
            }
            InstallerFatalErrorType::ImageSwapTimeout => {
                AttemptOutcome::Terminal(InstallError::ImageSwapTimedOut {
                    estimated_swap_time,
                })
            }
            InstallerFatalErrorType::UploadingErroredOut => {
                AttemptOutcome::UploadingStageErroredOut {
                    message: message.to_string(),
                }
            }
            _ if state == InstallationState::Uploading => {
                AttemptOutcome::UploadingStageErroredOut {
                    message: message.to_string(),
                }
            }
            _ => AttemptOutcome::Terminal(InstallError::ErroredOut {
                state,
                message: message.to_string(),
            }),
        }
    }

    fn ensure_exclusive_operation(&self) -> Result<OperationGuard<'_>, InstallError> {
        if self.ongoing.swap(true, Ordering::SeqCst) {
            return Err(InstallError::AnotherOperationOngoing);
        }
        Ok(OperationGuard { installer: self })
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

    fn translate_verdict(&self, verdict: InstallationVerdict) -> Result<(), InstallError> {
        match verdict {
            InstallationVerdict::Success => Ok(()),
            InstallationVerdict::FailedGivenFirmwareUnhealthy => Err(
                InstallError::UnhealthyFirmware(
                    "native layer rejected the firmware data".to_string(),
                ),
            ),
            InstallationVerdict::FailedInvalidSettings => Err(InstallError::InvalidSettings(
                "native layer rejected the installation parameters".to_string(),
            )),
            InstallationVerdict::FailedInstallationInitializationErroredOut => Err(
                InstallError::Internal("native layer failed to initialize the installation".to_string()),
            ),
            InstallationVerdict::FailedAlreadyInProgress => {
                Err(InstallError::AnotherOperationOngoing)
            }
        }
    }

    fn abort_cancellation_watchdog(&self) {
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for FirmwareInstaller {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Copy)]
    enum Script {
        CompleteHappily,
        CompleteWithoutUploading,
        FailDuringUpload,
        FailUnhealthy,
        FailImageSwapTimeout,
        AdvertiseCancellingOnly,
    }

    struct MockProxy {
        hub: Mutex<Option<Arc<InstallationHub>>>,
        script: Mutex<VecDeque<Script>>,
        begin_settings: Mutex<Vec<ConnectionSettings>>,
    }

    impl MockProxy {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                hub: Mutex::new(None),
                script: Mutex::new(script.into_iter().collect()),
                begin_settings: Mutex::new(Vec::new()),
            })
        }

        fn hub(&self) -> Arc<InstallationHub> {
            self.hub.lock().unwrap().clone().unwrap()
        }

        fn begin_count(&self) -> usize {
            self.begin_settings.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NativeFirmwareInstallerProxy for MockProxy {
        fn bind(&self, hub: Arc<InstallationHub>) {
            *self.hub.lock().unwrap() = Some(hub);
        }

        async fn begin_installation(
            &self,
            parameters: InstallationParameters<'_>,
        ) -> InstallationVerdict {
            self.begin_settings.lock().unwrap().push(parameters.settings);
            let step = self.script.lock().unwrap().pop_front();
            let hub = self.hub();
            match step {
                Some(Script::CompleteHappily) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Validating);
                    hub.state_changed_advertisement(InstallationState::Uploading);
                    hub.upload_progress_advertisement(25, 9.1);
                    hub.upload_progress_advertisement(75, 9.3);
                    hub.upload_progress_advertisement(100, 9.2);
                    hub.state_changed_advertisement(InstallationState::Testing);
                    hub.state_changed_advertisement(InstallationState::Resetting);
                    hub.state_changed_advertisement(InstallationState::Confirming);
                    hub.state_changed_advertisement(InstallationState::Complete);
                }
                Some(Script::CompleteWithoutUploading) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Validating);
                    hub.state_changed_advertisement(InstallationState::Uploading);
                    hub.state_changed_advertisement(InstallationState::Testing);
                    hub.state_changed_advertisement(InstallationState::Complete);
                }
                Some(Script::FailDuringUpload) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Uploading);
                    hub.upload_progress_advertisement(10, 3.0);
                    hub.state_changed_advertisement(InstallationState::Error);
                    hub.fatal_error_advertisement(
                        InstallationState::Uploading,
                        InstallerFatalErrorType::UploadingErroredOut,
                        "ble link dropped mid-upload",
                        GlobalErrorCode::Generic,
                    );
                }
                Some(Script::FailUnhealthy) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Validating);
                    hub.state_changed_advertisement(InstallationState::Error);
                    hub.fatal_error_advertisement(
                        InstallationState::Validating,
                        InstallerFatalErrorType::GivenFirmwareDataUnhealthy,
                        "image hash mismatch",
                        GlobalErrorCode::Generic,
                    );
                }
                Some(Script::FailImageSwapTimeout) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Confirming);
                    hub.fatal_error_advertisement(
                        InstallationState::Confirming,
                        InstallerFatalErrorType::ImageSwapTimeout,
                        "device never swapped images",
                        GlobalErrorCode::Generic,
                    );
                }
                Some(Script::AdvertiseCancellingOnly) => {
                    hub.state_changed_advertisement(InstallationState::Idle);
                    hub.state_changed_advertisement(InstallationState::Uploading);
                    hub.state_changed_advertisement(InstallationState::Cancelling);
                }
                None => {}
            }
            InstallationVerdict::Success
        }

        fn try_pause(&self) {}
        fn try_resume(&self) {}
        fn try_cancel(&self) {}
        fn disconnect(&self) {}
    }

    fn request() -> InstallRequest {
        InstallRequest {
            firmware_data: vec![0xAB; 64],
            host_device_manufacturer: "acme".to_string(),
            host_device_model: "widget-9".to_string(),
            sleep_between_retries: Duration::from_millis(10),
            ..InstallRequest::default()
        }
    }

    #[test]
    fn test_numeric_stability_of_installation_vocabulary() {
        assert_eq!(InstallationState::None as i32, 0);
        assert_eq!(InstallationState::Paused as i32, 4);
        assert_eq!(InstallationState::Confirming as i32, 6);
        assert_eq!(InstallationState::Error as i32, 10);
        assert_eq!(InstallationState::Cancelling as i32, 11);

        assert_eq!(InstallationVerdict::Success as i32, 0);
        assert_eq!(InstallationVerdict::FailedGivenFirmwareUnhealthy as i32, 1);
        assert_eq!(InstallationVerdict::FailedInvalidSettings as i32, 3);
        assert_eq!(
            InstallationVerdict::FailedInstallationInitializationErroredOut as i32,
            5
        );
        assert_eq!(InstallationVerdict::FailedAlreadyInProgress as i32, 9);

        assert_eq!(InstallerFatalErrorType::Generic as i32, 0);
        assert_eq!(InstallerFatalErrorType::UploadingErroredOut as i32, 6);
        assert_eq!(InstallerFatalErrorType::ImageSwapTimeout as i32, 9);
        assert_eq!(InstallerFatalErrorType::ConfirmationFailed as i32, 10);

        assert_eq!(FirmwareInstallationMode::TestOnly as i32, 0);
        assert_eq!(FirmwareInstallationMode::ConfirmOnly as i32, 1);
        assert_eq!(FirmwareInstallationMode::TestAndConfirm as i32, 2);
    }

    #[tokio::test]
    async fn test_happy_path_reaches_complete_with_monotonic_overall_progress() {
        let proxy = MockProxy::new(vec![Script::CompleteHappily]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let overall = Arc::new(Mutex::new(Vec::<i32>::new()));
        let cached_detections = Arc::new(AtomicU32::new(0));
        let overall_log = overall.clone();
        let detections = cached_detections.clone();
        installer.subscribe(move |event| match event {
            InstallationEvent::OverallProgressChanged {
                progress_percentage,
            } => overall_log.lock().unwrap().push(*progress_percentage),
            InstallationEvent::IdenticalFirmwareCachedOnTargetDeviceDetected { .. } => {
                detections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        });

        installer.install(request()).await.unwrap();

        assert_eq!(installer.current_state(), InstallationState::Complete);
        let overall = overall.lock().unwrap().clone();
        assert!(overall.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(overall.last(), Some(&100));
        assert!(overall.contains(&50));
        assert_eq!(cached_detections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_progress_free_run_detects_cached_firmware() {
        let proxy = MockProxy::new(vec![Script::CompleteWithoutUploading]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let detections = Arc::new(Mutex::new(Vec::<CachedFirmwareKind>::new()));
        let detections_log = detections.clone();
        installer.subscribe(move |event| {
            if let InstallationEvent::IdenticalFirmwareCachedOnTargetDeviceDetected { kind } =
                event
            {
                detections_log.lock().unwrap().push(*kind);
            }
        });

        installer.install(request()).await.unwrap();

        assert_eq!(
            *detections.lock().unwrap(),
            [
                CachedFirmwareKind::CachedButInactive,
                CachedFirmwareKind::CachedAndActive
            ]
        );
    }

    #[tokio::test]
    async fn test_uploading_stage_failure_is_retried() {
        let proxy = MockProxy::new(vec![Script::FailDuringUpload, Script::CompleteHappily]);
        let installer = FirmwareInstaller::new(proxy.clone());

        installer.install(request()).await.unwrap();
        assert_eq!(proxy.begin_count(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_firmware_is_terminal() {
        let proxy = MockProxy::new(vec![Script::FailUnhealthy]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let error = installer.install(request()).await.unwrap_err();
        assert!(matches!(error, InstallError::UnhealthyFirmware(_)));
        assert_eq!(proxy.begin_count(), 1);
        assert_eq!(installer.last_fatal_error_message(), "image hash mismatch");
    }

    #[tokio::test]
    async fn test_image_swap_timeout_is_terminal() {
        let proxy = MockProxy::new(vec![Script::FailImageSwapTimeout]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let mut req = request();
        req.estimated_swap_time = Some(Duration::from_secs(30));
        let error = installer.install(req).await.unwrap_err();
        assert!(matches!(
            error,
            InstallError::ImageSwapTimedOut {
                estimated_swap_time: Some(_)
            }
        ));
        assert_eq!(proxy.begin_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let proxy = MockProxy::new(vec![
            Script::FailDuringUpload,
            Script::FailDuringUpload,
            Script::FailDuringUpload,
        ]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let mut req = request();
        req.max_tries = 3;
        let error = installer.install(req).await.unwrap_err();
        match error {
            InstallError::AllAttemptsFailed { tries, cause } => {
                assert_eq!(tries, 3);
                // The exhaustion error must wrap the last attempt's failure
                assert!(matches!(
                    *cause,
                    InstallError::ErroredOut {
                        state: InstallationState::Uploading,
                        ..
                    }
                ));
            }
            other => panic!("expected AllAttemptsFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_problematic_device_advisory_warns_once_across_retries() {
        let proxy = MockProxy::new(vec![Script::FailDuringUpload, Script::CompleteHappily]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let advisory_warnings = Arc::new(AtomicU32::new(0));
        let counter = advisory_warnings.clone();
        installer.subscribe(move |event| {
            if let InstallationEvent::LogEmitted { level, message, .. } = event {
                if *level == LogLevel::Warning && message.contains("known to be problematic") {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        let mut req = request();
        req.host_device_manufacturer = "Apple".to_string();
        req.host_device_model = "iPad6,11".to_string();
        installer.install(req).await.unwrap();

        assert_eq!(proxy.begin_count(), 2);
        assert_eq!(advisory_warnings.load(Ordering::Relaxed), 1);
        let settings = proxy.begin_settings.lock().unwrap().clone();
        assert!(settings
            .iter()
            .all(|s| *s == ConnectionSettings::fail_safe()));
    }

    #[tokio::test]
    async fn test_failsafe_escalation_after_repeated_early_failures() {
        let proxy = MockProxy::new(vec![
            Script::FailDuringUpload,
            Script::FailDuringUpload,
            Script::FailDuringUpload,
            Script::CompleteHappily,
        ]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let mut req = request();
        req.max_tries = 5;
        installer.install(req).await.unwrap();

        let settings = proxy.begin_settings.lock().unwrap().clone();
        assert_eq!(settings[0], ConnectionSettings::default());
        assert_eq!(settings[3], ConnectionSettings::fail_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_cancellation_after_grace_period() {
        let proxy = MockProxy::new(vec![Script::AdvertiseCancellingOnly]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let mut req = request();
        req.graceful_cancellation_timeout = Duration::from_millis(2_500);
        let install = installer.install(req);
        tokio::pin!(install);

        // the watchdog is parked on its grace-period sleep at this point
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::select! {
            biased;
            _ = &mut install => panic!("installation should still be pending"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }

        let error = install.await.unwrap_err();
        assert!(matches!(error, InstallError::Cancelled));
        assert_eq!(installer.current_state(), InstallationState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_synthetic_error_state() {
        let proxy = MockProxy::new(vec![]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let saw_error_state = Arc::new(AtomicBool::new(false));
        let saw = saw_error_state.clone();
        installer.subscribe(move |event| {
            if matches!(
                event,
                InstallationEvent::StateChanged {
                    old_state: InstallationState::None,
                    new_state: InstallationState::Error,
                }
            ) {
                saw.store(true, Ordering::SeqCst);
            }
        });

        let mut req = request();
        req.timeout = Some(Duration::from_secs(5));
        let error = installer.install(req).await.unwrap_err();
        assert!(matches!(error, InstallError::Timeout(_)));
        assert!(saw_error_state.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_exclusive_operation() {
        let proxy = MockProxy::new(vec![Script::CompleteHappily, Script::CompleteHappily]);
        let installer = Arc::new(FirmwareInstaller::new(proxy.clone()));

        installer.ongoing.store(true, Ordering::SeqCst);
        let error = installer.install(request()).await.unwrap_err();
        assert!(matches!(error, InstallError::AnotherOperationOngoing));
        installer.ongoing.store(false, Ordering::SeqCst);

        installer.install(request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let proxy = MockProxy::new(vec![]);
        let installer = FirmwareInstaller::new(proxy.clone());

        let mut req = request();
        req.firmware_data = Vec::new();
        assert!(matches!(
            installer.install(req).await.unwrap_err(),
            InstallError::UnhealthyFirmware(_)
        ));

        let mut req = request();
        req.max_tries = 0;
        assert!(matches!(
            installer.install(req).await.unwrap_err(),
            InstallError::InvalidSettings(_)
        ));

        let mut req = request();
        req.host_device_model = "   ".to_string();
        assert!(matches!(
            installer.install(req).await.unwrap_err(),
            InstallError::InvalidSettings(_)
        ));
        assert_eq!(proxy.begin_count(), 0);
    }
}
