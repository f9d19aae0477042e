// Event facade shared by all device components.
//
// Native transfer layers report raw callbacks (state changes, progress,
// fatal errors); the hubs in this module normalise those into the public
// event stream: no-op transitions are dropped, spurious post-pause echoes
// are swallowed, and derived events (Started / Paused / Resumed / Completed)
// are synthesised from state transitions. Listener panics are caught and
// logged so one misbehaving subscriber can never starve the rest.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Log levels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Global error codes
// ============================================================================

// SMP v1 puts a flat `rc` in the response; SMP v2 scopes `rc` per management
// group. Both collapse into one numeric space here: v1 codes keep their raw
// value, v2 codes land at (group + 1) * 1000 + rc so e.g. filesystem group 8
// occupies the 9000 block. Unknown raw values map to Generic.
macro_rules! global_error_codes {
    ($($name:ident = $value:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[repr(i32)]
        pub enum GlobalErrorCode {
            $($name = $value),+
        }

        impl GlobalErrorCode {
            pub fn from_raw(raw: i32) -> Self {
                match raw {
                    $($value => GlobalErrorCode::$name,)+
                    _ => GlobalErrorCode::Generic,
                }
            }
        }
    };
}

global_error_codes! {
    Unset = -99,
    Generic = -1,

    // SMP v1 codes
    Ok = 0,
    Unknown = 1,
    NoMemory = 2,
    InValue = 3,
    Timeout = 4,
    NoEntry = 5,
    BadState = 6,
    TooLarge = 7,
    NotSupported = 8,
    Corrupt = 9,
    Busy = 10,
    AccessDenied = 11,
    ProtocolVersionTooOld = 12,
    ProtocolVersionTooNew = 13,
    PerUser = 256,

    // SMP v2 image group (group 1 -> 2000 block)
    ImageUnknown = 2001,
    ImageFlashConfigQueryFail = 2002,
    ImageNoImage = 2003,
    ImageNoTlvs = 2004,
    ImageInvalidTlv = 2005,
    ImageTlvMultipleHashesFound = 2006,
    ImageTlvInvalidSize = 2007,
    ImageHashNotFound = 2008,
    ImageNoFreeSlot = 2009,
    ImageFlashOpenFailed = 2010,
    ImageFlashReadFailed = 2011,
    ImageFlashWriteFailed = 2012,
    ImageFlashEraseFailed = 2013,
    ImageInvalidSlot = 2014,
    ImageNoFreeMemory = 2015,
    ImageFlashContextAlreadySet = 2016,
    ImageFlashContextNotSet = 2017,
    ImageFlashAreaDeviceNull = 2018,
    ImageInvalidPageOffset = 2019,
    ImageInvalidOffset = 2020,
    ImageInvalidLength = 2021,
    ImageInvalidImageHeader = 2022,
    ImageInvalidImageHeaderMagic = 2023,
    ImageInvalidHash = 2024,
    ImageInvalidFlashAddress = 2025,
    ImageVersionGetFailed = 2026,
    ImageCurrentVersionIsNewer = 2027,
    ImageAlreadyPending = 2028,
    ImageInvalidImageVectorTable = 2029,
    ImageInvalidImageTooLarge = 2030,
    ImageInvalidImageDataOverrun = 2031,
    ImageConfirmationDenied = 2032,
    ImageSettingTestToActiveDenied = 2033,

    // SMP v2 filesystem group (group 8 -> 9000 block)
    FilesystemUnknown = 9001,
    FilesystemInvalidName = 9002,
    FilesystemNotFound = 9003,
    FilesystemIsDirectory = 9004,
    FilesystemOpenFailed = 9005,
    FilesystemSeekFailed = 9006,
    FilesystemReadFailed = 9007,
    FilesystemTruncateFailed = 9008,
    FilesystemDeleteFailed = 9009,
    FilesystemWriteFailed = 9010,
    FilesystemOffsetNotValid = 9011,
    FilesystemOffsetLargerThanFile = 9012,
    FilesystemChecksumMismatch = 9013,
    FilesystemMountPointNotFound = 9014,
    FilesystemReadOnlyFilesystem = 9015,
    FilesystemFileEmpty = 9016,
}

impl GlobalErrorCode {
    /// Translate an SMP response error into the unified code space.
    /// `group` is `Some` for SMP v2 responses, `None` for v1.
    pub fn from_smp(group: Option<u16>, rc: i32) -> Self {
        match group {
            Some(g) => Self::from_raw((i32::from(g) + 1) * 1000 + rc),
            None => Self::from_raw(rc),
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl Default for GlobalErrorCode {
    fn default() -> Self {
        GlobalErrorCode::Unset
    }
}

// ============================================================================
// Subscriber registry
// ============================================================================

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out registry for one component's events. Each event reaches every
/// subscriber exactly once; a panicking subscriber is logged and skipped.
pub struct EventHub<E> {
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        if let Ok(mut listeners) = self.listeners.lock() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id.0);
            return listeners.len() < before;
        }
        false
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tlog!("[events] Listener panicked during fan-out: {}", detail);
            }
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Transfer states and events (shared by uploader and downloader)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum TransferState {
    None = 0,
    Idle = 1,
    Transferring = 2,
    Paused = 3,
    Resuming = 4,
    Complete = 5,
    Cancelling = 6,
    Cancelled = 7,
    Error = 8,
}

/// Verdict returned synchronously by a native transfer layer when asked to
/// commence an upload or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum TransferVerdict {
    Success = 0,
    FailedInvalidData = 1,
    FailedInvalidSettings = 2,
    FailedErrorUponCommencing = 3,
    FailedAlreadyInProgress = 4,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged {
        old_state: TransferState,
        new_state: TransferState,
    },
    ProgressChanged {
        progress_percentage: u8,
        average_throughput_kbps: f32,
        current_throughput_kbps: f32,
    },
    BusyStateChanged {
        busy: bool,
    },
    LogEmitted {
        level: LogLevel,
        message: String,
        category: String,
        resource: String,
    },
    FatalErrorOccurred {
        state: TransferState,
        error_message: String,
        error_code: GlobalErrorCode,
    },
    Started,
    Paused,
    Resumed,
    Cancelling {
        reason: String,
    },
    Cancelled {
        reason: String,
    },
    Completed {
        resource: String,
    },
}

/// Event hub for one transfer component. Tracks the current state, applies
/// the transition guards, and synthesises derived events off state changes.
pub struct TransferHub {
    hub: EventHub<TransferEvent>,
    state: Mutex<TransferState>,
    busy: AtomicBool,
    pause_echo_armed: AtomicBool,
    resource: Mutex<String>,
    category: &'static str,
}

impl TransferHub {
    pub fn new(category: &'static str) -> Self {
        Self {
            hub: EventHub::new(),
            state: Mutex::new(TransferState::None),
            busy: AtomicBool::new(false),
            pause_echo_armed: AtomicBool::new(false),
            resource: Mutex::new(String::new()),
            category,
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
        self.state.lock().map(|s| *s).unwrap_or(TransferState::None)
    }

    pub fn set_resource(&self, resource: &str) {
        if let Ok(mut r) = self.resource.lock() {
            *r = resource.to_string();
        }
    }

    fn resource(&self) -> String {
        self.resource.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Arm the post-pause echo guard. Some native layers report a
    /// progress-driven busy state right after acknowledging a pause request;
    /// while armed, a direct Paused -> Transferring transition is swallowed.
    pub fn arm_pause_echo_guard(&self) {
        self.pause_echo_armed.store(true, Ordering::Relaxed);
    }

    pub fn disarm_pause_echo_guard(&self) {
        self.pause_echo_armed.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Advertisement surface (called by the native proxy layer)
    // ------------------------------------------------------------------------

    pub fn state_changed_advertisement(&self, new_state: TransferState) {
        let old_state = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            let old = *state;
            if old == new_state {
                return;
            }
            if new_state == TransferState::Transferring
                && old == TransferState::Paused
                && self.pause_echo_armed.load(Ordering::Relaxed)
            {
                tlog!(
                    "[{}] Swallowing spurious Paused->Transferring echo",
                    self.category
                );
                return;
            }
            *state = new_state;
            old
        };

        // Raw transition first, derived events after.
        self.hub.emit(&TransferEvent::StateChanged {
            old_state,
            new_state,
        });
        self.update_busy_state(new_state);

        match new_state {
            TransferState::None => {
                self.hub.emit(&TransferEvent::ProgressChanged {
                    progress_percentage: 0,
                    average_throughput_kbps: 0.0,
                    current_throughput_kbps: 0.0,
                });
            }
            TransferState::Paused => {
                self.hub.emit(&TransferEvent::Paused);
            }
            TransferState::Transferring => {
                if old_state == TransferState::Resuming {
                    self.disarm_pause_echo_guard();
                    self.hub.emit(&TransferEvent::Resumed);
                } else {
                    if old_state != TransferState::Idle && old_state != TransferState::None {
                        tlog!(
                            "[{}] Fishy transition {:?} -> Transferring, treating as a fresh start",
                            self.category,
                            old_state
                        );
                    }
                    self.hub.emit(&TransferEvent::Started);
                }
            }
            TransferState::Complete => {
                // A transfer that completes while paused or resuming never got
                // its Resumed event; backfill it before Completed.
                if old_state == TransferState::Paused || old_state == TransferState::Resuming {
                    self.disarm_pause_echo_guard();
                    self.hub.emit(&TransferEvent::Resumed);
                }
                self.hub.emit(&TransferEvent::ProgressChanged {
                    progress_percentage: 100,
                    average_throughput_kbps: 0.0,
                    current_throughput_kbps: 0.0,
                });
                self.hub.emit(&TransferEvent::Completed {
                    resource: self.resource(),
                });
            }
            _ => {}
        }
    }

    /// Force a transition pair without the native layer's involvement. Used
    /// when the orchestrator itself has to report a state: synthetic pause
    /// pairs at retry checkpoints and the error pair on a timed-out attempt.
    pub fn synthesize_transition(&self, old_state: TransferState, new_state: TransferState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
        self.hub.emit(&TransferEvent::StateChanged {
            old_state,
            new_state,
        });
        self.update_busy_state(new_state);
        if new_state == TransferState::Paused {
            self.hub.emit(&TransferEvent::Paused);
        } else if old_state == TransferState::Paused && new_state == TransferState::None {
            self.hub.emit(&TransferEvent::Resumed);
        }
    }

    /// Derived busy flag: the component is busy while the native layer works
    /// on its behalf, including a paused or cancelling transfer. Fires only
    /// on an actual flip.
    fn update_busy_state(&self, new_state: TransferState) {
        let busy = matches!(
            new_state,
            TransferState::Transferring
                | TransferState::Paused
                | TransferState::Resuming
                | TransferState::Cancelling
        );
        if self.busy.swap(busy, Ordering::Relaxed) != busy {
            self.hub.emit(&TransferEvent::BusyStateChanged { busy });
        }
    }

    pub fn progress_changed_advertisement(
        &self,
        progress_percentage: u8,
        average_throughput_kbps: f32,
        current_throughput_kbps: f32,
    ) {
        self.hub.emit(&TransferEvent::ProgressChanged {
            progress_percentage,
            average_throughput_kbps,
            current_throughput_kbps,
        });
    }

    pub fn cancelling_advertisement(&self, reason: &str) {
        self.hub.emit(&TransferEvent::Cancelling {
            reason: reason.to_string(),
        });
    }

    pub fn cancelled_advertisement(&self, reason: &str) {
        self.hub.emit(&TransferEvent::Cancelled {
            reason: reason.to_string(),
        });
    }

    pub fn fatal_error_advertisement(
        &self,
        state: TransferState,
        error_message: &str,
        error_code: GlobalErrorCode,
    ) {
        self.hub.emit(&TransferEvent::FatalErrorOccurred {
            state,
            error_message: error_message.to_string(),
            error_code,
        });
    }

    pub fn log_advertisement(&self, level: LogLevel, message: &str) {
        tlog!("[{}] [{}] {}", self.category, level, message);
        self.hub.emit(&TransferEvent::LogEmitted {
            level,
            message: message.to_string(),
            category: self.category.to_string(),
            resource: self.resource(),
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collect_events(hub: &TransferHub) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        hub.subscribe(move |event| {
            let tag = match event {
                TransferEvent::StateChanged {
                    old_state,
                    new_state,
                } => format!("state:{:?}->{:?}", old_state, new_state),
                TransferEvent::ProgressChanged {
                    progress_percentage,
                    ..
                } => format!("progress:{}", progress_percentage),
                TransferEvent::BusyStateChanged { busy } => format!("busy:{}", busy),
                TransferEvent::LogEmitted { level, .. } => format!("log:{}", level),
                TransferEvent::FatalErrorOccurred { .. } => "fatal".to_string(),
                TransferEvent::Started => "started".to_string(),
                TransferEvent::Paused => "paused".to_string(),
                TransferEvent::Resumed => "resumed".to_string(),
                TransferEvent::Cancelling { .. } => "cancelling".to_string(),
                TransferEvent::Cancelled { .. } => "cancelled".to_string(),
                TransferEvent::Completed { .. } => "completed".to_string(),
            };
            seen_clone.lock().unwrap().push(tag);
        });
        seen
    }

    #[test]
    fn test_global_error_code_values_are_stable() {
        assert_eq!(GlobalErrorCode::Unset.as_raw(), -99);
        assert_eq!(GlobalErrorCode::Generic.as_raw(), -1);
        assert_eq!(GlobalErrorCode::AccessDenied.as_raw(), 11);
        assert_eq!(GlobalErrorCode::PerUser.as_raw(), 256);
        assert_eq!(GlobalErrorCode::FilesystemNotFound.as_raw(), 9003);
        assert_eq!(GlobalErrorCode::FilesystemIsDirectory.as_raw(), 9004);
        assert_eq!(GlobalErrorCode::ImageUnknown.as_raw(), 2001);
    }

    #[test]
    fn test_global_error_code_v2_translation() {
        assert_eq!(
            GlobalErrorCode::from_smp(Some(8), 3),
            GlobalErrorCode::FilesystemNotFound
        );
        assert_eq!(
            GlobalErrorCode::from_smp(Some(1), 9),
            GlobalErrorCode::ImageNoFreeSlot
        );
        assert_eq!(
            GlobalErrorCode::from_smp(None, 11),
            GlobalErrorCode::AccessDenied
        );
    }

    #[test]
    fn test_global_error_code_unknown_raw_maps_to_generic() {
        assert_eq!(GlobalErrorCode::from_raw(31337), GlobalErrorCode::Generic);
        assert_eq!(
            GlobalErrorCode::from_smp(Some(42), 999),
            GlobalErrorCode::Generic
        );
    }

    #[test]
    fn test_transfer_state_values_are_stable() {
        assert_eq!(TransferState::None as i32, 0);
        assert_eq!(TransferState::Idle as i32, 1);
        assert_eq!(TransferState::Transferring as i32, 2);
        assert_eq!(TransferState::Paused as i32, 3);
        assert_eq!(TransferState::Resuming as i32, 4);
        assert_eq!(TransferState::Complete as i32, 5);
        assert_eq!(TransferState::Cancelling as i32, 6);
        assert_eq!(TransferState::Cancelled as i32, 7);
        assert_eq!(TransferState::Error as i32, 8);
    }

    #[test]
    fn test_transfer_verdict_values_are_stable() {
        assert_eq!(TransferVerdict::Success as i32, 0);
        assert_eq!(TransferVerdict::FailedInvalidData as i32, 1);
        assert_eq!(TransferVerdict::FailedInvalidSettings as i32, 2);
        assert_eq!(TransferVerdict::FailedErrorUponCommencing as i32, 3);
        assert_eq!(TransferVerdict::FailedAlreadyInProgress as i32, 4);
    }

    #[test]
    fn test_synthetic_pause_pair_carries_derived_events() {
        let hub = TransferHub::new("test");
        let seen = collect_events(&hub);
        hub.synthesize_transition(TransferState::None, TransferState::Paused);
        hub.synthesize_transition(TransferState::Paused, TransferState::None);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            [
                "state:None->Paused",
                "busy:true",
                "paused",
                "state:Paused->None",
                "busy:false",
                "resumed"
            ]
        );
    }

    #[test]
    fn test_hub_fan_out_reaches_all_listeners_once() {
        let hub: EventHub<u32> = EventHub::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let a = count_a.clone();
        let b = count_b.clone();
        hub.subscribe(move |_| {
            a.fetch_add(1, Ordering::Relaxed);
        });
        hub.subscribe(move |_| {
            b.fetch_add(1, Ordering::Relaxed);
        });
        hub.emit(&7);
        assert_eq!(count_a.load(Ordering::Relaxed), 1);
        assert_eq!(count_b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hub_isolates_panicking_listener() {
        let hub: EventHub<u32> = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        hub.subscribe(|_| panic!("listener blew up"));
        let c = count.clone();
        hub.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        hub.emit(&1);
        hub.emit(&2);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hub_unsubscribe_stops_delivery() {
        let hub: EventHub<u32> = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = hub.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        hub.emit(&1);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&2);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_noop_transition_is_suppressed() {
        let hub = TransferHub::new("test");
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Idle);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["state:None->Idle"]);
    }

    #[test]
    fn test_state_changed_fires_before_derived_events() {
        let hub = TransferHub::new("test");
        hub.state_changed_advertisement(TransferState::Idle);
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Transferring);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            ["state:Idle->Transferring", "busy:true", "started"]
        );
    }

    #[test]
    fn test_resumed_derived_from_resuming() {
        let hub = TransferHub::new("test");
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Transferring);
        hub.state_changed_advertisement(TransferState::Paused);
        hub.state_changed_advertisement(TransferState::Resuming);
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Transferring);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            ["state:Resuming->Transferring", "resumed"]
        );
    }

    #[test]
    fn test_pause_echo_is_swallowed_while_armed() {
        let hub = TransferHub::new("test");
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Transferring);
        hub.arm_pause_echo_guard();
        hub.state_changed_advertisement(TransferState::Paused);
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Transferring);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(hub.current_state(), TransferState::Paused);
    }

    #[test]
    fn test_complete_synthesises_full_progress_and_completed() {
        let hub = TransferHub::new("test");
        hub.set_resource("/fw/app.bin");
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Transferring);
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Complete);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            [
                "state:Transferring->Complete",
                "busy:false",
                "progress:100",
                "completed"
            ]
        );
    }

    #[test]
    fn test_complete_while_paused_backfills_resumed() {
        let hub = TransferHub::new("test");
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Transferring);
        hub.state_changed_advertisement(TransferState::Paused);
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Complete);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            [
                "state:Paused->Complete",
                "busy:false",
                "resumed",
                "progress:100",
                "completed"
            ]
        );
    }

    #[test]
    fn test_busy_state_flips_only_between_idle_and_ongoing() {
        let hub = TransferHub::new("test");
        let seen = collect_events(&hub);
        hub.state_changed_advertisement(TransferState::Idle);
        hub.state_changed_advertisement(TransferState::Transferring);
        hub.state_changed_advertisement(TransferState::Paused);
        hub.state_changed_advertisement(TransferState::Cancelling);
        hub.state_changed_advertisement(TransferState::Cancelled);
        let seen = seen.lock().unwrap();
        let busy_flips: Vec<&str> = seen
            .iter()
            .filter(|tag| tag.starts_with("busy:"))
            .map(String::as_str)
            .collect();
        assert_eq!(busy_flips, ["busy:true", "busy:false"]);
    }

    #[test]
    fn test_progress_carries_both_throughputs() {
        let hub = TransferHub::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        hub.subscribe(move |event| {
            if let TransferEvent::ProgressChanged {
                progress_percentage,
                average_throughput_kbps,
                current_throughput_kbps,
            } = event
            {
                seen_clone.lock().unwrap().push((
                    *progress_percentage,
                    *average_throughput_kbps,
                    *current_throughput_kbps,
                ));
            }
        });
        hub.progress_changed_advertisement(40, 12.5, 18.0);
        assert_eq!(seen.lock().unwrap().as_slice(), [(40, 12.5, 18.0)]);
    }
}
