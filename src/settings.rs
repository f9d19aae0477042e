// BLE connection tuning for SMP transfers.
//
// Callers normally leave every knob unset and let the device negotiate.
// Two advisors can substitute conservative fail-safe values instead: one
// keyed on the host device identity (devices with BLE stacks known to
// misbehave under load), one keyed on the failure counters of the running
// retry loop (a connection that keeps dying early gets the conservative
// tuple for its last-ditch attempts).

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashSet;

// ============================================================================
// Connection settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionSettings {
    pub pipeline_depth: Option<i32>,
    pub byte_alignment: Option<i32>,
    pub initial_mtu_size: Option<i32>,
    pub window_capacity: Option<i32>,
    pub memory_alignment: Option<i32>,
}

/// Conservative values known to work on practically any SMP device.
pub mod failsafe {
    pub const INITIAL_MTU_SIZE: i32 = 23;
    pub const WINDOW_CAPACITY: i32 = 1;
    pub const MEMORY_ALIGNMENT: i32 = 1;
    pub const PIPELINE_DEPTH: i32 = 1;
    pub const BYTE_ALIGNMENT: i32 = 1;
}

impl ConnectionSettings {
    /// The full conservative tuple used by upload-style transfers.
    pub fn fail_safe() -> Self {
        Self {
            pipeline_depth: Some(failsafe::PIPELINE_DEPTH),
            byte_alignment: Some(failsafe::BYTE_ALIGNMENT),
            initial_mtu_size: Some(failsafe::INITIAL_MTU_SIZE),
            window_capacity: Some(failsafe::WINDOW_CAPACITY),
            memory_alignment: Some(failsafe::MEMORY_ALIGNMENT),
        }
    }

    /// Downloads expose fewer tunables; only MTU and window capacity apply.
    pub fn fail_safe_for_downloads() -> Self {
        Self {
            pipeline_depth: None,
            byte_alignment: None,
            initial_mtu_size: Some(failsafe::INITIAL_MTU_SIZE),
            window_capacity: Some(failsafe::WINDOW_CAPACITY),
            memory_alignment: None,
        }
    }
}

// ============================================================================
// Device-based advisory
// ============================================================================

// (manufacturer, model), lowercase. Matched after trimming and lowercasing
// the caller-supplied identity.
static KNOWN_PROBLEMATIC_APPLE_DEVICES: Lazy<HashSet<(&'static str, &'static str)>> =
    Lazy::new(|| {
        let mut set = HashSet::new();
        set.insert(("apple", "ipad6,11"));
        set.insert(("apple", "ipad6,12"));
        set
    });

// No Android entries curated yet.
static KNOWN_PROBLEMATIC_ANDROID_DEVICES: Lazy<HashSet<(&'static str, &'static str)>> =
    Lazy::new(HashSet::new);

/// Substitute the fail-safe tuple when the host device is on a
/// known-problematic list and the caller left the platform's primary knobs
/// at their defaults. Customized settings always win over the advisory.
pub fn failsafe_settings_if_device_is_problematic(
    manufacturer: &str,
    model: &str,
    settings: ConnectionSettings,
) -> Option<ConnectionSettings> {
    let manufacturer = manufacturer.trim().to_lowercase();
    let model = model.trim().to_lowercase();
    let identity = (manufacturer.as_str(), model.as_str());

    if KNOWN_PROBLEMATIC_APPLE_DEVICES.contains(&identity)
        && settings.pipeline_depth.unwrap_or(1) == 1
        && settings.byte_alignment.unwrap_or(1) == 1
    {
        return Some(ConnectionSettings::fail_safe());
    }

    if KNOWN_PROBLEMATIC_ANDROID_DEVICES.contains(&identity)
        && settings.initial_mtu_size.is_none()
        && settings.window_capacity.unwrap_or(1) == 1
        && settings.memory_alignment.unwrap_or(1) == 1
    {
        return Some(ConnectionSettings::fail_safe());
    }

    None
}

// ============================================================================
// Instability-based advisory
// ============================================================================

/// Substitute the fail-safe tuple once the retry loop has burnt enough tries
/// on a connection that keeps dying early. The last few retries of the
/// budget are reserved as a last-ditch effort with conservative settings:
/// fires on the final try, or earlier once the suspicious-failure count
/// reaches `min(10, max_tries - 3)`. Pure; recomputed every loop iteration.
pub fn failsafe_settings_if_connection_proves_unstable(
    uploading_not_downloading: bool,
    tries_count: u32,
    max_tries_count: u32,
    suspicious_transport_failures_count: u32,
) -> Option<ConnectionSettings> {
    let resort_on_failure_count = std::cmp::min(10, max_tries_count.saturating_sub(3));

    let should_resort = tries_count >= 2
        && (tries_count == max_tries_count
            || (tries_count >= 3
                && suspicious_transport_failures_count >= resort_on_failure_count));
    if !should_resort {
        return None;
    }

    Some(if uploading_not_downloading {
        ConnectionSettings::fail_safe()
    } else {
        ConnectionSettings::fail_safe_for_downloads()
    })
}

// ============================================================================
// Tests
// ============================================================================
