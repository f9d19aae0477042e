// Bundled SMP-over-BLE proxies.
//
// Uses the MCUmgr SMP protocol over the standard SMP GATT service to provide
// ready-made native proxies for firmware installation and device reset, so
// the library is usable end-to-end on desktop platforms. File upload and
// download proxies stay host-supplied.
//
// SMP Service UUID: 8D53DC1D-1DB7-4CD3-868B-8A527460AA84

use crate::events::GlobalErrorCode;
use crate::gate::KeepGoing;
use crate::installer::{
    FirmwareInstallationMode, InstallationHub, InstallationParameters, InstallationState,
    InstallationVerdict, InstallerFatalErrorType, NativeFirmwareInstallerProxy,
};
use crate::resetter::{NativeDeviceResetterProxy, ResetHub, ResetState};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use mcumgr_smp::application_management;
use mcumgr_smp::os_management;
use mcumgr_smp::smp::SmpFrame;
use mcumgr_smp::transport::ble::BleTransport;
use mcumgr_smp::transport::smp::SmpTransportAsync;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Standard SMP GATT service UUID
pub const SMP_SERVICE_UUID: Uuid =
    uuid_from_fields(0x8D53DC1D, 0x1DB7, 0x4CD3, 0x868B, 0x8A527460AA84);

/// Chunk size for BLE firmware upload (bytes).
/// 500 bytes is safely below the 512-byte SMP MTU (8-byte SMP header + payload).
const BLE_CHUNK_SIZE: usize = 500;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback wait for the bootloader to swap images when the caller gives no
/// estimate of its own.
const IMAGE_SWAP_FALLBACK_WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SmpProxyError {
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("device does not have the SMP service")]
    SmpServiceMissing,
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("service discovery timed out after {0:?}")]
    ServiceDiscoveryTimeout(Duration),
}

// ============================================================================
// Discovery and connection helpers
// ============================================================================

#[derive(Debug, Clone)]
pub struct DiscoveredSmpDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Scan for peripherals advertising the SMP service for the given window.
///
/// The scan itself is unfiltered: CoreBluetooth doesn't reliably match
/// 128-bit UUIDs in scan response data, so matching happens on the reported
/// properties instead.
pub async fn discover_smp_peripherals(
    adapter: &Adapter,
    scan_window: Duration,
) -> Result<Vec<DiscoveredSmpDevice>, SmpProxyError> {
    adapter.start_scan(ScanFilter::default()).await?;
    let mut events = adapter.events().await?;

    tlog!(
        "[smp] Scan started (filtering for SMP UUID {:?})",
        SMP_SERVICE_UUID
    );

    let mut seen_ids = HashSet::new();
    let mut found = Vec::new();

    let deadline = tokio::time::sleep(scan_window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => {
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => break,
                };
                if seen_ids.contains(&id.to_string()) {
                    continue;
                }

                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(_) => continue,
                };
                let props = match peripheral.properties().await.ok().flatten() {
                    Some(props) => props,
                    None => continue,
                };

                let advertises_service = props.services.contains(&SMP_SERVICE_UUID)
                    || props.service_data.contains_key(&SMP_SERVICE_UUID);
                if !advertises_service {
                    continue;
                }

                let id = id.to_string();
                seen_ids.insert(id.clone());
                let name = props.local_name.clone().unwrap_or_else(|| id.clone());

                tlog!("[smp] BLE matched: {} ({}), RSSI: {:?}", name, id, props.rssi);

                found.push(DiscoveredSmpDevice {
                    id,
                    name,
                    rssi: props.rssi,
                });
            }
        }
    }

    let _ = adapter.stop_scan().await;
    tlog!("[smp] Scan finished, {} device(s) matched", found.len());

    Ok(found)
}

/// Connect to a peripheral by its platform-specific ID string, discover
/// services and verify the SMP service is present.
pub async fn connect_smp_peripheral(
    adapter: &Adapter,
    device_id: &str,
) -> Result<Peripheral, SmpProxyError> {
    // Try the adapter cache first
    let peripherals = adapter.peripherals().await?;
    let peripheral = match peripherals
        .into_iter()
        .find(|p| p.id().to_string() == device_id)
    {
        Some(peripheral) => peripheral,
        None => {
            // Device not in adapter cache (e.g. evicted by CoreBluetooth after
            // a previous disconnect). Run a quick scan to rediscover it.
            tlog!("[smp] Device {} not in cache, running quick rescan...", device_id);
            let _ = adapter.start_scan(ScanFilter::default()).await;
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = adapter.stop_scan().await;

            adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.id().to_string() == device_id)
                .ok_or_else(|| SmpProxyError::DeviceNotFound(device_id.to_string()))?
        }
    };

    tlog!("[smp] Connecting to {device_id}...");
    match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            let _ = peripheral.disconnect().await;
            return Err(SmpProxyError::ConnectTimeout(CONNECT_TIMEOUT));
        }
    }

    match tokio::time::timeout(SERVICE_DISCOVERY_TIMEOUT, peripheral.discover_services()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = peripheral.disconnect().await;
            return Err(e.into());
        }
        Err(_) => {
            let _ = peripheral.disconnect().await;
            return Err(SmpProxyError::ServiceDiscoveryTimeout(
                SERVICE_DISCOVERY_TIMEOUT,
            ));
        }
    }

    let has_service = peripheral
        .services()
        .iter()
        .any(|s| s.uuid == SMP_SERVICE_UUID);
    if !has_service {
        let _ = peripheral.disconnect().await;
        return Err(SmpProxyError::SmpServiceMissing);
    }

    tlog!("[smp] Connected to {device_id}");
    Ok(peripheral)
}

// ============================================================================
// Firmware installer proxy
// ============================================================================

/// BLE-backed firmware installation proxy: uploads the image in SMP chunks,
/// marks it per the requested mode and reboots the device.
///
/// Expects a peripheral that already passed `connect_smp_peripheral`.
pub struct SmpFirmwareInstallerProxy {
    peripheral: Peripheral,
    hub: Mutex<Option<Arc<InstallationHub>>>,
    keep_going: KeepGoing,
    cancel_requested: Arc<AtomicBool>,
    seq: AtomicU8,
}

impl SmpFirmwareInstallerProxy {
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            hub: Mutex::new(None),
            keep_going: KeepGoing::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            seq: AtomicU8::new(0),
        }
    }

    fn bound_hub(&self) -> Option<Arc<InstallationHub>> {
        self.hub.lock().ok().and_then(|hub| hub.clone())
    }

    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl NativeFirmwareInstallerProxy for SmpFirmwareInstallerProxy {
    fn bind(&self, hub: Arc<InstallationHub>) {
        if let Ok(mut slot) = self.hub.lock() {
            *slot = Some(hub);
        }
    }

    async fn begin_installation(
        &self,
        parameters: InstallationParameters<'_>,
    ) -> InstallationVerdict {
        let hub = match self.bound_hub() {
            Some(hub) => hub,
            None => return InstallationVerdict::FailedInstallationInitializationErroredOut,
        };
        if parameters.firmware_data.is_empty() {
            return InstallationVerdict::FailedGivenFirmwareUnhealthy;
        }

        self.cancel_requested.store(false, Ordering::SeqCst);
        self.keep_going.open();

        let connected = self.peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            if let Err(e) = self.peripheral.connect().await {
                tlog!("[smp] Failed to reconnect for installation: {e}");
                return InstallationVerdict::FailedInstallationInitializationErroredOut;
            }
            if let Err(e) = self.peripheral.discover_services().await {
                tlog!("[smp] Failed to rediscover services for installation: {e}");
                return InstallationVerdict::FailedInstallationInitializationErroredOut;
            }
        }

        let transport = match BleTransport::from_peripheral(self.peripheral.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                tlog!("[smp] Failed to create BLE transport: {e}");
                return InstallationVerdict::FailedInstallationInitializationErroredOut;
            }
        };

        let worker = InstallationWorker {
            hub,
            peripheral: self.peripheral.clone(),
            keep_going: self.keep_going.clone(),
            cancel_requested: self.cancel_requested.clone(),
            firmware_data: parameters.firmware_data.to_vec(),
            mode: parameters.mode,
            estimated_swap_time: parameters
                .estimated_swap_time
                .unwrap_or(IMAGE_SWAP_FALLBACK_WAIT),
            seq: self.next_seq(),
        };
        tokio::spawn(worker.run(transport));

        InstallationVerdict::Success
    }

    fn try_pause(&self) {
        self.keep_going.close();
    }

    fn try_resume(&self) {
        self.keep_going.open();
    }

    fn try_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(hub) = self.bound_hub() {
            hub.state_changed_advertisement(InstallationState::Cancelling);
        }
        // make sure a paused upload loop wakes up to observe the flag
        self.keep_going.open();
    }

    fn disconnect(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.keep_going.open();
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            let _ = peripheral.disconnect().await;
        });
    }
}

struct InstallationWorker {
    hub: Arc<InstallationHub>,
    peripheral: Peripheral,
    keep_going: KeepGoing,
    cancel_requested: Arc<AtomicBool>,
    firmware_data: Vec<u8>,
    mode: FirmwareInstallationMode,
    estimated_swap_time: Duration,
    seq: u8,
}

impl InstallationWorker {
    async fn run(self, mut transport: BleTransport) {
        self.hub.state_changed_advertisement(InstallationState::Idle);
        self.hub.busy_state_changed_advertisement(true);

        self.hub
            .state_changed_advertisement(InstallationState::Validating);
        let mut hasher = Sha256::new();
        hasher.update(&self.firmware_data);
        let hash = hasher.finalize().to_vec();
        tlog!("[smp] Firmware image hash: {}", hex::encode(&hash));

        if self.upload_image(&mut transport, &hash).await {
            self.finalize(&mut transport, &hash).await;
        }

        self.hub.busy_state_changed_advertisement(false);
    }

    /// Upload the image in chunks. Returns false when the installation should
    /// not proceed past the uploading stage.
    async fn upload_image(&self, transport: &mut BleTransport, hash: &[u8]) -> bool {
        let total_bytes = self.firmware_data.len();
        tlog!("[smp] Starting firmware upload ({} bytes)", total_bytes);

        self.hub
            .state_changed_advertisement(InstallationState::Uploading);

        let mut writer =
            application_management::ImageWriter::new(None, total_bytes, Some(hash), false);
        let started = Instant::now();

        let mut offset = 0;
        while offset < total_bytes {
            if self.observe_cancellation() {
                return false;
            }
            if self.keep_going.is_closed() {
                self.hub
                    .state_changed_advertisement(InstallationState::Paused);
                self.keep_going.wait_open().await;
                if self.observe_cancellation() {
                    return false;
                }
                self.hub
                    .state_changed_advertisement(InstallationState::Uploading);
            }

            let end = std::cmp::min(offset + BLE_CHUNK_SIZE, total_bytes);
            let chunk = &self.firmware_data[offset..end];

            let frame = writer.write_chunk(chunk);
            let encoded = frame.encode_with_cbor();

            if let Err(e) = transport.send(encoded).await {
                self.uploading_stage_errored_out(&format!(
                    "Failed to send upload chunk at offset {offset}: {e}"
                ));
                return false;
            }
            let response = match transport.receive().await {
                Ok(response) => response,
                Err(e) => {
                    self.uploading_stage_errored_out(&format!(
                        "Failed to receive upload response at offset {offset}: {e}"
                    ));
                    return false;
                }
            };

            let result_frame: SmpFrame<application_management::WriteImageChunkResult> =
                match SmpFrame::decode_with_cbor(&response) {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.uploading_stage_errored_out(&format!(
                            "Failed to decode upload response: {e}"
                        ));
                        return false;
                    }
                };
            match result_frame.data {
                application_management::WriteImageChunkResult::Ok(_) => {}
                application_management::WriteImageChunkResult::Err(e) => {
                    self.hub
                        .state_changed_advertisement(InstallationState::Error);
                    self.hub.fatal_error_advertisement(
                        InstallationState::Uploading,
                        InstallerFatalErrorType::UploadingErroredOut,
                        &format!("Device rejected upload at offset {offset}, rc={}", e.rc),
                        GlobalErrorCode::from_smp(None, e.rc as i32),
                    );
                    return false;
                }
            }

            offset = end;

            let percent = ((offset as f32 / total_bytes as f32) * 100.0) as u8;
            let elapsed = started.elapsed().as_secs_f32().max(0.001);
            let throughput_kbps = (offset as f32 / elapsed) / 1024.0;
            self.hub
                .upload_progress_advertisement(percent, throughput_kbps);
        }

        tlog!("[smp] Upload complete ({} bytes)", total_bytes);
        true
    }

    /// Mark the uploaded image per the requested mode and reboot the device.
    async fn finalize(&self, transport: &mut BleTransport, hash: &[u8]) {
        match self.mode {
            FirmwareInstallationMode::TestOnly | FirmwareInstallationMode::TestAndConfirm => {
                self.hub
                    .state_changed_advertisement(InstallationState::Testing);
                if !self.set_image_state(transport, hash, false).await {
                    return;
                }
            }
            FirmwareInstallationMode::ConfirmOnly => {
                self.hub
                    .state_changed_advertisement(InstallationState::Confirming);
                if !self.set_image_state(transport, hash, true).await {
                    return;
                }
            }
        }

        self.hub
            .state_changed_advertisement(InstallationState::Resetting);
        if !self.reset_device(transport).await {
            return;
        }

        if self.mode == FirmwareInstallationMode::TestAndConfirm {
            // give the bootloader time to swap images, then reconnect to confirm
            tokio::time::sleep(self.estimated_swap_time).await;

            self.hub
                .state_changed_advertisement(InstallationState::Confirming);
            let mut transport = match self.reconnect().await {
                Some(transport) => transport,
                None => {
                    self.hub
                        .state_changed_advertisement(InstallationState::Error);
                    self.hub.fatal_error_advertisement(
                        InstallationState::Confirming,
                        InstallerFatalErrorType::ImageSwapTimeout,
                        "Device did not come back up after the image swap",
                        GlobalErrorCode::Timeout,
                    );
                    return;
                }
            };
            if !self.set_image_state(&mut transport, hash, true).await {
                return;
            }
        }

        self.hub
            .state_changed_advertisement(InstallationState::Complete);
    }

    async fn set_image_state(
        &self,
        transport: &mut BleTransport,
        hash: &[u8],
        confirm: bool,
    ) -> bool {
        let frame = application_management::set_state(hash.to_vec(), confirm, self.seq);
        let encoded = frame.encode_with_cbor();

        let state = self.hub.current_state();
        let fatal_error_type = if confirm {
            InstallerFatalErrorType::ConfirmationFailed
        } else {
            InstallerFatalErrorType::PostInstallationHealthcheckFailed
        };

        if let Err(e) = transport.send(encoded).await {
            self.hub
                .state_changed_advertisement(InstallationState::Error);
            self.hub.fatal_error_advertisement(
                state,
                fatal_error_type,
                &format!("Failed to send set_state: {e}"),
                GlobalErrorCode::Generic,
            );
            return false;
        }
        let response = match transport.receive().await {
            Ok(response) => response,
            Err(e) => {
                self.hub
                    .state_changed_advertisement(InstallationState::Error);
                self.hub.fatal_error_advertisement(
                    state,
                    fatal_error_type,
                    &format!("Failed to receive set_state response: {e}"),
                    GlobalErrorCode::Generic,
                );
                return false;
            }
        };

        let result_frame: SmpFrame<application_management::GetImageStateResult> =
            match SmpFrame::decode_with_cbor(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    self.hub
                        .state_changed_advertisement(InstallationState::Error);
                    self.hub.fatal_error_advertisement(
                        state,
                        fatal_error_type,
                        &format!("Failed to decode set_state response: {e}"),
                        GlobalErrorCode::Generic,
                    );
                    return false;
                }
            };
        if let application_management::GetImageStateResult::Err(e) = result_frame.data {
            self.hub
                .state_changed_advertisement(InstallationState::Error);
            self.hub.fatal_error_advertisement(
                state,
                fatal_error_type,
                &format!("Device rejected set_state, rc={}", e.rc),
                GlobalErrorCode::from_smp(None, e.rc as i32),
            );
            return false;
        }

        tlog!(
            "[smp] Image {}",
            if confirm { "confirmed" } else { "marked for test boot" }
        );
        true
    }

    async fn reset_device(&self, transport: &mut BleTransport) -> bool {
        let frame = os_management::reset(self.seq.wrapping_add(1), false);
        let encoded = frame.encode_with_cbor();

        if let Err(e) = transport.send(encoded).await {
            self.hub
                .state_changed_advertisement(InstallationState::Error);
            self.hub.fatal_error_advertisement(
                InstallationState::Resetting,
                InstallerFatalErrorType::PostInstallationRebootFailed,
                &format!("Failed to send reset: {e}"),
                GlobalErrorCode::Generic,
            );
            return false;
        }

        // The device may disconnect before sending a response, so
        // we tolerate a receive failure here.
        match transport.receive().await {
            Ok(response) => {
                let _ = SmpFrame::<os_management::ResetResult>::decode_with_cbor(&response);
            }
            Err(_) => {
                tlog!("[smp] No response to reset (device likely rebooted)");
            }
        }

        tlog!("[smp] Reset command sent");
        true
    }

    async fn reconnect(&self) -> Option<BleTransport> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect()).await {
            Ok(Ok(())) => {}
            _ => return None,
        }
        if self.peripheral.discover_services().await.is_err() {
            return None;
        }
        BleTransport::from_peripheral(self.peripheral.clone()).await.ok()
    }

    fn observe_cancellation(&self) -> bool {
        if !self.cancel_requested.load(Ordering::SeqCst) {
            return false;
        }
        tlog!("[smp] Installation cancelled");
        self.hub
            .state_changed_advertisement(InstallationState::Cancelled);
        self.hub.cancelled_advertisement();
        true
    }

    fn uploading_stage_errored_out(&self, message: &str) {
        self.hub
            .state_changed_advertisement(InstallationState::Error);
        self.hub.fatal_error_advertisement(
            InstallationState::Uploading,
            InstallerFatalErrorType::UploadingErroredOut,
            message,
            GlobalErrorCode::Generic,
        );
    }
}

// ============================================================================
// Device resetter proxy
// ============================================================================

/// BLE-backed device reset proxy.
///
/// Expects a peripheral that already passed `connect_smp_peripheral`.
pub struct SmpDeviceResetterProxy {
    peripheral: Peripheral,
    hub: Mutex<Option<Arc<ResetHub>>>,
    seq: AtomicU8,
}

impl SmpDeviceResetterProxy {
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            hub: Mutex::new(None),
            seq: AtomicU8::new(0),
        }
    }

    fn bound_hub(&self) -> Option<Arc<ResetHub>> {
        self.hub.lock().ok().and_then(|hub| hub.clone())
    }
}

#[async_trait]
impl NativeDeviceResetterProxy for SmpDeviceResetterProxy {
    fn bind(&self, hub: Arc<ResetHub>) {
        if let Ok(mut slot) = self.hub.lock() {
            *slot = Some(hub);
        }
    }

    async fn begin_reset(&self) {
        let hub = match self.bound_hub() {
            Some(hub) => hub,
            None => return,
        };

        hub.state_changed_advertisement(ResetState::Idle);

        let mut transport = match BleTransport::from_peripheral(self.peripheral.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                hub.state_changed_advertisement(ResetState::Failed);
                hub.fatal_error_advertisement(
                    &format!("Failed to create BLE transport: {e}"),
                    GlobalErrorCode::Generic,
                );
                return;
            }
        };

        hub.state_changed_advertisement(ResetState::Resetting);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = os_management::reset(seq, false);
        let encoded = frame.encode_with_cbor();

        if let Err(e) = transport.send(encoded).await {
            hub.state_changed_advertisement(ResetState::Failed);
            hub.fatal_error_advertisement(
                &format!("Failed to send reset: {e}"),
                GlobalErrorCode::Generic,
            );
            return;
        }

        // The device may disconnect before sending a response, so
        // we tolerate a receive failure here.
        match transport.receive().await {
            Ok(response) => {
                let _ = SmpFrame::<os_management::ResetResult>::decode_with_cbor(&response);
            }
            Err(_) => {
                tlog!("[smp] No response to reset (device likely rebooted)");
            }
        }

        tlog!("[smp] Reset command sent");
        hub.state_changed_advertisement(ResetState::Complete);
    }

    fn disconnect(&self) {
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            let _ = peripheral.disconnect().await;
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smp_service_uuid_renders_canonically() {
        assert_eq!(
            SMP_SERVICE_UUID.to_string(),
            "8d53dc1d-1db7-4cd3-868b-8a527460aa84"
        );
    }

    #[test]
    fn test_ble_chunking_covers_the_whole_image() {
        let total: usize = 1733;
        let mut offset = 0;
        let mut chunks = 0;
        while offset < total {
            offset = std::cmp::min(offset + BLE_CHUNK_SIZE, total);
            chunks += 1;
        }
        assert_eq!(offset, total);
        assert_eq!(chunks, 4);
    }
}
