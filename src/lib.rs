// mculift -- firmware lifecycle management for MCUmgr/SMP devices over BLE.
//
// Provides the shared orchestration layer (retry loops, pause/cancel,
// event fan-out, fail-safe connection settings) on top of host-supplied
// native transfer proxies, plus bundled SMP-over-BLE proxies for firmware
// installation and device reset so desktop platforms work out of the box.

#[macro_use]
mod logging;

mod completion;
mod gate;

pub mod downloader;
pub mod eraser;
pub mod events;
pub mod installer;
pub mod paths;
pub mod resetter;
pub mod settings;
pub mod smp;
pub mod uploader;

pub use completion::{Completion, CompletionOutcome};
pub use downloader::{
    DownloadError, DownloadRequest, DownloaderCallbacks, FileDownloader, NativeFileDownloaderProxy,
};
pub use eraser::{EraseError, ErasureState, FirmwareEraser, NativeFirmwareEraserProxy};
pub use events::{
    GlobalErrorCode, LogLevel, SubscriptionId, TransferEvent, TransferHub, TransferState,
    TransferVerdict,
};
pub use gate::KeepGoing;
pub use installer::{
    FirmwareInstallationMode, FirmwareInstaller, InstallError, InstallRequest, InstallationEvent,
    InstallationParameters, InstallationState, InstallationVerdict, InstallerFatalErrorType,
    NativeFirmwareInstallerProxy,
};
pub use logging::{init_file_logging, stop_file_logging};
pub use resetter::{DeviceResetter, NativeDeviceResetterProxy, ResetError, ResetState};
pub use settings::ConnectionSettings;
pub use smp::{
    connect_smp_peripheral, discover_smp_peripherals, SmpDeviceResetterProxy,
    SmpFirmwareInstallerProxy, SmpProxyError, SMP_SERVICE_UUID,
};
pub use uploader::{
    FileUploader, MultiUploadRequest, NativeFileUploaderProxy, UploadError, UploadRequest,
};
