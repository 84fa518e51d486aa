//! Firmware updates: bootloader entry followed by an avrdude upload.
//!
//! The two steps are independent operations on the same `&mut Module`, and
//! the transition has to finish before the upload starts. [`update_firmware`]
//! runs them in that order.

pub mod bootloader;
pub mod uploader;

pub use bootloader::{BootloaderTransition, TransitionReport, TransitionState};
pub use uploader::{
    Avrdude, FirmwareUploader, FlashOutput, FlashRequest, FlashTool, UploadReport,
};

use crate::error::ModuleResult;
use crate::modules::Module;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Response returned to API clients after an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareUpdateReport {
    /// Flash tool output
    pub message: String,
    /// Name of the uploaded image
    pub filename: String,
}

/// Move `module` into its bootloader and flash `firmware` onto it.
///
/// The image is deleted whether or not the update succeeds, including when the
/// bootloader port is never found.
pub async fn update_firmware(
    transition: &BootloaderTransition,
    uploader: &FirmwareUploader,
    module: &mut Module,
    firmware: &Path,
    tool_config: &Path,
) -> ModuleResult<FirmwareUpdateReport> {
    let filename = firmware
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| firmware.display().to_string());

    if let Err(e) = transition.run(module).await {
        uploader::remove_image(firmware).await;
        return Err(e);
    }

    let report = uploader.upload(module, firmware, tool_config).await?;
    info!(file = %filename, port = %report.port, "Firmware update complete");

    Ok(FirmwareUpdateReport {
        message: report.output,
        filename,
    })
}
