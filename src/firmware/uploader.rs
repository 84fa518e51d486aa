//! Flashing a module that is sitting in its bootloader.
//!
//! The actual write is done by an external tool (avrdude) behind the
//! [`FlashTool`] trait. [`FirmwareUploader`] handles everything around it:
//! snapshotting the namespace, judging the tool's output, finding the port the
//! module comes back on after its post-flash reset, and removing the image.

use crate::config::FlashToolConfig;
use crate::error::{ModuleError, ModuleResult};
use crate::modules::{ConnectionState, Module};
use crate::ports::PortDirectory;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything the flashing tool needs for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Tool configuration file (`avrdude.conf`)
    pub tool_config: PathBuf,
    /// Target microcontroller part number
    pub part_no: String,
    /// Programmer protocol id
    pub programmer_id: String,
    /// Bootloader port to write through
    pub port: String,
    /// Bootloader baud rate
    pub baud_rate: u32,
    /// Intel HEX image to write
    pub firmware: PathBuf,
}

/// What the flashing tool produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOutput {
    /// Whether the process exited successfully
    pub exit_success: bool,
    /// Combined stdout and stderr text
    pub output: String,
}

/// External flashing tool.
#[async_trait]
pub trait FlashTool: Send + Sync {
    /// Run one write and wait for the tool to exit.
    async fn flash(&self, request: &FlashRequest) -> ModuleResult<FlashOutput>;
}

/// avrdude run as a subprocess.
#[derive(Debug, Clone)]
pub struct Avrdude {
    program: String,
}

impl Avrdude {
    /// Run the given executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for `request`.
    pub fn args(request: &FlashRequest) -> Vec<String> {
        vec![
            format!("-C{}", request.tool_config.display()),
            "-v".to_string(),
            format!("-p{}", request.part_no),
            format!("-c{}", request.programmer_id),
            format!("-P{}", request.port),
            format!("-b{}", request.baud_rate),
            "-D".to_string(),
            format!("-Uflash:w:{}:i", request.firmware.display()),
        ]
    }
}

impl Default for Avrdude {
    fn default() -> Self {
        Self::new("avrdude")
    }
}

#[async_trait]
impl FlashTool for Avrdude {
    async fn flash(&self, request: &FlashRequest) -> ModuleResult<FlashOutput> {
        let args = Self::args(request);
        debug!(program = %self.program, ?args, "Running flash tool");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ModuleError::UploadFailure {
                output: format!("failed to run {}: {e}", self.program),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(FlashOutput {
            exit_success: output.status.success(),
            output: text.trim().to_string(),
        })
    }
}

/// Result of a verified upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Flash tool output
    pub output: String,
    /// Port recorded on the module after the upload
    pub port: String,
    /// Whether a new port was found after the post-flash reset
    pub port_changed: bool,
}

/// Writes firmware images to modules in programming mode.
#[derive(Clone)]
pub struct FirmwareUploader {
    directory: PortDirectory,
    tool: Arc<dyn FlashTool>,
    config: FlashToolConfig,
}

impl FirmwareUploader {
    /// Uploader using `tool` with the given settings.
    pub fn new(
        directory: PortDirectory,
        tool: Arc<dyn FlashTool>,
        config: FlashToolConfig,
    ) -> Self {
        Self {
            directory,
            tool,
            config,
        }
    }

    /// Uploader running the configured avrdude executable.
    pub fn avrdude(directory: PortDirectory, config: FlashToolConfig) -> Self {
        let tool = Arc::new(Avrdude::new(config.program.clone()));
        Self::new(directory, tool, config)
    }

    /// Settings in use.
    pub fn config(&self) -> &FlashToolConfig {
        &self.config
    }

    /// Flash `firmware` onto `module` through its bootloader port.
    ///
    /// Whatever the outcome, the namespace is rescanned afterwards and the
    /// module's port moved to the first newly appeared entry, and `firmware` is
    /// deleted. A module whose port did not change is in an ambiguous state;
    /// see [`UploadReport::port_changed`].
    pub async fn upload(
        &self,
        module: &mut Module,
        firmware: &Path,
        tool_config: &Path,
    ) -> ModuleResult<UploadReport> {
        let result = self.flash_and_relocate(module, firmware, tool_config).await;
        remove_image(firmware).await;
        result
    }

    async fn flash_and_relocate(
        &self,
        module: &mut Module,
        firmware: &Path,
        tool_config: &Path,
    ) -> ModuleResult<UploadReport> {
        module.require_state(ConnectionState::ProgrammingMode)?;

        let before = self.directory.enumerate().await?;
        let request = FlashRequest {
            tool_config: tool_config.to_path_buf(),
            part_no: self.config.part_no.clone(),
            programmer_id: self.config.programmer_id.clone(),
            port: module.port().to_string(),
            baud_rate: self.config.baud_rate,
            firmware: firmware.to_path_buf(),
        };

        info!(
            port = %request.port,
            firmware = %firmware.display(),
            "Flashing firmware, this will take about a minute"
        );
        let flashed = self.tool.flash(&request).await;

        // The board resets after a write attempt; follow it to its new port
        let port_changed = match self.directory.enumerate().await {
            Ok(after) => match after.first_new_since(&before) {
                Some(port) => {
                    info!(from = %request.port, to = %port, "Switching back to operating port");
                    module.set_port(port);
                    true
                }
                None => {
                    warn!(
                        port = %request.port,
                        "No new port after upload, keeping bootloader port"
                    );
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not rescan ports after upload");
                false
            }
        };
        module.set_state(ConnectionState::Disconnected);

        let flashed = flashed?;
        if flashed.exit_success && flashed.output.contains(&self.config.verification_marker) {
            info!(port = %module.port(), "Firmware uploaded successfully");
            Ok(UploadReport {
                output: flashed.output,
                port: module.port().to_string(),
                port_changed,
            })
        } else {
            warn!(
                exit_success = flashed.exit_success,
                "Firmware upload failed\n{}", flashed.output
            );
            Err(ModuleError::UploadFailure {
                output: flashed.output,
            })
        }
    }
}

/// Best-effort removal of an uploaded image.
pub(crate) async fn remove_image(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "Removed firmware image"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Could not remove firmware image"),
    }
}
