//! Stub hardware shared by the integration tests.
//!
//! Device namespaces are temporary directories; "devices" are empty files in
//! them. Stub drivers and flash tools rename those files to imitate a board
//! re-enumerating after a reset.

#![allow(dead_code)]

use async_trait::async_trait;
use deck_modules::firmware::{FlashOutput, FlashRequest, FlashTool};
use deck_modules::modules::{DeviceInfo, DriverFactory, ModuleDriver, ModuleType};
use deck_modules::{ModuleError, ModuleResult, PortDirectory};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Hook run when a stub device resets.
pub type ResetHook = Box<dyn FnMut() + Send>;

/// Create an empty device entry.
pub fn touch(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"").unwrap();
}

/// Remove a device entry.
pub fn unplug(dir: &Path, name: &str) {
    std::fs::remove_file(dir.join(name)).unwrap();
}

/// Full port path for an entry, as the directory reports it.
pub fn port(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

/// Live namespace over `dir` with a short retry delay.
pub fn live_directory(dir: &Path) -> PortDirectory {
    PortDirectory::new(dir, true).with_retry_delay(Duration::from_millis(20))
}

/// Hook that replaces entry `from` with entry `to` in `dir`.
pub fn renumber(dir: &Path, from: &str, to: &str) -> ResetHook {
    let dir = dir.to_path_buf();
    let (from, to) = (from.to_string(), to.to_string());
    Box::new(move || {
        let _ = std::fs::remove_file(dir.join(&from));
        touch(&dir, &to);
    })
}

/// Write a throwaway firmware image.
pub fn firmware_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b":00000001FF\n").unwrap();
    path
}

/// Driver for a scripted device.
pub struct StubDriver {
    info: DeviceInfo,
    connected: bool,
    refuse_programming_mode: bool,
    close_before_refusing: bool,
    on_reset: Option<ResetHook>,
}

impl StubDriver {
    /// Device reporting `model` and `serial`.
    pub fn new(model: &str, serial: &str) -> Self {
        Self {
            info: [("model", model), ("serial", serial), ("version", "edge-1.0")]
                .into_iter()
                .collect(),
            connected: false,
            refuse_programming_mode: false,
            close_before_refusing: false,
            on_reset: None,
        }
    }

    /// Run `hook` when the device is told to enter programming mode.
    pub fn on_reset(mut self, hook: ResetHook) -> Self {
        self.on_reset = Some(hook);
        self
    }

    /// Fail every programming-mode request.
    pub fn refusing_programming_mode(mut self) -> Self {
        self.refuse_programming_mode = true;
        self
    }

    /// Acknowledge `dfu`, release the port, then fail the reset trigger.
    pub fn failing_after_release(mut self) -> Self {
        self.close_before_refusing = true;
        self
    }
}

#[async_trait]
impl ModuleDriver for StubDriver {
    async fn connect(&mut self, _port: &str) -> ModuleResult<DeviceInfo> {
        self.connected = true;
        Ok(self.info.clone())
    }

    async fn disconnect(&mut self) -> ModuleResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn enter_programming_mode(&mut self) -> ModuleResult<()> {
        if self.close_before_refusing {
            self.connected = false;
            return Err(ModuleError::connection(
                "",
                "failed to open port: bootloader trigger refused",
            ));
        }
        if self.refuse_programming_mode {
            return Err(ModuleError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "dfu command not acknowledged",
            )));
        }
        if let Some(hook) = self.on_reset.as_mut() {
            hook();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Factory building drivers from a closure.
pub struct StubFactory<F>(pub F);

impl<F> DriverFactory for StubFactory<F>
where
    F: Fn(ModuleType) -> StubDriver + Send + Sync,
{
    fn create(&self, module_type: ModuleType) -> Box<dyn ModuleDriver> {
        Box::new((self.0)(module_type))
    }
}

/// Flash tool returning canned output.
pub struct StubFlashTool {
    exit_success: bool,
    output: String,
    on_flash: Mutex<Option<ResetHook>>,
    requests: Mutex<Vec<FlashRequest>>,
}

impl StubFlashTool {
    /// Tool that exits with `exit_success` and prints `output`.
    pub fn new(exit_success: bool, output: &str) -> Self {
        Self {
            exit_success,
            output: output.to_string(),
            on_flash: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Tool reporting a verified write.
    pub fn verified() -> Self {
        Self::new(
            true,
            "avrdude: writing flash (16778 bytes)\navrdude: 16778 bytes of flash verified",
        )
    }

    /// Run `hook` during the write, after the request was recorded.
    pub fn on_flash(self, hook: ResetHook) -> Self {
        *self.on_flash.lock().unwrap() = Some(hook);
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<FlashRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlashTool for StubFlashTool {
    async fn flash(&self, request: &FlashRequest) -> ModuleResult<FlashOutput> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(hook) = self.on_flash.lock().unwrap().as_mut() {
            hook();
        }
        Ok(FlashOutput {
            exit_success: self.exit_success,
            output: self.output.clone(),
        })
    }
}
