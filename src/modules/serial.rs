//! Serial driver for Opentrons-style deck modules.
//!
//! Protocol Overview:
//! - Transport: USB CDC serial, 115200 baud, 8N1
//! - Commands: G-code, terminated with `\r\n\r\n`
//! - Responses: optional payload followed by the ack `ok\r\nok\r\n`
//! - `M115`: device info (`serial:... model:... version:...`)
//! - `dfu`: arm the bootloader; a following 1200-baud open/close resets the
//!   board into it
//!
//! Built without the `serial` feature, the driver still exists but every
//! connect fails with [`ModuleError::SerialFeatureDisabled`].

#![cfg_attr(not(feature = "serial"), allow(dead_code))]

use super::driver::{DriverFactory, ModuleDriver};
use super::{DeviceInfo, ModuleType};
use crate::error::{ModuleError, ModuleResult};
use async_trait::async_trait;
use std::time::Duration;

/// Operating baud rate of module firmware.
pub const MODULE_BAUD_RATE: u32 = 115_200;

/// Baud rate that triggers the bootloader reset.
pub const BOOTLOADER_TRIGGER_BAUD_RATE: u32 = 1200;

const COMMAND_TERMINATOR: &str = "\r\n\r\n";
const ACK: &[u8] = b"ok\r\nok\r\n";
const DEVICE_INFO_COMMAND: &str = "M115";
const PROGRAMMING_MODE_COMMAND: &str = "dfu";

/// Settle time between arming the bootloader and the baud-rate touch.
const PROGRAMMING_MODE_SETTLE: Duration = Duration::from_secs(1);

/// Serial connection to one module.
pub struct SerialModuleDriver {
    module_type: ModuleType,
    timeout: Duration,
    port: Option<String>,
    #[cfg(feature = "serial")]
    stream: Option<tokio_serial::SerialStream>,
}

impl SerialModuleDriver {
    /// Unconnected driver for a module of `module_type`.
    pub fn new(module_type: ModuleType) -> Self {
        Self {
            module_type,
            timeout: Duration::from_secs(1),
            port: None,
            #[cfg(feature = "serial")]
            stream: None,
        }
    }

    /// Set the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Module type this driver was created for.
    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    fn port_name(&self) -> String {
        self.port.clone().unwrap_or_default()
    }
}

#[cfg(feature = "serial")]
mod io {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::debug;

    pub(super) fn open(port: &str, baud_rate: u32) -> ModuleResult<SerialStream> {
        tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ModuleError::connection(port, format!("failed to open port: {e}")))
    }

    impl SerialModuleDriver {
        /// Send a G-code command and return the payload before the ack.
        pub(super) async fn send_command(&mut self, command: &str) -> ModuleResult<String> {
            let port = self.port_name();
            let timeout = self.timeout;
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ModuleError::connection(&port, "serial port not connected"))?;

            stream
                .write_all(format!("{command}{COMMAND_TERMINATOR}").as_bytes())
                .await
                .map_err(|e| ModuleError::connection(&port, format!("write failed: {e}")))?;

            let mut response = Vec::new();
            let mut chunk = [0u8; 256];
            let read = async {
                loop {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
                    }
                    response.extend_from_slice(&chunk[..n]);
                    if response.ends_with(ACK) {
                        return Ok::<(), std::io::Error>(());
                    }
                }
            };

            tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| {
                    ModuleError::connection(
                        &port,
                        format!("no response to {command} within {timeout:?}"),
                    )
                })?
                .map_err(|e| ModuleError::connection(&port, format!("read failed: {e}")))?;

            let payload = &response[..response.len() - ACK.len()];
            let text = String::from_utf8_lossy(payload).trim().to_string();
            debug!(port = %port, command, response = %text, "Module command complete");
            Ok(text)
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl ModuleDriver for SerialModuleDriver {
    async fn connect(&mut self, port: &str) -> ModuleResult<DeviceInfo> {
        self.stream = Some(io::open(port, MODULE_BAUD_RATE)?);
        self.port = Some(port.to_string());

        let info = match self.send_command(DEVICE_INFO_COMMAND).await {
            Ok(response) => DeviceInfo::parse(&response).map_err(|_| {
                ModuleError::connection(port, format!("bad device info: {response:?}"))
            }),
            Err(e) => Err(e),
        };
        if info.is_err() {
            self.stream = None;
        }
        info
    }

    async fn disconnect(&mut self) -> ModuleResult<()> {
        // Dropping the stream closes the file descriptor
        self.stream = None;
        Ok(())
    }

    async fn enter_programming_mode(&mut self) -> ModuleResult<()> {
        let port = self.port_name();
        self.send_command(PROGRAMMING_MODE_COMMAND).await?;
        self.stream = None;

        tokio::time::sleep(PROGRAMMING_MODE_SETTLE).await;
        let trigger = io::open(&port, BOOTLOADER_TRIGGER_BAUD_RATE)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(trigger);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(not(feature = "serial"))]
#[async_trait]
impl ModuleDriver for SerialModuleDriver {
    async fn connect(&mut self, port: &str) -> ModuleResult<DeviceInfo> {
        self.port = Some(port.to_string());
        Err(ModuleError::SerialFeatureDisabled)
    }

    async fn disconnect(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    async fn enter_programming_mode(&mut self) -> ModuleResult<()> {
        Err(ModuleError::SerialFeatureDisabled)
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Factory producing [`SerialModuleDriver`]s.
#[derive(Debug, Clone, Copy)]
pub struct SerialDriverFactory {
    timeout: Duration,
}

impl SerialDriverFactory {
    /// Factory whose drivers use `timeout` for each command.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SerialDriverFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl DriverFactory for SerialDriverFactory {
    fn create(&self, module_type: ModuleType) -> Box<dyn ModuleDriver> {
        Box::new(SerialModuleDriver::new(module_type).with_timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_missing_port_fails() {
        let mut driver = SerialDriverFactory::default().create(ModuleType::MagDeck);
        let err = driver
            .connect("/dev/modules/does_not_exist_magdeck")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModuleError::Connection { .. } | ModuleError::SerialFeatureDisabled
        ));
        assert!(!driver.is_connected());
    }

    #[test]
    fn test_driver_keeps_module_type() {
        let driver = SerialModuleDriver::new(ModuleType::TempDeck);
        assert_eq!(driver.module_type(), ModuleType::TempDeck);
        assert!(driver.port_name().is_empty());
    }
}
