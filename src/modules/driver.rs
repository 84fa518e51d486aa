//! Driver abstraction between module handles and the device they talk to.
//!
//! [`ModuleDriver`] is the seam between module bookkeeping and I/O. Real
//! modules use [`SerialModuleDriver`](super::SerialModuleDriver); simulation
//! and tests use [`SimulatedDriver`] or their own implementations.

use super::{DeviceInfo, ModuleType};
use crate::error::ModuleResult;
use async_trait::async_trait;

/// Connection to one module's firmware.
#[async_trait]
pub trait ModuleDriver: Send {
    /// Open `port` and return the device's self-reported information.
    async fn connect(&mut self, port: &str) -> ModuleResult<DeviceInfo>;

    /// Close the connection. Closing an already closed driver is a no-op.
    async fn disconnect(&mut self) -> ModuleResult<()>;

    /// Ask the firmware to reset into its bootloader.
    ///
    /// After this returns the device is expected to drop off its current port.
    async fn enter_programming_mode(&mut self) -> ModuleResult<()>;

    /// Whether a connection is currently open.
    fn is_connected(&self) -> bool;
}

/// Builds drivers for newly discovered modules.
pub trait DriverFactory: Send + Sync {
    /// Fresh, unconnected driver for a module of `module_type`.
    fn create(&self, module_type: ModuleType) -> Box<dyn ModuleDriver>;
}

/// In-memory driver used for virtual modules.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    module_type: ModuleType,
    model: String,
    port: Option<String>,
}

impl SimulatedDriver {
    /// Driver reporting a simulated model for `module_type`.
    pub fn new(module_type: ModuleType) -> Self {
        let model = match module_type {
            ModuleType::MagDeck => "mag_deck_sim",
            ModuleType::TempDeck => "temp_deck_sim",
        };
        Self {
            module_type,
            model: model.to_string(),
            port: None,
        }
    }

    /// Override the reported model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Information this driver reports on connect.
    pub fn device_info(&self) -> DeviceInfo {
        [
            ("serial", format!("{}-sim", self.module_type.name())),
            ("model", self.model.clone()),
            ("version", "sim".to_string()),
        ]
        .into_iter()
        .collect()
    }
}

#[async_trait]
impl ModuleDriver for SimulatedDriver {
    async fn connect(&mut self, port: &str) -> ModuleResult<DeviceInfo> {
        self.port = Some(port.to_string());
        Ok(self.device_info())
    }

    async fn disconnect(&mut self) -> ModuleResult<()> {
        self.port = None;
        Ok(())
    }

    async fn enter_programming_mode(&mut self) -> ModuleResult<()> {
        // Virtual boards have no bootloader to reset into
        self.port = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

/// Factory producing [`SimulatedDriver`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedDriverFactory;

impl DriverFactory for SimulatedDriverFactory {
    fn create(&self, module_type: ModuleType) -> Box<dyn ModuleDriver> {
        Box::new(SimulatedDriver::new(module_type))
    }
}
