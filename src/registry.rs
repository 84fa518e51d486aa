//! Registry of attached modules.
//!
//! [`ModuleRegistry`] owns every module handle the process knows about. It is an
//! ordinary value: create one at startup and pass it to whatever needs modules.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use deck_modules::config::ModulesConfig;
//! use deck_modules::modules::SlotId;
//! use deck_modules::registry::ModuleRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ModulesConfig::load()?;
//!     let mut registry = ModuleRegistry::from_config(&config);
//!
//!     for module in registry.discover_and_connect().await? {
//!         println!("{} on {} ({})", module.module_type(), module.port(), module.state());
//!     }
//!
//!     let tempdeck = registry.load("tempdeck", SlotId::new(1)?)?;
//!     println!("loaded {:?}", tempdeck.labware());
//!     Ok(())
//! }
//! ```

use crate::config::ModulesConfig;
use crate::error::{ModuleError, ModuleResult};
use crate::firmware::{
    self, uploader, BootloaderTransition, FirmwareUpdateReport, FirmwareUploader, FlashTool,
};
use crate::modules::{
    ConnectionState, DriverFactory, Labware, Module, ModuleSummary, ModuleType,
    SerialDriverFactory, SimulatedDriverFactory, SlotId,
};
use crate::ports::PortDirectory;
use regex::{Regex, RegexBuilder};
use std::collections::btree_map::{BTreeMap, Entry};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static MODULE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    let names: Vec<&str> = ModuleType::ALL.iter().map(|t| t.name()).collect();
    RegexBuilder::new(&names.join("|"))
        .case_insensitive(true)
        .build()
        .expect("Invalid module name regex")
});

/// Module type named in a device entry, matched case-insensitively anywhere in
/// the name.
pub fn module_type_for_entry(entry: &str) -> Option<ModuleType> {
    MODULE_NAME_REGEX
        .find(entry)
        .and_then(|m| ModuleType::from_name(&m.as_str().to_lowercase()).ok())
}

/// Owner of all module handles.
pub struct ModuleRegistry {
    directory: PortDirectory,
    drivers: Arc<dyn DriverFactory>,
    transition: BootloaderTransition,
    uploader: FirmwareUploader,
    modules: Vec<Module>,
    simulated: BTreeMap<SlotId, Module>,
}

impl ModuleRegistry {
    /// Registry over `directory`, building drivers with `drivers`.
    ///
    /// The registry simulates whenever `directory` is not live.
    pub fn new(directory: PortDirectory, drivers: Arc<dyn DriverFactory>) -> Self {
        let config = ModulesConfig::default();
        Self {
            transition: BootloaderTransition::from_config(directory.clone(), &config.bootloader),
            uploader: FirmwareUploader::avrdude(directory.clone(), config.flash_tool),
            directory,
            drivers,
            modules: Vec::new(),
            simulated: BTreeMap::new(),
        }
    }

    /// Registry wired from configuration: serial drivers on live hardware,
    /// simulated drivers otherwise.
    pub fn from_config(config: &ModulesConfig) -> Self {
        let directory = PortDirectory::from_config(&config.hardware);
        let drivers: Arc<dyn DriverFactory> = if config.hardware.live {
            Arc::new(SerialDriverFactory::default())
        } else {
            Arc::new(SimulatedDriverFactory)
        };

        Self::new(directory.clone(), drivers)
            .with_transition(BootloaderTransition::from_config(
                directory.clone(),
                &config.bootloader,
            ))
            .with_uploader(FirmwareUploader::avrdude(directory, config.flash_tool.clone()))
    }

    /// Replace the bootloader transition.
    pub fn with_transition(mut self, transition: BootloaderTransition) -> Self {
        self.transition = transition;
        self
    }

    /// Replace the firmware uploader.
    pub fn with_uploader(mut self, uploader: FirmwareUploader) -> Self {
        self.uploader = uploader;
        self
    }

    /// Use `tool` for uploads, keeping the current flash settings.
    pub fn with_flash_tool(mut self, tool: Arc<dyn FlashTool>) -> Self {
        let config = self.uploader.config().clone();
        self.uploader = FirmwareUploader::new(self.directory.clone(), tool, config);
        self
    }

    /// Whether modules are virtual.
    pub fn is_simulating(&self) -> bool {
        !self.directory.is_live()
    }

    /// Device namespace in use.
    pub fn directory(&self) -> &PortDirectory {
        &self.directory
    }

    /// Discovered modules.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Virtual modules created by [`ModuleRegistry::load`] under simulation,
    /// one per slot, in slot order.
    pub fn simulated_modules(&self) -> impl ExactSizeIterator<Item = &Module> {
        self.simulated.values()
    }

    /// Get a module for `name` with labware for `slot` attached.
    ///
    /// Under simulation this always builds a new virtual module, replacing any
    /// earlier one loaded into the same slot. On hardware it
    /// returns the first connected module of that type; multiple modules of
    /// one type are not told apart.
    pub fn load(&mut self, name: &str, slot: SlotId) -> ModuleResult<&mut Module> {
        let module_type = ModuleType::from_name(name)?;
        let labware = Labware::new(name, slot);

        if self.is_simulating() {
            debug!(module = %module_type, slot = %slot, "Loading simulated module");
            let module = Module::simulated(module_type, labware);
            return Ok(match self.simulated.entry(slot) {
                Entry::Occupied(mut entry) => {
                    entry.insert(module);
                    entry.into_mut()
                }
                Entry::Vacant(entry) => entry.insert(module),
            });
        }

        let module = self
            .modules
            .iter_mut()
            .find(|m| {
                m.module_type() == module_type && m.state() == ConnectionState::Connected
            })
            .ok_or_else(|| ModuleError::AbsentModule(name.to_string()))?;
        module.set_labware(labware);
        info!(module = %module_type, port = %module.port(), slot = %slot, "Module loaded");
        Ok(module)
    }

    /// Rebuild the module set from the device namespace.
    ///
    /// Previous handles are disconnected and dropped first. Every entry whose
    /// name names a supported module gets a handle and a connect attempt; a
    /// failed connect is logged and the handle is kept unconnected.
    pub async fn discover_and_connect(&mut self) -> ModuleResult<&[Module]> {
        self.disconnect_all().await;
        self.modules.clear();

        let snapshot = self.directory.enumerate().await?;
        let mut discovered: Vec<Module> = snapshot
            .iter()
            .filter_map(|port| {
                let entry = Path::new(port).file_name()?.to_string_lossy().into_owned();
                let module_type = module_type_for_entry(&entry)?;
                Some(Module::new(module_type, port, self.drivers.create(module_type)))
            })
            .collect();

        debug!(
            count = discovered.len(),
            ports = ?discovered.iter().map(Module::port).collect::<Vec<_>>(),
            "Discovered modules"
        );

        for module in &mut discovered {
            if let Err(e) = module.connect().await {
                warn!(
                    module = %module.module_type(),
                    port = %module.port(),
                    error = %e,
                    "Failed to connect module"
                );
            }
        }

        self.modules = discovered;
        Ok(&self.modules)
    }

    /// Discovered module reporting `serial`.
    pub fn find_by_serial(&mut self, serial: &str) -> Option<&mut Module> {
        self.modules
            .iter_mut()
            .find(|m| m.device_info().serial() == Some(serial))
    }

    /// Rediscover, then update the module reporting `serial` with `firmware`.
    ///
    /// The image is removed afterwards in every case.
    pub async fn update_firmware(
        &mut self,
        serial: &str,
        firmware: &Path,
        tool_config: &Path,
    ) -> ModuleResult<FirmwareUpdateReport> {
        if let Err(e) = self.discover_and_connect().await {
            uploader::remove_image(firmware).await;
            return Err(e);
        }

        let Some(index) = self
            .modules
            .iter()
            .position(|m| m.device_info().serial() == Some(serial))
        else {
            uploader::remove_image(firmware).await;
            return Err(ModuleError::AbsentSerial(serial.to_string()));
        };

        info!(serial, port = %self.modules[index].port(), "Module with serial found");
        firmware::update_firmware(
            &self.transition,
            &self.uploader,
            &mut self.modules[index],
            firmware,
            tool_config,
        )
        .await
    }

    /// Discover and connect, summarize what answered, then release every port.
    ///
    /// The summaries show each module as it was right after connecting.
    pub async fn survey(&mut self) -> ModuleResult<Vec<ModuleSummary>> {
        let summaries = self
            .discover_and_connect()
            .await?
            .iter()
            .map(Module::summary)
            .collect();
        self.disconnect_all().await;
        Ok(summaries)
    }

    /// Disconnect every discovered module, logging failures.
    pub async fn disconnect_all(&mut self) {
        for module in &mut self.modules {
            if let Err(e) = module.disconnect().await {
                warn!(port = %module.port(), error = %e, "Failed to disconnect module");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{DeviceInfo, ModuleDriver};
    use async_trait::async_trait;
    use tracing_test::traced_test;

    /// Driver whose connect fails for magdecks.
    struct FlakyDriver(ModuleType);

    #[async_trait]
    impl ModuleDriver for FlakyDriver {
        async fn connect(&mut self, port: &str) -> ModuleResult<DeviceInfo> {
            match self.0 {
                ModuleType::MagDeck => Err(ModuleError::connection(port, "no response to M115")),
                ModuleType::TempDeck => Ok([("model", "temp_deck_v3"), ("serial", "TD03")]
                    .into_iter()
                    .collect()),
            }
        }

        async fn disconnect(&mut self) -> ModuleResult<()> {
            Ok(())
        }

        async fn enter_programming_mode(&mut self) -> ModuleResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    struct FlakyFactory;

    impl DriverFactory for FlakyFactory {
        fn create(&self, module_type: ModuleType) -> Box<dyn ModuleDriver> {
            Box::new(FlakyDriver(module_type))
        }
    }

    #[test]
    fn test_entry_matching_is_case_insensitive() {
        assert_eq!(module_type_for_entry("ttyACM0_tempdeck"), Some(ModuleType::TempDeck));
        assert_eq!(module_type_for_entry("ttyACM1_MagDeck"), Some(ModuleType::MagDeck));
        assert_eq!(
            module_type_for_entry("ttyn_TEMPDECK_bootloader"),
            Some(ModuleType::TempDeck)
        );
        assert_eq!(module_type_for_entry("ttyACM2_centrifuge"), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_failure_is_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ttyACM0_magdeck"), b"").unwrap();
        std::fs::write(tmp.path().join("ttyACM1_tempdeck"), b"").unwrap();

        let mut registry =
            ModuleRegistry::new(PortDirectory::new(tmp.path(), true), Arc::new(FlakyFactory));
        let modules = registry.discover_and_connect().await.unwrap();

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].module_type(), ModuleType::MagDeck);
        assert_eq!(modules[0].state(), ConnectionState::Disconnected);
        assert_eq!(modules[1].module_type(), ModuleType::TempDeck);
        assert_eq!(modules[1].state(), ConnectionState::Connected);
        assert!(logs_contain("Failed to connect module"));

        // An unconnected handle cannot be loaded
        let slot = SlotId::new(3).unwrap();
        assert!(matches!(
            registry.load("magdeck", slot),
            Err(ModuleError::AbsentModule(_))
        ));
        assert!(registry.load("tempdeck", slot).is_ok());
        assert!(registry.find_by_serial("TD03").is_some());
    }

    #[tokio::test]
    async fn test_rediscovery_drops_vanished_devices() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ttyACM0_tempdeck"), b"").unwrap();

        let mut registry =
            ModuleRegistry::new(PortDirectory::new(tmp.path(), true), Arc::new(FlakyFactory));
        assert_eq!(registry.discover_and_connect().await.unwrap().len(), 1);

        std::fs::remove_file(tmp.path().join("ttyACM0_tempdeck")).unwrap();
        assert!(registry.discover_and_connect().await.unwrap().is_empty());
        assert!(registry.modules().is_empty());
    }

    #[tokio::test]
    async fn test_simulation_never_discovers() {
        let mut registry =
            ModuleRegistry::new(PortDirectory::simulated(), Arc::new(SimulatedDriverFactory));
        assert!(registry.is_simulating());
        assert!(registry.discover_and_connect().await.unwrap().is_empty());
    }

    #[test]
    fn test_reloading_a_slot_replaces_its_virtual_module() {
        let mut registry =
            ModuleRegistry::new(PortDirectory::simulated(), Arc::new(SimulatedDriverFactory));
        let slot = SlotId::new(1).unwrap();

        for _ in 0..1000 {
            registry.load("tempdeck", slot).unwrap();
        }
        assert_eq!(registry.simulated_modules().len(), 1);

        registry.load("magdeck", slot).unwrap();
        let modules: Vec<&Module> = registry.simulated_modules().collect();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].module_type(), ModuleType::MagDeck);
    }
}
