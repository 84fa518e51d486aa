//! Module handles and the data they carry.
//!
//! A [`Module`] is the mutable handle for one attached deck module (or one
//! virtual module under simulation). It owns the driver used to talk to the
//! device and records what the rest of the crate needs to know about it:
//!
//! - its [`ModuleType`], fixed at construction
//! - the device path it currently answers on, which changes whenever the board
//!   resets into or out of its bootloader
//! - the `M115` [`DeviceInfo`] reported on connect
//! - its [`ConnectionState`]
//! - optional [`Labware`] attached by the registry
//!
//! Operations that move a module between ports (`BootloaderTransition`,
//! `FirmwareUploader`) take `&mut Module`, so only one of them can hold a
//! handle at a time.

pub mod driver;
pub mod serial;

pub use driver::{DriverFactory, ModuleDriver, SimulatedDriver, SimulatedDriverFactory};
pub use serial::{SerialDriverFactory, SerialModuleDriver};

use crate::error::{ModuleError, ModuleResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Model identifiers of boards shipped with the old bootloader.
pub const LEGACY_BOOTLOADER_MODELS: [&str; 2] = ["temp_deck_v1", "temp_deck_v2"];

/// Port recorded on virtual modules.
pub const SIMULATED_PORT: &str = "simulated";

// =============================================================================
// Module type
// =============================================================================

/// Kinds of module this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// Magnetic deck
    MagDeck,
    /// Temperature deck
    TempDeck,
}

impl ModuleType {
    /// Every supported type.
    pub const ALL: [ModuleType; 2] = [ModuleType::MagDeck, ModuleType::TempDeck];

    /// Name used in device entries and load requests.
    pub fn name(self) -> &'static str {
        match self {
            ModuleType::MagDeck => "magdeck",
            ModuleType::TempDeck => "tempdeck",
        }
    }

    /// Look up a type by its exact name.
    pub fn from_name(name: &str) -> ModuleResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ModuleError::UnsupportedModule(name.to_string()))
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModuleType {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

// =============================================================================
// Connection state / bootloader style
// =============================================================================

/// Where a module handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No open connection.
    Disconnected,
    /// Application firmware answering on `port`.
    Connected,
    /// Bootloader answering on `port`, ready to be flashed.
    ProgrammingMode,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::ProgrammingMode => "in programming mode",
        };
        f.write_str(s)
    }
}

/// How a board's bootloader shows up in the device namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootloaderStyle {
    /// Bootloader port looks like any other port; found by diffing snapshots.
    Legacy,
    /// Bootloader port name carries a marker suffix.
    Marked,
}

impl BootloaderStyle {
    /// Style implied by a reported model identifier.
    pub fn for_model(model: Option<&str>) -> Self {
        match model {
            Some(m) if LEGACY_BOOTLOADER_MODELS.contains(&m) => BootloaderStyle::Legacy,
            _ => BootloaderStyle::Marked,
        }
    }
}

// =============================================================================
// Device info
// =============================================================================

/// Key/value pairs a module reports about itself.
///
/// Modules answer `M115` with a line like
/// `serial:TD2018053002 model:temp_deck_v2 version:edge-1a2b3c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceInfo(BTreeMap<String, String>);

impl DeviceInfo {
    /// Parse an `M115` response. The `model` key is required.
    pub fn parse(response: &str) -> ModuleResult<Self> {
        let info: Self = response
            .split_whitespace()
            .filter_map(|field| field.split_once(':'))
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .collect();

        if info.model().is_none() {
            return Err(ModuleError::connection(
                "",
                format!("device info response has no model: {response:?}"),
            ));
        }
        Ok(info)
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Reported model identifier.
    pub fn model(&self) -> Option<&str> {
        self.get("model")
    }

    /// Reported serial number.
    pub fn serial(&self) -> Option<&str> {
        self.get("serial")
    }

    /// Reported firmware version.
    pub fn version(&self) -> Option<&str> {
        self.get("version")
    }

    /// Whether nothing has been reported yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceInfo {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// =============================================================================
// Labware
// =============================================================================

/// Deck slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotId(u8);

impl SlotId {
    /// Highest slot on the deck.
    pub const MAX: u8 = 12;

    /// Validated slot id.
    pub fn new(slot: u8) -> ModuleResult<Self> {
        if (1..=Self::MAX).contains(&slot) {
            Ok(Self(slot))
        } else {
            Err(ModuleError::Configuration(format!(
                "slot {slot} out of range (1-{})",
                Self::MAX
            )))
        }
    }

    /// Slot number.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SlotId {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slot = s
            .trim()
            .parse::<u8>()
            .map_err(|_| ModuleError::Configuration(format!("invalid slot '{s}'")))?;
        Self::new(slot)
    }
}

/// Labware placed on a module.
///
/// Geometry lives elsewhere; the registry only records what was loaded where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Labware {
    /// Labware definition name
    pub name: String,
    /// Deck slot it sits in
    pub slot: SlotId,
}

impl Labware {
    /// Labware entry for `name` in `slot`.
    pub fn new(name: impl Into<String>, slot: SlotId) -> Self {
        Self {
            name: name.into(),
            slot,
        }
    }
}

// =============================================================================
// Module handle
// =============================================================================

/// Handle for one attached (or virtual) module.
pub struct Module {
    module_type: ModuleType,
    port: String,
    device_info: DeviceInfo,
    state: ConnectionState,
    bootloader: Option<BootloaderStyle>,
    labware: Option<Labware>,
    driver: Box<dyn ModuleDriver>,
}

impl Module {
    /// Disconnected handle for a module of `module_type` on `port`.
    pub fn new(
        module_type: ModuleType,
        port: impl Into<String>,
        driver: Box<dyn ModuleDriver>,
    ) -> Self {
        Self {
            module_type,
            port: port.into(),
            device_info: DeviceInfo::default(),
            state: ConnectionState::Disconnected,
            bootloader: None,
            labware: None,
            driver,
        }
    }

    /// Magnetic deck on `port`.
    pub fn mag_deck(port: impl Into<String>, driver: Box<dyn ModuleDriver>) -> Self {
        Self::new(ModuleType::MagDeck, port, driver)
    }

    /// Temperature deck on `port`.
    pub fn temp_deck(port: impl Into<String>, driver: Box<dyn ModuleDriver>) -> Self {
        Self::new(ModuleType::TempDeck, port, driver)
    }

    /// Virtual module bound to `labware`. Never touches hardware.
    pub fn simulated(module_type: ModuleType, labware: Labware) -> Self {
        let driver = SimulatedDriver::new(module_type);
        let device_info = driver.device_info();
        let mut module = Self::new(module_type, SIMULATED_PORT, Box::new(driver));
        module.bootloader = Some(BootloaderStyle::for_model(device_info.model()));
        module.device_info = device_info;
        module.state = ConnectionState::Connected;
        module.labware = Some(labware);
        module
    }

    /// Module type.
    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    /// Device path the module currently answers on.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Information reported on the last successful connect.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attached labware, if any.
    pub fn labware(&self) -> Option<&Labware> {
        self.labware.as_ref()
    }

    /// Whether this handle is a virtual module.
    pub fn is_simulated(&self) -> bool {
        self.port == SIMULATED_PORT
    }

    /// Bootloader style, fixed by the first successful connect.
    pub fn bootloader_style(&self) -> BootloaderStyle {
        self.bootloader
            .unwrap_or_else(|| BootloaderStyle::for_model(self.device_info.model()))
    }

    /// Open the driver on the current port and read device info.
    pub async fn connect(&mut self) -> ModuleResult<()> {
        match self.driver.connect(&self.port).await {
            Ok(info) => {
                if self.bootloader.is_none() {
                    self.bootloader = Some(BootloaderStyle::for_model(info.model()));
                }
                info!(
                    module = %self.module_type,
                    port = %self.port,
                    model = info.model().unwrap_or("unknown"),
                    serial = info.serial().unwrap_or("unknown"),
                    "Module connected"
                );
                self.device_info = info;
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Release the OS handle on the current port.
    ///
    /// The handle is marked disconnected even if the driver reports an error.
    pub async fn disconnect(&mut self) -> ModuleResult<()> {
        let result = self.driver.disconnect().await;
        self.state = ConnectionState::Disconnected;
        if let Err(ref e) = result {
            warn!(module = %self.module_type, port = %self.port, error = %e, "Disconnect failed");
        }
        result
    }

    /// Attach labware.
    pub fn set_labware(&mut self, labware: Labware) {
        self.labware = Some(labware);
    }

    /// Ask the firmware to reset into its bootloader.
    ///
    /// A driver that released its port before failing leaves the handle
    /// disconnected.
    pub(crate) async fn request_programming_mode(&mut self) -> ModuleResult<()> {
        let result = self.driver.enter_programming_mode().await;
        if result.is_err() && !self.driver.is_connected() {
            self.state = ConnectionState::Disconnected;
        }
        result
    }

    pub(crate) fn set_port(&mut self, port: impl Into<String>) {
        self.port = port.into();
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn require_state(&self, expected: ConnectionState) -> ModuleResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ModuleError::InvalidState {
                port: self.port.clone(),
                expected: expected.to_string(),
                actual: self.state.to_string(),
            })
        }
    }

    /// Serializable view of this handle.
    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            module_type: self.module_type,
            port: self.port.clone(),
            state: self.state,
            device_info: self.device_info.clone(),
            labware: self.labware.clone(),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("module_type", &self.module_type)
            .field("port", &self.port)
            .field("device_info", &self.device_info)
            .field("state", &self.state)
            .field("labware", &self.labware)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a module handle for display and JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    /// Module type
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    /// Current port
    pub port: String,
    /// Connection state
    pub state: ConnectionState,
    /// Reported device info
    pub device_info: DeviceInfo,
    /// Attached labware
    pub labware: Option<Labware>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_type_names() {
        assert_eq!(ModuleType::from_name("magdeck").unwrap(), ModuleType::MagDeck);
        assert_eq!("tempdeck".parse::<ModuleType>().unwrap(), ModuleType::TempDeck);
        assert!(matches!(
            ModuleType::from_name("centrifuge"),
            Err(ModuleError::UnsupportedModule(name)) if name == "centrifuge"
        ));
        assert_eq!(ModuleType::TempDeck.to_string(), "tempdeck");
    }

    #[test]
    fn test_parse_device_info() {
        let info =
            DeviceInfo::parse("serial:TD2018053002 model:temp_deck_v2 version:edge-1a2b3c\r\n")
                .unwrap();
        assert_eq!(info.serial(), Some("TD2018053002"));
        assert_eq!(info.model(), Some("temp_deck_v2"));
        assert_eq!(info.version(), Some("edge-1a2b3c"));
    }

    #[test]
    fn test_parse_device_info_requires_model() {
        let err = DeviceInfo::parse("serial:MD01 version:v1.0.2").unwrap_err();
        assert!(matches!(err, ModuleError::Connection { .. }));
    }

    #[test]
    fn test_bootloader_style_from_model() {
        assert_eq!(
            BootloaderStyle::for_model(Some("temp_deck_v1")),
            BootloaderStyle::Legacy
        );
        assert_eq!(
            BootloaderStyle::for_model(Some("temp_deck_v2")),
            BootloaderStyle::Legacy
        );
        assert_eq!(
            BootloaderStyle::for_model(Some("temp_deck_v3")),
            BootloaderStyle::Marked
        );
        assert_eq!(
            BootloaderStyle::for_model(Some("mag_deck_v1")),
            BootloaderStyle::Marked
        );
        assert_eq!(BootloaderStyle::for_model(None), BootloaderStyle::Marked);
    }

    #[test]
    fn test_slot_range() {
        assert_eq!(SlotId::new(1).unwrap().get(), 1);
        assert_eq!("12".parse::<SlotId>().unwrap().get(), 12);
        assert!(SlotId::new(0).is_err());
        assert!(SlotId::new(13).is_err());
        assert!("A1".parse::<SlotId>().is_err());
    }

    #[test]
    fn test_simulated_module_is_connected_with_labware() {
        let slot = SlotId::new(4).unwrap();
        let module = Module::simulated(ModuleType::MagDeck, Labware::new("magdeck", slot));

        assert!(module.is_simulated());
        assert_eq!(module.state(), ConnectionState::Connected);
        assert_eq!(module.labware().map(|lw| lw.slot), Some(slot));
        assert!(module.device_info().model().is_some());
    }

    #[tokio::test]
    async fn test_bootloader_style_fixed_by_first_connect() {
        let driver = SimulatedDriver::new(ModuleType::TempDeck).with_model("temp_deck_v1");
        let mut module = Module::temp_deck("/dev/modules/ttyACM0_tempdeck", Box::new(driver));
        assert_eq!(module.state(), ConnectionState::Disconnected);

        module.connect().await.unwrap();
        assert_eq!(module.state(), ConnectionState::Connected);
        assert_eq!(module.bootloader_style(), BootloaderStyle::Legacy);

        // A later report with a different model does not reclassify the handle
        module.device_info = [("model", "temp_deck_v3")].into_iter().collect();
        assert_eq!(module.bootloader_style(), BootloaderStyle::Legacy);
    }
}
