//! # Deck Modules
//!
//! Discovery, bootloader entry and firmware flashing for the temperature and
//! magnetic deck modules plugged into a liquid-handling robot over USB serial.
//!
//! The hard part is that a module's device node is not stable. Resetting into
//! the bootloader drops the node and brings up a new one, and older and newer
//! firmware generations name that node differently. The crate handles this by
//! diffing snapshots of the device namespace and by bounded polling.
//!
//! ## Crate Structure
//!
//! - **`ports`**: `PortDirectory` snapshots the device namespace; `new_ports`
//!   diffs two snapshots.
//! - **`modules`**: the `Module` handle, its `ModuleType`, `DeviceInfo` and
//!   `ConnectionState`, plus the `ModuleDriver` trait with serial and simulated
//!   drivers.
//! - **`firmware`**: `BootloaderTransition` (the bounded state machine),
//!   `FirmwareUploader` (avrdude wrapper) and the combined `update_firmware`.
//! - **`registry`**: `ModuleRegistry`, the owner of all handles, with `load`,
//!   `discover_and_connect` and update-by-serial.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the `ModuleError` taxonomy.

pub mod config;
pub mod error;
pub mod firmware;
pub mod logging;
pub mod modules;
pub mod ports;
pub mod registry;

pub use error::{ErrorKind, ModuleError, ModuleResult};
pub use firmware::{update_firmware, BootloaderTransition, FirmwareUpdateReport, FirmwareUploader};
pub use modules::{ConnectionState, Module, ModuleType, SlotId};
pub use ports::{new_ports, PortDirectory, PortSnapshot};
pub use registry::ModuleRegistry;
