//! Device namespace enumeration and diffing.
//!
//! Modules show up as entries under a single directory (`/dev/modules` on the
//! robot). Their names are not stable: a reset into the bootloader drops the
//! node and brings up a new one, possibly renumbered or renamed. This module
//! gives the rest of the crate two primitives to cope with that:
//!
//! - [`PortDirectory`] takes a point-in-time [`PortSnapshot`] of the namespace.
//! - [`new_ports`] / [`PortSnapshot::new_since`] tell which entries appeared
//!   between two snapshots.

mod diff;
mod directory;

pub use diff::{new_ports, PortSnapshot};
pub use directory::PortDirectory;
