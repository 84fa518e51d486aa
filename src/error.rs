//! Error types for module discovery and firmware updates.
//!
//! `ModuleError` is the single error type returned by every fallible operation in
//! this crate. It is built with `thiserror` and groups failures into the kinds a
//! caller actually branches on:
//!
//! - **`UnsupportedModule`**: the requested module-type name is not one we know
//!   how to drive. This is a caller or configuration mistake.
//! - **`AbsentModule`**: the module type (or serial) is valid but nothing matching
//!   is currently attached. Retry after the hardware is plugged back in.
//! - **`Discovery`**: the device namespace could not be read, even after the
//!   single retry `PortDirectory` performs.
//! - **`Connection`**: a device did not answer, or its bootloader port never
//!   showed up within the polling bound.
//! - **`UploadFailure`**: the flashing tool did not report a verified write. The
//!   full tool output is kept for diagnostics.
//!
//! The remaining variants support those five (stale ports, handles used in the
//! wrong state, configuration problems, raw I/O). Use [`ModuleError::kind`] to
//! collapse any error into an [`ErrorKind`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Coarse classification of a [`ModuleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown module-type name.
    UnsupportedModule,
    /// Requested module is not attached.
    AbsentModule,
    /// Device namespace unreadable.
    Discovery,
    /// Device or bootloader port unreachable.
    Connection,
    /// Flashing tool did not verify the image.
    UploadFailure,
    /// Configuration or local I/O problem outside the hardware taxonomy.
    Other,
}

/// Errors raised while discovering, connecting or flashing modules.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// The module-type name is not supported.
    #[error("{0} is not a valid module")]
    UnsupportedModule(String),

    /// No module of the requested kind is connected.
    #[error("no module of name {0} is currently connected")]
    AbsentModule(String),

    /// No connected module reports the requested serial number.
    #[error("no module with serial {0} is currently connected")]
    AbsentSerial(String),

    /// The device namespace could not be enumerated.
    #[error("Module discovery failed: {0}")]
    Discovery(String),

    /// A module or its bootloader port could not be reached.
    #[error("Connection error on {port}: {reason}")]
    Connection {
        /// Port the failure relates to.
        port: String,
        /// What went wrong.
        reason: String,
    },

    /// The flashing tool did not report a verified write.
    #[error("Firmware upload failed:\n{output}")]
    UploadFailure {
        /// Captured output of the flashing tool.
        output: String,
    },

    /// The module's port is no longer present in the device namespace.
    #[error("Port {0} is no longer present; rediscover modules before retrying")]
    StalePort(String),

    /// The module handle is not in the state the operation requires.
    #[error("Module on {port} is {actual}, expected {expected}")]
    InvalidState {
        /// Port of the module.
        port: String,
        /// State the operation needs.
        expected: String,
        /// State the module is actually in.
        actual: String,
    },

    /// Real serial I/O was requested but the crate was built without it.
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    /// Build a [`ModuleError::Connection`] for `port`.
    pub fn connection(port: impl Into<String>, reason: impl Into<String>) -> Self {
        ModuleError::Connection {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModuleError::UnsupportedModule(_) => ErrorKind::UnsupportedModule,
            ModuleError::AbsentModule(_) | ModuleError::AbsentSerial(_) => {
                ErrorKind::AbsentModule
            }
            ModuleError::Discovery(_) => ErrorKind::Discovery,
            ModuleError::Connection { .. }
            | ModuleError::StalePort(_)
            | ModuleError::SerialFeatureDisabled => ErrorKind::Connection,
            ModuleError::UploadFailure { .. } => ErrorKind::UploadFailure,
            ModuleError::InvalidState { .. }
            | ModuleError::Config(_)
            | ModuleError::Configuration(_)
            | ModuleError::Io(_) => ErrorKind::Other,
        }
    }

    /// Whether retrying after a hardware change could succeed.
    pub fn can_recover(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AbsentModule | ErrorKind::Connection | ErrorKind::Discovery
        )
    }
}

impl From<figment::Error> for ModuleError {
    fn from(value: figment::Error) -> Self {
        ModuleError::Config(Box::new(value))
    }
}
