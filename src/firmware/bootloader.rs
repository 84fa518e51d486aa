//! Moving a module into its bootloader and finding the port it comes back on.
//!
//! Entering the bootloader resets the microcontroller. Its device node goes
//! away and a new one shows up, and how to recognise the new one depends on the
//! firmware generation:
//!
//! - **Legacy** boards (`temp_deck_v1`, `temp_deck_v2`) re-enumerate under an
//!   ordinary name. The bootloader port is whatever appeared since the snapshot
//!   taken before the reset.
//! - **Marked** boards bring the bootloader up under a name ending in the
//!   bootloader suffix. The port is accepted only when exactly one such entry
//!   exists.
//!
//! ```text
//! Connected -> ProgrammingModeRequested -> Disconnected -> Polling -> Found
//!                                                                 \-> TimedOut
//! ```
//!
//! Polling runs as one task under `tokio::time::timeout`. The deadline cancels
//! the loop at its next await point; a check already running when the deadline
//! passes may finish slightly late.

use crate::config::BootloaderConfig;
use crate::error::{ModuleError, ModuleResult};
use crate::modules::{BootloaderStyle, ConnectionState, Module};
use crate::ports::{PortDirectory, PortSnapshot};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// States of a bootloader transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    /// Module running application firmware.
    Connected,
    /// Programming-mode command sent.
    ProgrammingModeRequested,
    /// Operating port released.
    Disconnected,
    /// Watching the namespace for the bootloader port.
    Polling,
    /// Bootloader port found (terminal).
    Found,
    /// Bound expired without a port (terminal).
    TimedOut,
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    /// Final state, always [`TransitionState::Found`].
    pub state: TransitionState,
    /// Bootloader port now recorded on the module.
    pub port: String,
    /// Port the module answered on before the transition.
    pub previous_port: String,
    /// Time spent polling.
    pub elapsed: Duration,
}

/// Drives a connected module into its bootloader.
#[derive(Debug, Clone)]
pub struct BootloaderTransition {
    directory: PortDirectory,
    timeout: Duration,
    poll_interval: Duration,
    port_suffix: String,
}

impl BootloaderTransition {
    /// Transition over `directory` with default bounds.
    pub fn new(directory: PortDirectory) -> Self {
        Self::from_config(directory, &BootloaderConfig::default())
    }

    /// Transition over `directory` using the `[bootloader]` settings.
    pub fn from_config(directory: PortDirectory, config: &BootloaderConfig) -> Self {
        Self {
            directory,
            timeout: config.port_search_timeout,
            poll_interval: config.poll_interval,
            port_suffix: config.port_suffix.clone(),
        }
    }

    /// Override the polling bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the delay between namespace checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Polling bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Put `module` into programming mode and record its bootloader port.
    ///
    /// On success the module is in [`ConnectionState::ProgrammingMode`] on the
    /// bootloader port. If the programming-mode request fails the module keeps
    /// its port, and stays connected unless the driver already closed it. If
    /// the port never shows up the module is left disconnected and must be
    /// rediscovered.
    pub async fn run(&self, module: &mut Module) -> ModuleResult<TransitionReport> {
        module.require_state(ConnectionState::Connected)?;

        let before = self.directory.enumerate().await?;
        if self.directory.is_live() && !before.contains(module.port()) {
            return Err(ModuleError::StalePort(module.port().to_string()));
        }

        let previous_port = module.port().to_string();
        let style = module.bootloader_style();
        let mut state = TransitionState::Connected;

        if let Err(e) = module.request_programming_mode().await {
            warn!(port = %previous_port, error = %e, "Programming mode request failed");
            return Err(match e {
                ModuleError::Connection { .. } => e,
                other => ModuleError::connection(&previous_port, other.to_string()),
            });
        }
        self.advance(&mut state, TransitionState::ProgrammingModeRequested, &previous_port);

        if let Err(e) = module.disconnect().await {
            // The board is resetting anyway; keep looking for the new port
            debug!(port = %previous_port, error = %e, "Ignoring disconnect error");
        }
        self.advance(&mut state, TransitionState::Disconnected, &previous_port);

        self.advance(&mut state, TransitionState::Polling, &previous_port);
        let started = Instant::now();
        let found = tokio::time::timeout(self.timeout, self.poll(style, &before)).await;
        let elapsed = started.elapsed();

        match found {
            Ok(port) => {
                self.advance(&mut state, TransitionState::Found, &port);
                module.set_port(port.clone());
                module.set_state(ConnectionState::ProgrammingMode);
                info!(
                    previous_port = %previous_port,
                    port = %port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Bootloader port found"
                );
                Ok(TransitionReport {
                    state,
                    port,
                    previous_port,
                    elapsed,
                })
            }
            Err(_) => {
                self.advance(&mut state, TransitionState::TimedOut, &previous_port);
                warn!(
                    port = %previous_port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Bootloader port not found"
                );
                Err(ModuleError::connection(
                    previous_port,
                    format!(
                        "bootloader port not found within {:?} (waited {:?})",
                        self.timeout, elapsed
                    ),
                ))
            }
        }
    }

    /// Loop until a bootloader port is accepted. Cancelled by the caller's timeout.
    async fn poll(&self, style: BootloaderStyle, before: &PortSnapshot) -> String {
        loop {
            match self.directory.enumerate().await {
                Ok(current) => {
                    if let Some(port) = self.accept(style, before, &current) {
                        return port;
                    }
                }
                Err(e) => debug!(error = %e, "Namespace unreadable while polling"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn accept(
        &self,
        style: BootloaderStyle,
        before: &PortSnapshot,
        current: &PortSnapshot,
    ) -> Option<String> {
        match style {
            BootloaderStyle::Legacy => current.first_new_since(before),
            BootloaderStyle::Marked => {
                let mut candidates = current.with_suffix(&self.port_suffix);
                if candidates.len() == 1 {
                    candidates.pop()
                } else {
                    if candidates.len() > 1 {
                        debug!(?candidates, "Several bootloader ports, waiting");
                    }
                    None
                }
            }
        }
    }

    fn advance(&self, state: &mut TransitionState, next: TransitionState, port: &str) {
        debug!(port, from = %state, to = %next, "Bootloader transition");
        *state = next;
    }
}
