#![forbid(unsafe_code)]
//! Process supervision and the host-facing bridge for the mote runtime.
//!
//! [`Supervisor`] launches helper subprocesses with the IPC endpoint and
//! role in their environment, watches for exits, and restarts crashed
//! children up to a per-process cap. [`Bridge`] composes the supervisor
//! with the [`mote_ipc::Broker`] behind one façade: the GUI host starts
//! helpers, sends notifications, toggles the bubble, and receives helper
//! actions through [`BridgeCallbacks`].

mod bridge;
mod config;
mod error;
mod supervisor;

pub use bridge::{Bridge, BridgeCallbacks};
pub use config::{RuntimeConfig, CONFIG_DIR, CONFIG_FILE};
pub use error::RuntimeError;
pub use supervisor::{ProcessConfig, ProcessStatus, Supervisor};

#[cfg(test)]
mod tests;
