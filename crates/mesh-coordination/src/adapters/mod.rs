//! # Adapters
//!
//! Concrete implementations of the ports.
//!
//! - `time` - system and manual clocks
//! - `memory` - in-process hub transport
//! - `tcp` - length-prefixed TCP transport (requires "tcp" feature)
//! - `config` - TOML config loading (requires "config-file" feature)
//! - `collaborators` - default alert logger, recording protector, manual detector

mod close_signal;
pub mod collaborators;
pub mod memory;
pub mod time;

#[cfg(feature = "config-file")]
pub mod config;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use collaborators::{
    ManualDetector, RecordingProtectionEngine, TracingAlertLogger, DEFAULT_ALERT_HISTORY,
};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use time::{ManualTimeSource, SystemTimeSource};

#[cfg(feature = "config-file")]
pub use config::TomlConfigLoader;

#[cfg(feature = "tcp")]
pub use tcp::{TcpTransport, TcpTransportBinder};
