//! # Security Node Service
//!
//! The `SecurityNode` facade and the three loops it drives.
//!
//! - `core`: builder, lifecycle and public API
//! - `discovery`, `heartbeat`, `router`: one module per loop
//! - `delivery`: outbound fan-out and relay shared by all of them
//! - `commands`: remote operations

mod commands;
mod core;
mod delivery;
mod discovery;
mod heartbeat;
mod router;

pub use commands::{Command, CHANGE_ROLE, RESTART, UPDATE_CONFIG};
pub use core::{NodeSnapshot, SecurityNode, SecurityNodeBuilder};
