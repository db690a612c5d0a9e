//! Domain Layer - Pure in-memory logic with no I/O
//!
//! - Identifiers, roles, statuses and timestamps
//! - The peer registry and its invariants
//! - Wire messages and their typed payloads
//! - Policy deep merge
//! - Node configuration

pub mod config;
pub mod errors;
pub mod message;
pub mod policy;
pub mod registry;
pub mod value_objects;

pub use config::*;
pub use errors::*;
pub use message::*;
pub use policy::*;
pub use registry::*;
pub use value_objects::*;
