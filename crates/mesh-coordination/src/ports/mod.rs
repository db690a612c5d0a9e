//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Outbound:** transport channels and the clock the node requires
//! - **Collaborators:** capability interfaces for the detector, protector
//!   and logger roles

pub mod collaborators;
pub mod outbound;

pub use collaborators::{AlertCallback, AlertLogger, Detector, ProtectionEngine};
pub use outbound::{InboundFrame, TimeSource, Transport, TransportBinder};
