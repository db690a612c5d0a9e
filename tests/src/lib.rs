//! # Sentinel Mesh Test Suite
//!
//! Cross-node flows: several `SecurityNode`s wired together and driven
//! through their public API.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs       # Mesh fixture: shared hub, clock, per-node collaborators
//!     ├── mesh_flows.rs    # Discovery, relay, staleness, policy, commands
//!     └── tcp_loopback.rs  # Same flows over real sockets
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p mesh-tests
//! RUST_LOG=mesh_coordination=debug cargo test -p mesh-tests -- --nocapture
//! ```

pub mod integration;
