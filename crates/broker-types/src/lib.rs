//! Common types for the resource broker.
//!
//! This crate defines the data model shared by every broker component: orders
//! and their lifecycle states, cloud instances, quotas and images, storage keys,
//! and the configuration validation framework used by pluggable implementations.

/// Cloud-side resource types: instances, quotas, images and security rules.
pub mod cloud;
/// Order model: immutable request, mutable status and lifecycle states.
pub mod order;
/// Addressing of federation peers.
pub mod peers;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage namespaces for persisted data.
pub mod storage;
/// Small helpers shared across crates.
pub mod utils;
/// Configuration validation types for implementation configs.
pub mod validation;

pub use cloud::*;
pub use order::*;
pub use peers::{PeerConfig, PeersConfig};
pub use registry::ImplementationRegistry;
pub use storage::StorageKey;
pub use utils::{new_order_id, truncate_id};
pub use validation::*;
