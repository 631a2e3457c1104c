//! Order lifecycle engine for the federated resource broker.
//!
//! Orders live in an in-memory registry, one list per lifecycle state. A
//! background processor per state walks its list and drives each order
//! forward through the local cloud plugins or the peer that serves it. Every
//! state change goes through the transition protocol, which keeps the lists
//! and the persisted records in step.

pub mod builder;
pub mod connector;
pub mod controller;
pub mod engine;
pub mod processors;
pub mod recovery;
pub mod state;

#[cfg(test)]
mod test_support;

pub use builder::{build_cloud_plugins, BrokerBuilder, BrokerFactories, BuilderError};
pub use controller::{ControllerError, FederationEndpoint, InstanceStatus, OrderController};
pub use engine::{BrokerEngine, EngineError};
pub use processors::{ProcessorKind, ProcessorsController};
pub use recovery::{RecoveryReport, RecoveryService};
pub use state::{Order, OrderRegistry, Transitioner};
