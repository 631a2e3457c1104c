//! Order state: the in-memory order, the per-state lists, the registry that
//! owns them and the transition protocol that moves orders between them.

pub mod list;
pub mod order;
pub mod registry;
pub mod transition;

pub use list::{Identified, StateList};
pub use order::{Order, OrderGuard};
pub use registry::{OrderList, OrderRegistry, RegistryError};
pub use transition::{TransitionError, Transitioner};
