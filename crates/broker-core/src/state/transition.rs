//! Transition protocol.
//!
//! The only code allowed to change an order's state or list membership. A
//! transition runs under the order's lock:
//! 1. same state: nothing to do;
//! 2. resolve origin and destination lists (failure aborts before any change);
//! 3. unlink from the origin; if the order is no longer there, abort;
//! 4. set the state, append to the destination and persist the record.

use super::order::Order;
use super::registry::{OrderRegistry, RegistryError};
use broker_storage::{OrderStore, StorageError};
use broker_types::{truncate_id, OrderSpec, OrderState, OrderStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum TransitionError {
	#[error("Consistency error: {0}")]
	Consistency(String),
	#[error("Order already active: {0}")]
	AlreadyActive(String),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}

impl From<RegistryError> for TransitionError {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::Consistency(msg) => TransitionError::Consistency(msg),
			RegistryError::AlreadyActive(id) => TransitionError::AlreadyActive(id),
		}
	}
}

/// Applies state transitions to orders held by a registry.
pub struct Transitioner {
	registry: Arc<OrderRegistry>,
	store: OrderStore,
}

impl Transitioner {
	pub fn new(registry: Arc<OrderRegistry>, store: OrderStore) -> Self {
		Self { registry, store }
	}

	pub fn registry(&self) -> &Arc<OrderRegistry> {
		&self.registry
	}

	/// Registers a new order in the OPEN state and persists it.
	#[instrument(skip_all, fields(order_id = %truncate_id(&spec.id)))]
	pub async fn activate(&self, spec: OrderSpec) -> Result<Arc<Order>, TransitionError> {
		let order = Arc::new(Order::new(spec));
		let status = order.lock().await;
		self.registry.insert(order.clone())?;

		if let Err(e) = self.store.add(&order.record_with(&status)).await {
			self.registry.remove(order.id());
			tracing::error!(order_id = %truncate_id(order.id()), error = %e, "Failed to persist new order");
			return Err(e.into());
		}

		let remote = self.registry.is_remote(order.spec());
		self.registry.list_for(OrderState::Open, remote)?.add_item(order.clone());
		self.registry.add_dependencies(order.spec());
		drop(status);

		tracing::info!(
			order_id = %truncate_id(order.id()),
			resource = %order.spec().resource_type(),
			provider = %order.spec().provider,
			"Order activated"
		);
		Ok(order)
	}

	/// Takes the order's lock and moves it to `new_state`.
	///
	/// Returns whether this call moved the order.
	pub async fn transition(
		&self,
		order: &Arc<Order>,
		new_state: OrderState,
	) -> Result<bool, TransitionError> {
		let mut status = order.lock().await;
		self.transition_locked(order, &mut status, new_state).await
	}

	/// Moves an order whose lock the caller already holds.
	pub async fn transition_locked(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
		new_state: OrderState,
	) -> Result<bool, TransitionError> {
		let current = status.state;
		if current == new_state {
			return Ok(false);
		}

		let remote = self.registry.is_remote(order.spec());
		let origin = self.registry.list_for(current, remote)?;
		let destination = self.registry.list_for(new_state, remote)?;

		if !origin.remove_item(order.id()) {
			tracing::debug!(
				order_id = %truncate_id(order.id()),
				from = %current,
				to = %new_state,
				"Order no longer in its list, transition skipped"
			);
			return Ok(false);
		}

		status.state = new_state;
		destination.add_item(order.clone());
		tracing::info!(order_id = %truncate_id(order.id()), from = %current, to = %new_state, "Transitioned");

		if let Err(e) = self.store.update(&order.record_with(status)).await {
			tracing::error!(order_id = %truncate_id(order.id()), error = %e, "Failed to persist transition");
			return Err(e.into());
		}
		Ok(true)
	}

	/// Persists status changes that do not move the order.
	pub async fn persist_locked(
		&self,
		order: &Order,
		status: &OrderStatus,
	) -> Result<(), TransitionError> {
		self.store.update(&order.record_with(status)).await?;
		Ok(())
	}

	/// Evicts a CLOSED order: unlinks it, drops it from the id-map and stores
	/// it as DEACTIVATED.
	///
	/// Returns false when another task got there first.
	pub async fn deactivate(&self, order: &Arc<Order>) -> Result<bool, TransitionError> {
		let mut status = order.lock().await;
		if status.state != OrderState::Closed {
			return Ok(false);
		}
		let remote = self.registry.is_remote(order.spec());
		if !self.registry.list_for(OrderState::Closed, remote)?.remove_item(order.id()) {
			return Ok(false);
		}

		self.registry.remove(order.id());
		self.registry.release_dependencies(order.spec());
		status.state = OrderState::Deactivated;
		tracing::info!(order_id = %truncate_id(order.id()), "Order deactivated");

		self.store.update(&order.record_with(&status)).await?;
		Ok(true)
	}
}
