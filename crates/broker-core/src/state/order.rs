//! In-memory order.
//!
//! Pairs the immutable spec with the mutable status behind the order's own
//! lock. Whoever holds the lock may inspect the status, call out to a cloud or
//! peer, and move the order through the transition protocol in one critical
//! section.

use super::list::Identified;
use broker_types::{OrderRecord, OrderSpec, OrderState, OrderStatus};
use tokio::sync::{Mutex, MutexGuard};

/// Exclusive access to an order's status.
pub type OrderGuard<'a> = MutexGuard<'a, OrderStatus>;

#[derive(Debug)]
pub struct Order {
	spec: OrderSpec,
	status: Mutex<OrderStatus>,
}

impl Order {
	/// Creates a new order in the OPEN state.
	pub fn new(spec: OrderSpec) -> Self {
		Self {
			spec,
			status: Mutex::new(OrderStatus::default()),
		}
	}

	/// Rebuilds an order from its persisted record.
	pub fn from_record(record: OrderRecord) -> Self {
		Self {
			spec: record.spec,
			status: Mutex::new(record.status),
		}
	}

	pub fn id(&self) -> &str {
		&self.spec.id
	}

	pub fn spec(&self) -> &OrderSpec {
		&self.spec
	}

	/// Waits for and takes the order's lock.
	pub async fn lock(&self) -> OrderGuard<'_> {
		self.status.lock().await
	}

	/// Current state. Takes the lock briefly.
	pub async fn state(&self) -> OrderState {
		self.status.lock().await.state
	}

	/// Copy of the current status.
	pub async fn status(&self) -> OrderStatus {
		self.status.lock().await.clone()
	}

	/// Record of the order with the given status.
	pub fn record_with(&self, status: &OrderStatus) -> OrderRecord {
		OrderRecord {
			spec: self.spec.clone(),
			status: status.clone(),
		}
	}

	/// Record of the order as it is now.
	pub async fn record(&self) -> OrderRecord {
		let status = self.status.lock().await;
		self.record_with(&status)
	}
}

impl Identified for std::sync::Arc<Order> {
	fn id(&self) -> &str {
		&self.spec.id
	}
}
