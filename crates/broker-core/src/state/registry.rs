//! Registry of active orders.
//!
//! Holds the id-map of every active order, one [`StateList`] per non-terminal
//! state and one list for orders served by remote providers. An active order
//! is in the id-map and in exactly one list; only the transition protocol
//! moves it between lists.

use super::list::StateList;
use super::order::Order;
use broker_types::{OrderSpec, OrderState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("Consistency error: {0}")]
	Consistency(String),
	#[error("Order already active: {0}")]
	AlreadyActive(String),
}

pub type OrderList = StateList<Arc<Order>>;

pub struct OrderRegistry {
	local_provider: String,
	orders: DashMap<String, Arc<Order>>,
	lists: HashMap<OrderState, Arc<OrderList>>,
	remote: Arc<OrderList>,
	/// Number of active orders embedding each order id.
	dependants: DashMap<String, usize>,
}

impl OrderRegistry {
	/// Creates an empty registry for the broker serving `local_provider`.
	pub fn new(local_provider: impl Into<String>) -> Self {
		let lists = OrderState::non_terminal()
			.filter(|state| *state != OrderState::Pending)
			.map(|state| (state, Arc::new(OrderList::new())))
			.collect();
		Self {
			local_provider: local_provider.into(),
			orders: DashMap::new(),
			lists,
			remote: Arc::new(OrderList::new()),
			dependants: DashMap::new(),
		}
	}

	pub fn local_provider(&self) -> &str {
		&self.local_provider
	}

	pub fn is_remote(&self, spec: &OrderSpec) -> bool {
		spec.is_provider_remote(&self.local_provider)
	}

	/// Resolves the list an order in `state` belongs to.
	///
	/// Orders served remotely sit in the remote list while the remote side
	/// drives them, and in the ordinary lists while the local side acts on
	/// them (before forwarding, or after a user intent).
	pub fn list_for(
		&self,
		state: OrderState,
		provider_is_remote: bool,
	) -> Result<&Arc<OrderList>, RegistryError> {
		match state {
			OrderState::Pending => Ok(&self.remote),
			OrderState::Spawning
			| OrderState::Fulfilled
			| OrderState::FailedAfterSuccessfulRequest
			| OrderState::UnableToCheckStatus
			| OrderState::Stopped
				if provider_is_remote =>
			{
				Ok(&self.remote)
			},
			OrderState::Deactivated => Err(RegistryError::Consistency(
				"DEACTIVATED orders are not kept in any list".to_string(),
			)),
			state => self.lists.get(&state).ok_or_else(|| {
				RegistryError::Consistency(format!("No list for state {}", state))
			}),
		}
	}

	/// List of the given state for locally served orders.
	pub fn state_list(&self, state: OrderState) -> Result<&Arc<OrderList>, RegistryError> {
		self.list_for(state, false)
	}

	/// List of orders whose remote provider currently drives them.
	pub fn remote_list(&self) -> &Arc<OrderList> {
		&self.remote
	}

	pub fn get(&self, order_id: &str) -> Option<Arc<Order>> {
		self.orders.get(order_id).map(|entry| entry.value().clone())
	}

	pub fn contains(&self, order_id: &str) -> bool {
		self.orders.contains_key(order_id)
	}

	pub fn len(&self) -> usize {
		self.orders.len()
	}

	pub fn is_empty(&self) -> bool {
		self.orders.is_empty()
	}

	/// Every active order, in no particular order.
	pub fn all_orders(&self) -> Vec<Arc<Order>> {
		self.orders.iter().map(|entry| entry.value().clone()).collect()
	}

	/// Number of active orders that embed `order_id`.
	pub fn dependant_count(&self, order_id: &str) -> usize {
		self.dependants.get(order_id).map(|c| *c).unwrap_or(0)
	}

	/// Inserts into the id-map, failing if the id is already active.
	pub(crate) fn insert(&self, order: Arc<Order>) -> Result<(), RegistryError> {
		match self.orders.entry(order.id().to_string()) {
			Entry::Occupied(_) => Err(RegistryError::AlreadyActive(order.id().to_string())),
			Entry::Vacant(entry) => {
				entry.insert(order);
				Ok(())
			},
		}
	}

	pub(crate) fn remove(&self, order_id: &str) -> Option<Arc<Order>> {
		self.orders.remove(order_id).map(|(_, order)| order)
	}

	pub(crate) fn add_dependencies(&self, spec: &OrderSpec) {
		for id in spec.resource.embedded_order_ids() {
			*self.dependants.entry(id.to_string()).or_insert(0) += 1;
		}
	}

	pub(crate) fn release_dependencies(&self, spec: &OrderSpec) {
		for id in spec.resource.embedded_order_ids() {
			if let Entry::Occupied(mut entry) = self.dependants.entry(id.to_string()) {
				if *entry.get() <= 1 {
					entry.remove();
				} else {
					*entry.get_mut() -= 1;
				}
			}
		}
	}

	/// Number of orders in each list, for startup and shutdown reports.
	pub fn list_sizes(&self) -> Vec<(String, usize)> {
		let mut sizes: Vec<(String, usize)> = OrderState::non_terminal()
			.filter_map(|state| {
				self.lists
					.get(&state)
					.map(|list| (state.to_string(), list.len()))
			})
			.collect();
		sizes.push(("REMOTE".to_string(), self.remote.len()));
		sizes
	}
}
