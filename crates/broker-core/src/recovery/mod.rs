//! Rebuilds the in-memory registry from persisted order records.
//!
//! Runs once at startup, before any processor task exists. Every record in a
//! non-terminal state is loaded oldest first and placed in the list the
//! current state resolves to, so processing resumes where it stopped.

use crate::state::{Order, OrderRegistry, RegistryError};
use broker_storage::{OrderStore, StorageError};
use broker_types::{truncate_id, OrderState};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Registry error: {0}")]
	Registry(#[from] RegistryError),
}

/// Result of a recovery run.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Total number of orders restored.
	pub total_orders: usize,
	/// Restored orders per state name.
	pub per_state: BTreeMap<String, usize>,
	/// Records skipped because their id was already active.
	pub duplicates: usize,
}

pub struct RecoveryService {
	registry: Arc<OrderRegistry>,
	store: OrderStore,
}

impl RecoveryService {
	pub fn new(registry: Arc<OrderRegistry>, store: OrderStore) -> Self {
		Self { registry, store }
	}

	/// Loads every active order into the registry.
	#[instrument(skip_all)]
	pub async fn recover_state(&self) -> Result<RecoveryReport, RecoveryError> {
		tracing::info!("Starting state recovery from storage");
		let mut report = RecoveryReport::default();

		let mut grouped = self.store.read_all_active_orders().await?;
		for state in OrderState::non_terminal() {
			let Some(records) = grouped.remove(&state) else {
				continue;
			};

			let mut restored = 0;
			for record in records {
				let order = Arc::new(Order::from_record(record));
				match self.registry.insert(order.clone()) {
					Ok(()) => {},
					Err(RegistryError::AlreadyActive(id)) => {
						tracing::warn!(order_id = %truncate_id(&id), state = %state, "Duplicate order record skipped");
						report.duplicates += 1;
						continue;
					},
					Err(e) => return Err(e.into()),
				}
				let remote = self.registry.is_remote(order.spec());
				self.registry.list_for(state, remote)?.add_item(order.clone());
				self.registry.add_dependencies(order.spec());
				restored += 1;
			}

			tracing::debug!(state = %state, count = restored, "Restored orders");
			report.total_orders += restored;
			report.per_state.insert(state.to_string(), restored);
		}

		if report.total_orders == 0 {
			tracing::info!("No active orders to recover");
		} else {
			tracing::info!(
				total = report.total_orders,
				duplicates = report.duplicates,
				"Recovery complete"
			);
		}
		Ok(report)
	}
}
