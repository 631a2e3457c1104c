//! Order persistence.
//!
//! The order store is the system of record the lifecycle engine writes to on
//! every transition and reads back in a single scan at startup. Records are
//! never deleted: deactivated orders stay in storage as history.

use crate::{StorageError, StorageService};
use broker_types::{OrderRecord, OrderState, StorageKey};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed access to persisted order records.
#[derive(Clone)]
pub struct OrderStore {
	storage: Arc<StorageService>,
}

impl OrderStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Persists a newly activated order.
	pub async fn add(&self, record: &OrderRecord) -> Result<(), StorageError> {
		self.storage
			.store(StorageKey::Orders.as_str(), &record.spec.id, record)
			.await
	}

	/// Overwrites the record of a known order.
	pub async fn update(&self, record: &OrderRecord) -> Result<(), StorageError> {
		self.storage
			.update(StorageKey::Orders.as_str(), &record.spec.id, record)
			.await
	}

	pub async fn get(&self, order_id: &str) -> Result<OrderRecord, StorageError> {
		self.storage
			.retrieve(StorageKey::Orders.as_str(), order_id)
			.await
	}

	/// Returns the orders persisted in `state`, oldest first.
	pub async fn read_active_orders(
		&self,
		state: OrderState,
	) -> Result<Vec<OrderRecord>, StorageError> {
		Ok(self
			.read_all_active_orders()
			.await?
			.remove(&state)
			.unwrap_or_default())
	}

	/// Reads every record once and groups the non-terminal ones by state,
	/// each group oldest first.
	pub async fn read_all_active_orders(
		&self,
	) -> Result<HashMap<OrderState, Vec<OrderRecord>>, StorageError> {
		let mut grouped: HashMap<OrderState, Vec<OrderRecord>> = HashMap::new();
		for (_, record) in self
			.storage
			.retrieve_all::<OrderRecord>(StorageKey::Orders.as_str())
			.await?
		{
			if record.status.state.is_terminal() {
				continue;
			}
			grouped.entry(record.status.state).or_default().push(record);
		}

		for records in grouped.values_mut() {
			records.sort_by(|a, b| {
				a.spec
					.created_at
					.cmp(&b.spec.created_at)
					.then_with(|| a.spec.id.cmp(&b.spec.id))
			});
		}
		Ok(grouped)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use crate::StorageInterface;
	use async_trait::async_trait;
	use broker_types::{ConfigSchema, OrderSpec, OrderStatus, ResourceSpec, SystemUser, VolumeSpec};
	use chrono::{Duration, Utc};
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// Memory backend that counts key listings.
	#[derive(Default)]
	struct CountingStorage {
		inner: MemoryStorage,
		listings: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl StorageInterface for CountingStorage {
		async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
			self.inner.get_bytes(key).await
		}

		async fn set_bytes(
			&self,
			key: &str,
			value: Vec<u8>,
			ttl: Option<std::time::Duration>,
		) -> Result<(), StorageError> {
			self.inner.set_bytes(key, value, ttl).await
		}

		async fn delete(&self, key: &str) -> Result<(), StorageError> {
			self.inner.delete(key).await
		}

		async fn exists(&self, key: &str) -> Result<bool, StorageError> {
			self.inner.exists(key).await
		}

		async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
			self.listings.fetch_add(1, Ordering::SeqCst);
			self.inner.list_keys(prefix).await
		}

		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.inner.config_schema()
		}
	}

	fn record(state: OrderState, age_secs: i64) -> OrderRecord {
		let mut spec = OrderSpec::new(
			"local",
			"local",
			"default",
			SystemUser {
				user_id: "u".into(),
				user_name: "u".into(),
				identity_provider_id: "local".into(),
			},
			ResourceSpec::Volume(VolumeSpec {
				name: None,
				size_gb: 1,
			}),
		);
		spec.created_at = Utc::now() - Duration::seconds(age_secs);
		OrderRecord {
			spec,
			status: OrderStatus {
				state,
				..Default::default()
			},
		}
	}

	#[tokio::test]
	async fn test_read_active_orders_filters_and_orders_by_age() {
		let store = OrderStore::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))));
		let newer = record(OrderState::Open, 10);
		let older = record(OrderState::Open, 100);
		let spawning = record(OrderState::Spawning, 50);
		for r in [&newer, &older, &spawning] {
			store.add(r).await.unwrap();
		}

		let open = store.read_active_orders(OrderState::Open).await.unwrap();
		let ids: Vec<_> = open.iter().map(|r| r.spec.id.clone()).collect();
		assert_eq!(ids, vec![older.spec.id.clone(), newer.spec.id.clone()]);

		let spawning_orders = store.read_active_orders(OrderState::Spawning).await.unwrap();
		assert_eq!(spawning_orders.len(), 1);
		assert!(store
			.read_active_orders(OrderState::Closed)
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn test_grouped_read_scans_once_and_skips_history() {
		let backend = CountingStorage::default();
		let listings = backend.listings.clone();
		let store = OrderStore::new(Arc::new(StorageService::new(Box::new(backend))));

		let older = record(OrderState::Fulfilled, 100);
		let newer = record(OrderState::Fulfilled, 10);
		let open = record(OrderState::Open, 5);
		let history = record(OrderState::Deactivated, 500);
		for r in [&newer, &older, &open, &history] {
			store.add(r).await.unwrap();
		}

		let grouped = store.read_all_active_orders().await.unwrap();
		assert_eq!(listings.load(Ordering::SeqCst), 1);
		assert_eq!(grouped.len(), 2);
		let fulfilled: Vec<_> = grouped[&OrderState::Fulfilled]
			.iter()
			.map(|r| r.spec.id.clone())
			.collect();
		assert_eq!(fulfilled, vec![older.spec.id.clone(), newer.spec.id.clone()]);
		assert_eq!(grouped[&OrderState::Open].len(), 1);
		assert!(!grouped.contains_key(&OrderState::Deactivated));
	}

	#[tokio::test]
	async fn test_update_unknown_order_fails() {
		let store = OrderStore::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))));
		let r = record(OrderState::Open, 0);
		assert!(matches!(store.update(&r).await, Err(StorageError::NotFound)));

		store.add(&r).await.unwrap();
		let mut moved = r.clone();
		moved.status.state = OrderState::Spawning;
		store.update(&moved).await.unwrap();
		assert_eq!(
			store.get(&r.spec.id).await.unwrap().status.state,
			OrderState::Spawning
		);
	}
}
