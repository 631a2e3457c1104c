//! Audit trail of cloud plugin calls.
//!
//! Every call the local connector makes to a plugin is recorded in the
//! `audit` storage namespace. Recording is best effort: a storage failure is
//! logged and never fails the audited operation.

use broker_storage::{StorageError, StorageService};
use broker_types::{new_order_id, ResourceType, StorageKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One audited plugin call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
	pub operation: String,
	#[serde(default)]
	pub order_id: Option<String>,
	#[serde(default)]
	pub resource_type: Option<ResourceType>,
	pub cloud_name: String,
	pub user_id: String,
	/// "ok", or the error the plugin returned.
	pub outcome: String,
	pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditService {
	storage: Arc<StorageService>,
}

impl AuditService {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	pub async fn record(&self, entry: AuditEntry) {
		if let Err(e) = self
			.storage
			.store(StorageKey::Audit.as_str(), &new_order_id(), &entry)
			.await
		{
			tracing::warn!(component = "audit", operation = %entry.operation, error = %e, "Failed to record audit entry");
		}
	}

	/// Every recorded entry, oldest first.
	pub async fn entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
		let mut entries: Vec<AuditEntry> = self
			.storage
			.retrieve_all::<AuditEntry>(StorageKey::Audit.as_str())
			.await?
			.into_iter()
			.map(|(_, entry)| entry)
			.collect();
		entries.sort_by_key(|entry| entry.timestamp);
		Ok(entries)
	}
}
