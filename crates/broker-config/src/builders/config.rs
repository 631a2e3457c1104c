//! Configuration builder for creating test and development configurations.
//!
//! Produces a valid single-provider configuration with in-memory storage and
//! one simulated cloud, with short processor intervals.

use crate::{
	ApiConfig, BrokerConfig, CloudConfig, CloudEntry, Config, FederationConfig,
	ProcessorsConfig, StorageConfig,
};
use broker_types::PeerConfig;
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	provider_id: String,
	storage_primary: String,
	storage_cleanup_interval_seconds: u64,
	processors: ProcessorsConfig,
	clouds: HashMap<String, CloudEntry>,
	default_cloud: String,
	peers: HashMap<String, PeerConfig>,
	transport: Option<String>,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	/// Creates a new `ConfigBuilder` with default values suitable for testing.
	pub fn new() -> Self {
		let mut clouds = HashMap::new();
		clouds.insert(
			"default".to_string(),
			CloudEntry {
				implementation: "simulated".to_string(),
				config: toml::Value::Table(toml::Table::new()),
			},
		);
		Self {
			provider_id: "provider-a".to_string(),
			storage_primary: "memory".to_string(),
			storage_cleanup_interval_seconds: 60,
			processors: ProcessorsConfig {
				open_sleep_ms: 10,
				spawning_sleep_ms: 10,
				fulfilled_sleep_ms: 10,
				failed_sleep_ms: 10,
				unable_to_check_status_sleep_ms: 10,
				stopping_sleep_ms: 10,
				assigned_for_deletion_sleep_ms: 10,
				checking_deletion_sleep_ms: 10,
				closed_sleep_ms: 10,
				remote_sync_sleep_ms: 10,
			},
			clouds,
			default_cloud: "default".to_string(),
			peers: HashMap::new(),
			transport: None,
			api: None,
		}
	}

	/// Sets the provider id of this broker.
	pub fn provider_id(mut self, id: impl Into<String>) -> Self {
		self.provider_id = id.into();
		self
	}

	/// Sets the primary storage implementation.
	pub fn storage_primary(mut self, primary: impl Into<String>) -> Self {
		self.storage_primary = primary.into();
		self
	}

	/// Sets the storage cleanup interval in seconds.
	pub fn storage_cleanup_interval_seconds(mut self, interval: u64) -> Self {
		self.storage_cleanup_interval_seconds = interval;
		self
	}

	/// Replaces every processor interval.
	pub fn processors(mut self, processors: ProcessorsConfig) -> Self {
		self.processors = processors;
		self
	}

	/// Adds or replaces a cloud served by the given plugin implementation.
	pub fn cloud(mut self, name: impl Into<String>, implementation: impl Into<String>) -> Self {
		self.clouds.insert(
			name.into(),
			CloudEntry {
				implementation: implementation.into(),
				config: toml::Value::Table(toml::Table::new()),
			},
		);
		self
	}

	/// Adds a federation peer and selects the transport used to reach it.
	pub fn peer(
		mut self,
		provider_id: impl Into<String>,
		url: impl Into<String>,
		transport: impl Into<String>,
	) -> Self {
		self.peers
			.insert(provider_id.into(), PeerConfig { url: url.into() });
		self.transport = Some(transport.into());
		self
	}

	/// Sets the API configuration.
	pub fn api(mut self, api: Option<ApiConfig>) -> Self {
		self.api = api;
		self
	}

	/// Builds the `Config` with the configured values.
	pub fn build(self) -> Config {
		let mut storage_implementations = HashMap::new();
		storage_implementations.insert(
			self.storage_primary.clone(),
			toml::Value::Table(toml::Table::new()),
		);

		let federation = self.transport.map(|primary| {
			let mut transports = HashMap::new();
			transports.insert(primary.clone(), toml::Value::Table(toml::Table::new()));
			FederationConfig {
				primary,
				transports,
				peers: self.peers,
			}
		});

		Config {
			broker: BrokerConfig {
				provider_id: self.provider_id,
			},
			storage: StorageConfig {
				primary: self.storage_primary,
				implementations: storage_implementations,
				cleanup_interval_seconds: self.storage_cleanup_interval_seconds,
			},
			processors: self.processors,
			cloud: CloudConfig {
				default_cloud: self.default_cloud,
				clouds: self.clouds,
			},
			federation,
			api: self.api,
		}
	}
}
