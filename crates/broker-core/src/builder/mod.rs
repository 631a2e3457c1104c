//! Builder for constructing broker engines.
//!
//! Composes a [`BrokerEngine`] from the configured storage, cloud plugin and
//! federation transport implementations using factory functions keyed by
//! implementation name.

use crate::engine::BrokerEngine;
use broker_cloud::{CloudError, CloudPluginInterface, CloudPlugins};
use broker_config::{CloudConfig, Config};
use broker_federation::{PeerTransportInterface, TransportError};
use broker_storage::{StorageError, StorageInterface, StorageService};
use broker_types::PeersConfig;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for every pluggable component, keyed by implementation name.
pub struct BrokerFactories<SF, CF, TF> {
	pub storage_factories: HashMap<String, SF>,
	pub cloud_factories: HashMap<String, CF>,
	pub transport_factories: HashMap<String, TF>,
}

/// Creates one plugin per configured cloud.
pub fn build_cloud_plugins<CF>(
	config: &CloudConfig,
	factories: &HashMap<String, CF>,
) -> Result<CloudPlugins, BuilderError>
where
	CF: Fn(&toml::Value) -> Result<Box<dyn CloudPluginInterface>, CloudError>,
{
	let mut plugins: HashMap<String, Arc<dyn CloudPluginInterface>> = HashMap::new();
	for (cloud_name, entry) in &config.clouds {
		let factory = factories.get(&entry.implementation).ok_or_else(|| {
			BuilderError::MissingComponent(format!(
				"cloud plugin implementation '{}' for cloud '{}'",
				entry.implementation, cloud_name
			))
		})?;
		match factory(&entry.config) {
			Ok(plugin) => {
				let is_default = &config.default_cloud == cloud_name;
				tracing::info!(component = "cloud", cloud = %cloud_name, implementation = %entry.implementation, default = %is_default, "Loaded");
				plugins.insert(cloud_name.clone(), Arc::from(plugin));
			},
			Err(e) => {
				tracing::error!(
					component = "cloud",
					cloud = %cloud_name,
					error = %e,
					"Failed to create cloud plugin"
				);
				return Err(BuilderError::Config(format!(
					"Failed to create cloud plugin for '{}': {}",
					cloud_name, e
				)));
			},
		}
	}

	if !plugins.contains_key(&config.default_cloud) {
		return Err(BuilderError::Config(format!(
			"Default cloud '{}' is not configured",
			config.default_cloud
		)));
	}
	Ok(CloudPlugins::new(plugins))
}

/// Builder for constructing a BrokerEngine with pluggable implementations.
pub struct BrokerBuilder {
	config: Config,
}

impl BrokerBuilder {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Builds the engine, recovering the persisted orders on the way.
	pub async fn build<SF, CF, TF>(
		self,
		factories: BrokerFactories<SF, CF, TF>,
	) -> Result<BrokerEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		CF: Fn(&toml::Value) -> Result<Box<dyn CloudPluginInterface>, CloudError>,
		TF: Fn(&toml::Value, &PeersConfig) -> Result<Box<dyn PeerTransportInterface>, TransportError>,
	{
		// Create storage implementations
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			if let Some(factory) = factories.storage_factories.get(name) {
				match factory(config) {
					Ok(implementation) => {
						storage_impls.insert(name.clone(), implementation);
						let is_primary = &self.config.storage.primary == name;
						tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Failed to create storage implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create storage implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}

		if storage_impls.is_empty() {
			return Err(BuilderError::Config(
				"No valid storage implementations available".into(),
			));
		}

		let primary_storage = &self.config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::Config(format!(
				"Primary storage '{}' failed to load or has invalid configuration",
				primary_storage
			))
		})?;
		let storage = Arc::new(StorageService::new(storage_backend));

		let plugins = build_cloud_plugins(&self.config.cloud, &factories.cloud_factories)?;

		// Federation is optional; a broker without it serves local orders only.
		let transport: Option<Arc<dyn PeerTransportInterface>> = match &self.config.federation {
			Some(federation) => {
				let factory = factories
					.transport_factories
					.get(&federation.primary)
					.ok_or_else(|| {
						BuilderError::MissingComponent(format!(
							"transport implementation '{}'",
							federation.primary
						))
					})?;
				let empty = toml::Value::Table(toml::Table::new());
				let transport_config = federation.transports.get(&federation.primary).unwrap_or(&empty);
				match factory(transport_config, &federation.peers) {
					Ok(transport) => {
						tracing::info!(component = "federation", implementation = %federation.primary, peers = federation.peers.len(), "Loaded");
						Some(Arc::from(transport))
					},
					Err(e) => {
						tracing::error!(
							component = "federation",
							implementation = %federation.primary,
							error = %e,
							"Failed to create transport"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create transport '{}': {}",
							federation.primary, e
						)));
					},
				}
			},
			None => {
				tracing::info!(component = "federation", "No federation configured, serving local orders only");
				None
			},
		};

		BrokerEngine::assemble(self.config, storage, plugins, transport)
			.await
			.map_err(|e| BuilderError::Config(e.to_string()))
	}
}
