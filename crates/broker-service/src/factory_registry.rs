//! Factory registry for the broker's pluggable implementations.
//!
//! Collects the factories every implementation crate exports, so the engine
//! can be built from configuration by implementation name.

use broker_cloud::CloudPluginFactory;
use broker_config::Config;
use broker_core::{BrokerBuilder, BrokerEngine, BrokerFactories};
use broker_federation::TransportFactory;
use broker_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Global registry for all implementation factories
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub cloud: HashMap<String, CloudPluginFactory>,
	pub transport: HashMap<String, TransportFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			cloud: HashMap::new(),
			transport: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_cloud(&mut self, name: impl Into<String>, factory: CloudPluginFactory) {
		self.cloud.insert(name.into(), factory);
	}

	pub fn register_transport(&mut self, name: impl Into<String>, factory: TransportFactory) {
		self.transport.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Initialize the global registry with all available implementations
pub fn initialize_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in broker_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in broker_cloud::get_all_implementations() {
			tracing::debug!("Registering cloud plugin implementation: {}", name);
			registry.register_cloud(name, factory);
		}

		for (name, factory) in broker_federation::get_all_implementations() {
			tracing::debug!("Registering transport implementation: {}", name);
			registry.register_transport(name, factory);
		}

		registry
	})
}

pub fn get_registry() -> &'static FactoryRegistry {
	initialize_registry()
}

/// Macro to build factories from config implementations
macro_rules! build_factories {
	($registry:expr, $names:expr, $registry_field:ident, $type_name:literal) => {{
		let mut factories = HashMap::new();
		for name in $names {
			if let Some(factory) = $registry.$registry_field.get(name) {
				factories.insert(name.clone(), *factory);
			} else {
				let mut available: Vec<_> = $registry.$registry_field.keys().cloned().collect();
				available.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					$type_name,
					name,
					available.join(", ")
				)
				.into());
			}
		}
		factories
	}};
}

/// Build the broker engine using the registry and config
pub async fn build_broker_from_config(
	config: Config,
) -> Result<BrokerEngine, Box<dyn std::error::Error>> {
	let registry = get_registry();

	let storage_factories = build_factories!(
		registry,
		config.storage.implementations.keys(),
		storage,
		"storage"
	);
	let cloud_factories = build_factories!(
		registry,
		config.cloud.clouds.values().map(|entry| &entry.implementation),
		cloud,
		"cloud plugin"
	);
	let transport_factories = match &config.federation {
		Some(federation) => {
			build_factories!(registry, federation.transports.keys(), transport, "transport")
		},
		None => HashMap::new(),
	};

	let factories = BrokerFactories {
		storage_factories,
		cloud_factories,
		transport_factories,
	};

	Ok(BrokerBuilder::new(config).build(factories).await?)
}
