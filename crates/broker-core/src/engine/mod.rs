//! Broker engine: owns the registry and every component built around it.
//!
//! Assembly recovers the persisted orders before any processor task exists.
//! Running starts the processors and the storage cleanup task, then waits for
//! a shutdown signal.

use crate::connector::{AuditService, CloudConnectorFactory};
use crate::controller::{DrainBarrier, FederationEndpoint, OrderController};
use crate::processors::{ProcessorContext, ProcessorsController};
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::state::{OrderRegistry, Transitioner};
use arc_swap::ArcSwap;
use broker_cloud::CloudPlugins;
use broker_config::{Config, ProcessorsConfig};
use broker_federation::{FederationHandler, PeerTransportInterface};
use broker_storage::{OrderStore, StorageService};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Main broker engine.
pub struct BrokerEngine {
	config: Config,
	storage: Arc<StorageService>,
	registry: Arc<OrderRegistry>,
	plugins: Arc<ArcSwap<CloudPlugins>>,
	barrier: Arc<DrainBarrier>,
	controller: Arc<OrderController>,
	processors: Arc<ProcessorsController>,
	recovery: RecoveryReport,
}

impl BrokerEngine {
	/// Wires the components together and restores the persisted orders.
	pub async fn assemble(
		config: Config,
		storage: Arc<StorageService>,
		plugins: CloudPlugins,
		transport: Option<Arc<dyn PeerTransportInterface>>,
	) -> Result<Self, EngineError> {
		let registry = Arc::new(OrderRegistry::new(config.broker.provider_id.clone()));
		let store = OrderStore::new(storage.clone());

		let recovery = RecoveryService::new(registry.clone(), store.clone())
			.recover_state()
			.await
			.map_err(|e| EngineError::Service(format!("Recovery failed: {}", e)))?;

		let plugins = Arc::new(ArcSwap::from_pointee(plugins));
		let transitioner = Arc::new(Transitioner::new(registry.clone(), store.clone()));
		let connectors = Arc::new(CloudConnectorFactory::new(
			registry.clone(),
			plugins.clone(),
			transport,
			AuditService::new(storage.clone()),
		));
		let barrier = Arc::new(DrainBarrier::new());
		let controller = Arc::new(OrderController::new(
			transitioner.clone(),
			connectors.clone(),
			store,
			barrier.clone(),
		));
		let context = Arc::new(ProcessorContext {
			transitioner,
			connectors,
		});
		let processors = ProcessorsController::new(context, config.processors.clone())
			.map_err(|e| EngineError::Config(e.to_string()))?;

		Ok(Self {
			config,
			storage,
			registry,
			plugins,
			barrier,
			controller,
			processors: Arc::new(processors),
			recovery,
		})
	}

	/// Runs until Ctrl+C.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.run_until(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!(error = %e, "Failed to listen for shutdown signal");
			}
		})
		.await
	}

	/// Runs until `shutdown` completes, then stops every task.
	pub async fn run_until<F>(&self, shutdown: F) -> Result<(), EngineError>
	where
		F: Future<Output = ()>,
	{
		tracing::info!(
			provider = %self.config.broker.provider_id,
			recovered = self.recovery.total_orders,
			clouds = self.plugins.load().len(),
			"Broker engine started"
		);
		self.processors.start_all();

		let storage = self.storage.clone();
		let cleanup_interval = tokio::time::interval(Duration::from_secs(
			self.config.storage.cleanup_interval_seconds,
		));
		let cleanup_handle = tokio::spawn(async move {
			let mut interval = cleanup_interval;
			loop {
				interval.tick().await;
				match storage.cleanup_expired().await {
					Ok(count) if count > 0 => {
						tracing::debug!(component = "storage", count, "Removed expired entries");
					},
					Err(e) => {
						tracing::warn!(component = "storage", error = %e, "Storage cleanup failed");
					},
					_ => {},
				}
			}
		});

		shutdown.await;
		tracing::info!("Shutdown signal received");

		cleanup_handle.abort();
		self.shutdown().await;
		Ok(())
	}

	/// Stops the processors and reports what is left in each list.
	pub async fn shutdown(&self) {
		self.processors.stop_all().await;
		for (list, count) in self.registry.list_sizes() {
			if count > 0 {
				tracing::info!(list = %list, count, "Orders left for the next start");
			}
		}
	}

	/// Replaces the cloud plugins once in-flight requests have drained.
	///
	/// Processor tasks keep running; each plugin call loads the current map.
	pub async fn reload_cloud_plugins(&self, plugins: CloudPlugins) {
		self.barrier.drain().await;
		let clouds = plugins.cloud_names();
		self.plugins.store(Arc::new(plugins));
		self.barrier.resume();
		tracing::info!(component = "cloud", clouds = ?clouds, "Cloud plugins reloaded");
	}

	pub fn reset_sleep_times(&self, sleep_times: ProcessorsConfig) {
		self.processors.reset_sleep_times(sleep_times);
	}

	/// Handler serving this broker's orders to its peers.
	pub fn federation_handler(&self) -> Arc<dyn FederationHandler> {
		Arc::new(FederationEndpoint::new(self.controller.clone()))
	}

	pub fn controller(&self) -> &Arc<OrderController> {
		&self.controller
	}

	pub fn processors(&self) -> &Arc<ProcessorsController> {
		&self.processors
	}

	pub fn registry(&self) -> &Arc<OrderRegistry> {
		&self.registry
	}

	pub fn recovery_report(&self) -> &RecoveryReport {
		&self.recovery
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}
}
