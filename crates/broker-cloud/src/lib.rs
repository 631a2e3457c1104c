//! Cloud plugin module for the resource broker.
//!
//! A cloud plugin drives one cloud owned by the local provider. The broker
//! hands it resource requests and polls it for the state of the instances it
//! created. Plugins report raw cloud-side state strings; the broker maps them
//! through the plugin's own `is_ready`, `has_failed` and `is_stopped`
//! predicates, so each plugin keeps its cloud's vocabulary.

use async_trait::async_trait;
use broker_types::{
	Allocation, ComputeQuota, ConfigSchema, ImageSummary, ImplementationRegistry,
	ResourceSpec, ResourceType, SecurityRule, SystemUser,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod simulated;
}

/// Errors reported by cloud plugins.
///
/// `NotFound` means the cloud answered and the resource does not exist.
/// `Unavailable` means the cloud could not be asked; callers retry later.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
	#[error("Instance not found: {0}")]
	NotFound(String),
	#[error("Request failed: {0}")]
	Failed(String),
	#[error("Cloud unavailable: {0}")]
	Unavailable(String),
	#[error("Unauthorized: {0}")]
	Unauthorized(String),
	#[error("Unsupported operation: {0}")]
	Unsupported(String),
	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// A resource request as handed to a plugin.
///
/// Embedded order ids inside `resource` have already been replaced by the
/// cloud-side instance ids of the referenced orders.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRequest {
	pub order_id: String,
	pub system_user: SystemUser,
	pub resource: ResourceSpec,
}

impl PluginRequest {
	pub fn resource_type(&self) -> ResourceType {
		self.resource.resource_type()
	}
}

/// A resource as reported by the cloud, before state normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudInstance {
	pub id: String,
	/// Raw state string in the cloud's own vocabulary.
	pub cloud_state: String,
	pub attributes: BTreeMap<String, String>,
	/// Resources actually granted, when the cloud reports them.
	pub allocation: Option<Allocation>,
	pub fault_message: Option<String>,
}

/// Trait defining the interface of a cloud plugin.
#[async_trait]
pub trait CloudPluginInterface: Send + Sync {
	/// Returns the configuration schema for this plugin.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Asks the cloud to create the resource, returning its cloud-side id.
	async fn request_instance(&self, request: &PluginRequest) -> Result<String, CloudError>;

	/// Fetches the current state of a resource.
	async fn get_instance(
		&self,
		resource: ResourceType,
		instance_id: &str,
	) -> Result<CloudInstance, CloudError>;

	/// Deletes a resource. Deleting a missing resource returns `NotFound`.
	async fn delete_instance(
		&self,
		resource: ResourceType,
		instance_id: &str,
	) -> Result<(), CloudError>;

	/// Stops (powers off) a compute instance without releasing it.
	async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError>;

	/// Whether the raw state means the resource is usable.
	fn is_ready(&self, cloud_state: &str) -> bool;

	/// Whether the raw state means the resource is broken.
	fn has_failed(&self, cloud_state: &str) -> bool;

	/// Whether the raw state means the resource is stopped.
	fn is_stopped(&self, _cloud_state: &str) -> bool {
		false
	}

	/// Whether the raw state means a stop is already in progress.
	fn is_stopping(&self, _cloud_state: &str) -> bool {
		false
	}

	async fn get_user_quota(&self, user: &SystemUser) -> Result<ComputeQuota, CloudError>;

	async fn get_all_images(&self, user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError>;

	async fn get_image(
		&self,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, CloudError>;

	/// Lists the security rules attached to a network or public IP instance.
	async fn get_security_rules(
		&self,
		instance_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, CloudError>;

	/// Creates a security rule on an instance, returning the rule id.
	async fn request_security_rule(
		&self,
		instance_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, CloudError>;

	async fn delete_security_rule(
		&self,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), CloudError>;
}

/// Type alias for cloud plugin factory functions.
pub type CloudPluginFactory =
	fn(&toml::Value) -> Result<Box<dyn CloudPluginInterface>, CloudError>;

/// Registry trait for cloud plugin implementations.
pub trait CloudPluginRegistry: ImplementationRegistry<Factory = CloudPluginFactory> {}

/// Get all registered cloud plugin implementations.
pub fn get_all_implementations() -> Vec<(&'static str, CloudPluginFactory)> {
	use implementations::simulated;

	vec![(simulated::Registry::NAME, simulated::Registry::factory())]
}

/// The plugins serving the local provider's clouds, keyed by cloud name.
#[derive(Clone, Default)]
pub struct CloudPlugins {
	plugins: HashMap<String, Arc<dyn CloudPluginInterface>>,
}

impl CloudPlugins {
	pub fn new(plugins: HashMap<String, Arc<dyn CloudPluginInterface>>) -> Self {
		Self { plugins }
	}

	/// Returns the plugin serving `cloud_name`.
	pub fn get(&self, cloud_name: &str) -> Result<Arc<dyn CloudPluginInterface>, CloudError> {
		self.plugins.get(cloud_name).cloned().ok_or_else(|| {
			CloudError::Configuration(format!("No plugin configured for cloud '{}'", cloud_name))
		})
	}

	/// Names of the configured clouds, sorted.
	pub fn cloud_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.plugins.keys().cloned().collect();
		names.sort();
		names
	}

	pub fn len(&self) -> usize {
		self.plugins.len()
	}

	pub fn is_empty(&self) -> bool {
		self.plugins.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::simulated::SimulatedCloud;

	#[test]
	fn test_registered_implementations() {
		let names: Vec<_> = get_all_implementations()
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		assert_eq!(names, vec!["simulated"]);
	}

	#[test]
	fn test_plugin_lookup_by_cloud_name() {
		let mut map: HashMap<String, Arc<dyn CloudPluginInterface>> = HashMap::new();
		map.insert("east".into(), Arc::new(SimulatedCloud::default()));
		let plugins = CloudPlugins::new(map);

		assert!(plugins.get("east").is_ok());
		assert!(matches!(
			plugins.get("west"),
			Err(CloudError::Configuration(_))
		));
		assert_eq!(plugins.cloud_names(), vec!["east".to_string()]);
	}
}
