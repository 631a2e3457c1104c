//! In-process simulated cloud.
//!
//! Keeps instances in memory and moves them through an OpenStack-like state
//! vocabulary (`build`, `active`, `stopping`, `shutoff`, `error`). A new
//! instance stays in `build` for `ready_after_polls` reads and then becomes
//! `active`. Quota is enforced against the compute instances it holds.
//!
//! The operator hooks (`set_unavailable`, `fail_instance`, `forget_instance`)
//! reproduce cloud outages, broken instances and out-of-band deletions.

use crate::{
	CloudError, CloudInstance, CloudPluginInterface, PluginRequest,
};
use async_trait::async_trait;
use broker_types::{
	Allocation, ComputeAllocation, ComputeQuota, ConfigSchema, Field, FieldType, ImageSummary,
	ResourceSpec, ResourceType, Schema, SecurityRule, SystemUser, ValidationError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

const STATE_BUILD: &str = "build";
const STATE_ACTIVE: &str = "active";
const STATE_STOPPING: &str = "stopping";
const STATE_SHUTOFF: &str = "shutoff";
const STATE_ERROR: &str = "error";

/// Settings of the simulated cloud.
#[derive(Debug, Clone)]
pub struct SimulatedCloudSettings {
	/// Reads an instance spends in `build` before becoming `active`.
	pub ready_after_polls: u32,
	/// Compute quota granted to every user.
	pub quota: ComputeAllocation,
	pub images: Vec<ImageSummary>,
}

impl Default for SimulatedCloudSettings {
	fn default() -> Self {
		Self {
			ready_after_polls: 1,
			quota: ComputeAllocation {
				instances: 10,
				vcpu: 32,
				memory_mb: 65536,
				disk_gb: 1000,
			},
			images: vec![ImageSummary {
				id: "ubuntu-22.04".to_string(),
				name: "Ubuntu 22.04".to_string(),
				size_bytes: Some(2_361_393_152),
				min_disk_gb: Some(10),
				status: Some(STATE_ACTIVE.to_string()),
			}],
		}
	}
}

#[derive(Debug, Clone)]
struct SimInstance {
	resource: ResourceType,
	owner: String,
	state: &'static str,
	polls_left: u32,
	attributes: BTreeMap<String, String>,
	allocation: Option<Allocation>,
	fault_message: Option<String>,
}

#[derive(Default)]
struct SimState {
	instances: HashMap<String, SimInstance>,
	/// Rule id to (instance id, rule).
	rules: BTreeMap<String, (String, SecurityRule)>,
	next_address: u32,
}

/// Simulated cloud plugin.
pub struct SimulatedCloud {
	settings: SimulatedCloudSettings,
	state: RwLock<SimState>,
	unavailable: AtomicBool,
}

impl Default for SimulatedCloud {
	fn default() -> Self {
		Self::new(SimulatedCloudSettings::default())
	}
}

impl SimulatedCloud {
	pub fn new(settings: SimulatedCloudSettings) -> Self {
		Self {
			settings,
			state: RwLock::new(SimState::default()),
			unavailable: AtomicBool::new(false),
		}
	}

	/// Makes every call fail with `Unavailable` until switched back.
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Puts an instance in the `error` state.
	pub async fn fail_instance(&self, instance_id: &str, message: &str) -> bool {
		let mut state = self.state.write().await;
		match state.instances.get_mut(instance_id) {
			Some(instance) => {
				instance.state = STATE_ERROR;
				instance.fault_message = Some(message.to_string());
				true
			},
			None => false,
		}
	}

	/// Removes an instance behind the broker's back.
	pub async fn forget_instance(&self, instance_id: &str) -> bool {
		self.state
			.write()
			.await
			.instances
			.remove(instance_id)
			.is_some()
	}

	pub async fn instance_count(&self) -> usize {
		self.state.read().await.instances.len()
	}

	fn check_available(&self) -> Result<(), CloudError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(CloudError::Unavailable(
				"simulated cloud is unreachable".to_string(),
			));
		}
		Ok(())
	}

	fn used_by(state: &SimState, user_id: &str) -> ComputeAllocation {
		state
			.instances
			.values()
			.filter(|i| i.resource == ResourceType::Compute && i.owner == user_id)
			.filter_map(|i| i.allocation.as_ref().and_then(Allocation::as_compute).copied())
			.fold(ComputeAllocation::default(), |acc, a| acc + a)
	}

	fn require_instance<'a>(
		state: &'a SimState,
		instance_id: &str,
		resource: ResourceType,
	) -> Result<&'a SimInstance, CloudError> {
		match state.instances.get(instance_id) {
			Some(instance) if instance.resource == resource => Ok(instance),
			Some(instance) => Err(CloudError::InvalidParameter(format!(
				"{} is a {}, expected a {}",
				instance_id, instance.resource, resource
			))),
			None => Err(CloudError::Failed(format!(
				"Referenced {} {} does not exist",
				resource, instance_id
			))),
		}
	}
}

#[async_trait]
impl CloudPluginInterface for SimulatedCloud {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(SimulatedCloudSchema)
	}

	async fn request_instance(&self, request: &PluginRequest) -> Result<String, CloudError> {
		self.check_available()?;
		let mut state = self.state.write().await;

		let mut attributes = BTreeMap::new();
		match &request.resource {
			ResourceSpec::Compute(spec) => {
				if !self.settings.images.iter().any(|i| i.id == spec.image_id) {
					return Err(CloudError::InvalidParameter(format!(
						"Unknown image {}",
						spec.image_id
					)));
				}
				for network_id in &spec.network_order_ids {
					Self::require_instance(&state, network_id, ResourceType::Network)?;
				}
				let requested = request
					.resource
					.requested_allocation()
					.and_then(|a| a.as_compute().copied())
					.unwrap_or_default();
				let used = Self::used_by(&state, &request.system_user.user_id);
				if !self.settings.quota.saturating_sub(&used).covers(&requested) {
					return Err(CloudError::Failed("Quota exceeded".to_string()));
				}
				attributes.insert("image_id".to_string(), spec.image_id.clone());
			},
			ResourceSpec::Volume(spec) => {
				attributes.insert("size_gb".to_string(), spec.size_gb.to_string());
			},
			ResourceSpec::Network(spec) => {
				attributes.insert("cidr".to_string(), spec.cidr.clone());
				if let Some(gateway) = &spec.gateway {
					attributes.insert("gateway".to_string(), gateway.clone());
				}
			},
			ResourceSpec::Attachment(spec) => {
				Self::require_instance(&state, &spec.compute_order_id, ResourceType::Compute)?;
				Self::require_instance(&state, &spec.volume_order_id, ResourceType::Volume)?;
				let device = spec.device.clone().unwrap_or_else(|| "/dev/vdb".to_string());
				attributes.insert("device".to_string(), device);
			},
			ResourceSpec::PublicIp(spec) => {
				Self::require_instance(&state, &spec.compute_order_id, ResourceType::Compute)?;
				state.next_address += 1;
				let address = format!("203.0.113.{}", state.next_address % 254 + 1);
				attributes.insert("address".to_string(), address);
			},
		}

		let allocation = request.resource.requested_allocation();
		let id = uuid::Uuid::new_v4().to_string();
		state.instances.insert(
			id.clone(),
			SimInstance {
				resource: request.resource_type(),
				owner: request.system_user.user_id.clone(),
				state: STATE_BUILD,
				polls_left: self.settings.ready_after_polls,
				attributes,
				allocation,
				fault_message: None,
			},
		);
		tracing::debug!(component = "simulated-cloud", instance_id = %id, resource = %request.resource_type(), "Instance created");
		Ok(id)
	}

	async fn get_instance(
		&self,
		resource: ResourceType,
		instance_id: &str,
	) -> Result<CloudInstance, CloudError> {
		self.check_available()?;
		let mut state = self.state.write().await;
		let instance = match state.instances.get_mut(instance_id) {
			Some(instance) if instance.resource == resource => instance,
			_ => return Err(CloudError::NotFound(instance_id.to_string())),
		};

		match instance.state {
			STATE_BUILD if instance.polls_left == 0 => instance.state = STATE_ACTIVE,
			STATE_BUILD => instance.polls_left -= 1,
			STATE_STOPPING => instance.state = STATE_SHUTOFF,
			_ => {},
		}

		Ok(CloudInstance {
			id: instance_id.to_string(),
			cloud_state: instance.state.to_string(),
			attributes: instance.attributes.clone(),
			allocation: instance.allocation,
			fault_message: instance.fault_message.clone(),
		})
	}

	async fn delete_instance(
		&self,
		resource: ResourceType,
		instance_id: &str,
	) -> Result<(), CloudError> {
		self.check_available()?;
		let mut state = self.state.write().await;
		match state.instances.get(instance_id) {
			Some(instance) if instance.resource == resource => {},
			_ => return Err(CloudError::NotFound(instance_id.to_string())),
		}
		state.instances.remove(instance_id);
		state.rules.retain(|_, (owner, _)| owner != instance_id);
		Ok(())
	}

	async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
		self.check_available()?;
		let mut state = self.state.write().await;
		let instance = match state.instances.get_mut(instance_id) {
			Some(instance) if instance.resource == ResourceType::Compute => instance,
			Some(_) => {
				return Err(CloudError::Unsupported(
					"only compute instances can be stopped".to_string(),
				))
			},
			None => return Err(CloudError::NotFound(instance_id.to_string())),
		};
		match instance.state {
			STATE_ERROR => Err(CloudError::Failed(format!(
				"Instance {} is in error",
				instance_id
			))),
			STATE_SHUTOFF | STATE_STOPPING => Ok(()),
			_ => {
				instance.state = STATE_STOPPING;
				Ok(())
			},
		}
	}

	fn is_ready(&self, cloud_state: &str) -> bool {
		cloud_state == STATE_ACTIVE
	}

	fn has_failed(&self, cloud_state: &str) -> bool {
		cloud_state == STATE_ERROR
	}

	fn is_stopped(&self, cloud_state: &str) -> bool {
		cloud_state == STATE_SHUTOFF
	}

	fn is_stopping(&self, cloud_state: &str) -> bool {
		cloud_state == STATE_STOPPING
	}

	async fn get_user_quota(&self, user: &SystemUser) -> Result<ComputeQuota, CloudError> {
		self.check_available()?;
		let state = self.state.read().await;
		Ok(ComputeQuota {
			total: self.settings.quota,
			used: Self::used_by(&state, &user.user_id),
		})
	}

	async fn get_all_images(&self, _user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError> {
		self.check_available()?;
		Ok(self.settings.images.clone())
	}

	async fn get_image(
		&self,
		image_id: &str,
		_user: &SystemUser,
	) -> Result<ImageSummary, CloudError> {
		self.check_available()?;
		self.settings
			.images
			.iter()
			.find(|image| image.id == image_id)
			.cloned()
			.ok_or_else(|| CloudError::NotFound(image_id.to_string()))
	}

	async fn get_security_rules(
		&self,
		instance_id: &str,
		_user: &SystemUser,
	) -> Result<Vec<SecurityRule>, CloudError> {
		self.check_available()?;
		let state = self.state.read().await;
		if !state.instances.contains_key(instance_id) {
			return Err(CloudError::NotFound(instance_id.to_string()));
		}
		Ok(state
			.rules
			.values()
			.filter(|(owner, _)| owner == instance_id)
			.map(|(_, rule)| rule.clone())
			.collect())
	}

	async fn request_security_rule(
		&self,
		instance_id: &str,
		rule: &SecurityRule,
		_user: &SystemUser,
	) -> Result<String, CloudError> {
		self.check_available()?;
		if rule.port_from > rule.port_to {
			return Err(CloudError::InvalidParameter(format!(
				"port range {}-{} is empty",
				rule.port_from, rule.port_to
			)));
		}
		let mut state = self.state.write().await;
		match state.instances.get(instance_id) {
			Some(instance)
				if matches!(instance.resource, ResourceType::Network | ResourceType::PublicIp) => {},
			Some(instance) => {
				return Err(CloudError::Unsupported(format!(
					"security rules cannot be attached to a {}",
					instance.resource
				)))
			},
			None => return Err(CloudError::NotFound(instance_id.to_string())),
		}

		let rule_id = uuid::Uuid::new_v4().to_string();
		let mut stored = rule.clone();
		stored.id = rule_id.clone();
		state
			.rules
			.insert(rule_id.clone(), (instance_id.to_string(), stored));
		Ok(rule_id)
	}

	async fn delete_security_rule(
		&self,
		rule_id: &str,
		_user: &SystemUser,
	) -> Result<(), CloudError> {
		self.check_available()?;
		match self.state.write().await.rules.remove(rule_id) {
			Some(_) => Ok(()),
			None => Err(CloudError::NotFound(rule_id.to_string())),
		}
	}
}

/// Configuration schema for the simulated cloud.
pub struct SimulatedCloudSchema;

impl ConfigSchema for SimulatedCloudSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let non_negative = || FieldType::Integer {
			min: Some(0),
			max: None,
		};
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("ready_after_polls", non_negative()),
				Field::new("quota_instances", non_negative()),
				Field::new("quota_vcpu", non_negative()),
				Field::new("quota_memory_mb", non_negative()),
				Field::new("quota_disk_gb", non_negative()),
				Field::new("images", FieldType::Array(Box::new(FieldType::String))),
			],
		);
		schema.validate(config)
	}
}

fn int_setting(config: &toml::Value, key: &str) -> Option<u64> {
	config
		.get(key)
		.and_then(|v| v.as_integer())
		.and_then(|v| u64::try_from(v).ok())
}

/// Factory function to create a simulated cloud from its TOML settings.
pub fn create_plugin(config: &toml::Value) -> Result<Box<dyn CloudPluginInterface>, CloudError> {
	SimulatedCloudSchema
		.validate(config)
		.map_err(|e| CloudError::Configuration(e.to_string()))?;

	let mut settings = SimulatedCloudSettings::default();
	if let Some(polls) = int_setting(config, "ready_after_polls") {
		settings.ready_after_polls = u32::try_from(polls).unwrap_or(u32::MAX);
	}
	if let Some(v) = int_setting(config, "quota_instances") {
		settings.quota.instances = u32::try_from(v).unwrap_or(u32::MAX);
	}
	if let Some(v) = int_setting(config, "quota_vcpu") {
		settings.quota.vcpu = u32::try_from(v).unwrap_or(u32::MAX);
	}
	if let Some(v) = int_setting(config, "quota_memory_mb") {
		settings.quota.memory_mb = v;
	}
	if let Some(v) = int_setting(config, "quota_disk_gb") {
		settings.quota.disk_gb = v;
	}
	if let Some(images) = config.get("images").and_then(|v| v.as_array()) {
		settings.images = images
			.iter()
			.filter_map(|v| v.as_str())
			.map(|id| ImageSummary {
				id: id.to_string(),
				name: id.to_string(),
				size_bytes: None,
				min_disk_gb: None,
				status: Some(STATE_ACTIVE.to_string()),
			})
			.collect();
	}

	Ok(Box::new(SimulatedCloud::new(settings)))
}

/// Registry for the simulated cloud implementation.
pub struct Registry;

impl broker_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "simulated";
	type Factory = crate::CloudPluginFactory;

	fn factory() -> Self::Factory {
		create_plugin
	}
}

impl crate::CloudPluginRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_types::{AttachmentSpec, ComputeSpec, RuleDirection, VolumeSpec};

	fn user() -> SystemUser {
		SystemUser {
			user_id: "u-1".into(),
			user_name: "alice".into(),
			identity_provider_id: "provider-a".into(),
		}
	}

	fn compute(vcpu: u32) -> PluginRequest {
		PluginRequest {
			order_id: "o-1".into(),
			system_user: user(),
			resource: ResourceSpec::Compute(ComputeSpec {
				name: None,
				vcpu,
				memory_mb: 1024,
				disk_gb: 10,
				image_id: "ubuntu-22.04".into(),
				public_key: None,
				network_order_ids: vec![],
			}),
		}
	}

	#[tokio::test]
	async fn test_instance_becomes_active_after_polls() {
		let cloud = SimulatedCloud::new(SimulatedCloudSettings {
			ready_after_polls: 1,
			..Default::default()
		});
		let id = cloud.request_instance(&compute(2)).await.unwrap();

		let first = cloud.get_instance(ResourceType::Compute, &id).await.unwrap();
		assert_eq!(first.cloud_state, STATE_BUILD);
		let second = cloud.get_instance(ResourceType::Compute, &id).await.unwrap();
		assert!(cloud.is_ready(&second.cloud_state));
		assert_eq!(
			second.allocation.and_then(|a| a.as_compute().copied()).map(|a| a.vcpu),
			Some(2)
		);
	}

	#[tokio::test]
	async fn test_quota_is_enforced() {
		let cloud = SimulatedCloud::new(SimulatedCloudSettings {
			quota: ComputeAllocation {
				instances: 5,
				vcpu: 4,
				memory_mb: 65536,
				disk_gb: 1000,
			},
			..Default::default()
		});
		cloud.request_instance(&compute(3)).await.unwrap();
		assert!(matches!(
			cloud.request_instance(&compute(2)).await,
			Err(CloudError::Failed(_))
		));

		let quota = cloud.get_user_quota(&user()).await.unwrap();
		assert_eq!(quota.used.vcpu, 3);
		assert_eq!(quota.available().vcpu, 1);
	}

	#[tokio::test]
	async fn test_stop_then_shutoff() {
		let cloud = SimulatedCloud::new(SimulatedCloudSettings {
			ready_after_polls: 0,
			..Default::default()
		});
		let id = cloud.request_instance(&compute(1)).await.unwrap();
		cloud.stop_instance(&id).await.unwrap();

		let instance = cloud.get_instance(ResourceType::Compute, &id).await.unwrap();
		assert!(cloud.is_stopped(&instance.cloud_state));
	}

	#[tokio::test]
	async fn test_delete_and_not_found() {
		let cloud = SimulatedCloud::default();
		let id = cloud.request_instance(&compute(1)).await.unwrap();
		cloud.delete_instance(ResourceType::Compute, &id).await.unwrap();

		assert!(matches!(
			cloud.get_instance(ResourceType::Compute, &id).await,
			Err(CloudError::NotFound(_))
		));
		assert!(matches!(
			cloud.delete_instance(ResourceType::Compute, &id).await,
			Err(CloudError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_unavailable_is_distinct_from_not_found() {
		let cloud = SimulatedCloud::default();
		let id = cloud.request_instance(&compute(1)).await.unwrap();
		cloud.set_unavailable(true);
		assert!(matches!(
			cloud.get_instance(ResourceType::Compute, &id).await,
			Err(CloudError::Unavailable(_))
		));
		cloud.set_unavailable(false);
		assert!(cloud.get_instance(ResourceType::Compute, &id).await.is_ok());
	}

	#[tokio::test]
	async fn test_attachment_requires_existing_instances() {
		let cloud = SimulatedCloud::default();
		let compute_id = cloud.request_instance(&compute(1)).await.unwrap();
		let volume_id = cloud
			.request_instance(&PluginRequest {
				order_id: "o-2".into(),
				system_user: user(),
				resource: ResourceSpec::Volume(VolumeSpec {
					name: None,
					size_gb: 5,
				}),
			})
			.await
			.unwrap();

		let attach = |volume: &str| PluginRequest {
			order_id: "o-3".into(),
			system_user: user(),
			resource: ResourceSpec::Attachment(AttachmentSpec {
				compute_order_id: compute_id.clone(),
				volume_order_id: volume.to_string(),
				device: None,
			}),
		};
		let volume = cloud
			.get_instance(ResourceType::Volume, &volume_id)
			.await
			.unwrap();
		assert_eq!(
			volume.allocation,
			Some(Allocation::Volume(broker_types::VolumeAllocation {
				volumes: 1,
				storage_gb: 5,
			}))
		);

		let attachment_id = cloud.request_instance(&attach(&volume_id)).await.unwrap();
		let attachment = cloud
			.get_instance(ResourceType::Attachment, &attachment_id)
			.await
			.unwrap();
		assert!(attachment.allocation.is_none());
		assert!(matches!(
			cloud.request_instance(&attach("missing")).await,
			Err(CloudError::Failed(_))
		));
	}

	#[tokio::test]
	async fn test_security_rules_only_on_networks() {
		let cloud = SimulatedCloud::default();
		let compute_id = cloud.request_instance(&compute(1)).await.unwrap();
		let rule = SecurityRule {
			id: String::new(),
			direction: RuleDirection::Ingress,
			port_from: 22,
			port_to: 22,
			cidr: "0.0.0.0/0".into(),
			protocol: "tcp".into(),
		};
		assert!(matches!(
			cloud.request_security_rule(&compute_id, &rule, &user()).await,
			Err(CloudError::Unsupported(_))
		));
	}

	#[test]
	fn test_factory_reads_settings() {
		let config: toml::Value = toml::from_str(
			r#"
ready_after_polls = 3
quota_vcpu = 8
images = ["debian-12"]
"#,
		)
		.unwrap();
		assert!(create_plugin(&config).is_ok());

		let bad: toml::Value = toml::from_str("ready_after_polls = -1").unwrap();
		assert!(matches!(
			create_plugin(&bad),
			Err(CloudError::Configuration(_))
		));
	}
}
