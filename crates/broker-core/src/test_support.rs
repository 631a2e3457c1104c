//! Fixtures and fakes shared by the crate's tests.

use crate::connector::{AuditService, CloudConnectorFactory};
use crate::processors::ProcessorContext;
use crate::state::{OrderRegistry, Transitioner};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use broker_cloud::{CloudError, CloudInstance, CloudPluginInterface, CloudPlugins, PluginRequest};
use broker_federation::{FederationHandler, PeerTransportInterface, TransportError};
use broker_storage::implementations::memory::MemoryStorage;
use broker_storage::{OrderStore, StorageService};
use broker_types::{
	Allocation, AttachmentSpec, ComputeAllocation, ComputeQuota, ComputeSpec, ConfigSchema,
	ImageSummary, Instance, NetworkSpec, OrderRecord, OrderSpec, PublicIpSpec, ResourceSpec,
	ResourceType, Schema, SecurityRule, SystemUser, ValidationError, VolumeSpec,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const LOCAL: &str = "provider-a";
pub const PEER: &str = "provider-b";

pub fn memory_storage() -> Arc<StorageService> {
	Arc::new(StorageService::new(Box::new(MemoryStorage::new())))
}

pub fn memory_store() -> OrderStore {
	OrderStore::new(memory_storage())
}

pub fn user() -> SystemUser {
	SystemUser {
		user_id: "u-1".into(),
		user_name: "alice".into(),
		identity_provider_id: LOCAL.into(),
	}
}

pub fn volume_spec(provider: &str) -> OrderSpec {
	OrderSpec::new(
		LOCAL,
		provider,
		"default",
		user(),
		ResourceSpec::Volume(VolumeSpec {
			name: Some("data".into()),
			size_gb: 10,
		}),
	)
}

pub fn compute_spec(provider: &str) -> OrderSpec {
	OrderSpec::new(
		LOCAL,
		provider,
		"default",
		user(),
		ResourceSpec::Compute(ComputeSpec {
			name: Some("vm".into()),
			vcpu: 2,
			memory_mb: 2048,
			disk_gb: 20,
			image_id: "ubuntu-22.04".into(),
			public_key: None,
			network_order_ids: Vec::new(),
		}),
	)
}

pub fn network_spec(provider: &str) -> OrderSpec {
	OrderSpec::new(
		LOCAL,
		provider,
		"default",
		user(),
		ResourceSpec::Network(NetworkSpec {
			name: Some("net".into()),
			cidr: "10.10.0.0/24".into(),
			gateway: None,
			allocation_mode: Default::default(),
		}),
	)
}

pub fn public_ip_spec(provider: &str, compute_order_id: &str) -> OrderSpec {
	OrderSpec::new(
		LOCAL,
		provider,
		"default",
		user(),
		ResourceSpec::PublicIp(PublicIpSpec {
			compute_order_id: compute_order_id.into(),
		}),
	)
}

pub fn attachment_spec(provider: &str, compute_order_id: &str, volume_order_id: &str) -> OrderSpec {
	OrderSpec::new(
		LOCAL,
		provider,
		"default",
		user(),
		ResourceSpec::Attachment(AttachmentSpec {
			compute_order_id: compute_order_id.into(),
			volume_order_id: volume_order_id.into(),
			device: None,
		}),
	)
}

/// Processor context over a single "default" cloud served by `cloud`.
pub fn processor_context(
	cloud: Arc<ScriptedCloud>,
	transport: Option<Arc<dyn PeerTransportInterface>>,
	store: OrderStore,
) -> Arc<ProcessorContext> {
	let registry = Arc::new(OrderRegistry::new(LOCAL));
	let mut plugins: HashMap<String, Arc<dyn CloudPluginInterface>> = HashMap::new();
	plugins.insert("default".into(), cloud);
	let connectors = CloudConnectorFactory::new(
		registry.clone(),
		Arc::new(ArcSwap::from_pointee(CloudPlugins::new(plugins))),
		transport,
		AuditService::new(memory_storage()),
	);
	Arc::new(ProcessorContext {
		transitioner: Arc::new(Transitioner::new(registry, store)),
		connectors: Arc::new(connectors),
	})
}

#[derive(Default)]
struct ScriptedState {
	/// Cloud state string per instance id.
	instances: HashMap<String, String>,
	allocations: HashMap<String, Allocation>,
	request_result: Option<Result<String, CloudError>>,
	last_request: Option<PluginRequest>,
	stop_calls: usize,
	issued: usize,
}

/// Cloud plugin whose answers are set by the test.
///
/// States: "build", "active", "stopping", "shutoff" and "error".
#[derive(Default)]
pub struct ScriptedCloud {
	state: Mutex<ScriptedState>,
	unavailable: AtomicBool,
	stop_ignored: AtomicBool,
}

impl ScriptedCloud {
	fn state(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	fn check_available(&self) -> Result<(), CloudError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(CloudError::Unavailable("scripted outage".into()));
		}
		Ok(())
	}

	/// Makes the next requests return `result` instead of a fresh id.
	pub fn set_request_result(&self, result: Result<String, CloudError>) {
		self.state().request_result = Some(result);
	}

	pub fn set_instance_state(&self, instance_id: &str, cloud_state: &str) {
		self.state()
			.instances
			.insert(instance_id.to_string(), cloud_state.to_string());
	}

	pub fn set_allocation(&self, instance_id: &str, allocation: Allocation) {
		self.state()
			.allocations
			.insert(instance_id.to_string(), allocation);
	}

	pub fn remove_instance(&self, instance_id: &str) {
		self.state().instances.remove(instance_id);
	}

	pub fn has_instance(&self, instance_id: &str) -> bool {
		self.state().instances.contains_key(instance_id)
	}

	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Accepts stop calls without changing the instance state.
	pub fn set_stop_ignored(&self, ignored: bool) {
		self.stop_ignored.store(ignored, Ordering::SeqCst);
	}

	pub fn last_request(&self) -> Option<PluginRequest> {
		self.state().last_request.clone()
	}

	pub fn stop_calls(&self) -> usize {
		self.state().stop_calls
	}
}

struct ScriptedSchema;

impl ConfigSchema for ScriptedSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

#[async_trait]
impl CloudPluginInterface for ScriptedCloud {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(ScriptedSchema)
	}

	async fn request_instance(&self, request: &PluginRequest) -> Result<String, CloudError> {
		self.check_available()?;
		let mut state = self.state();
		state.last_request = Some(request.clone());
		let result = match state.request_result.clone() {
			Some(result) => result,
			None => {
				state.issued += 1;
				Ok(format!("i-{}", state.issued))
			},
		};
		if let Ok(id) = &result {
			if !id.is_empty() {
				state
					.instances
					.entry(id.clone())
					.or_insert_with(|| "build".to_string());
			}
		}
		result
	}

	async fn get_instance(
		&self,
		_resource: ResourceType,
		instance_id: &str,
	) -> Result<CloudInstance, CloudError> {
		self.check_available()?;
		let state = self.state();
		let cloud_state = state
			.instances
			.get(instance_id)
			.cloned()
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
		let fault_message = (cloud_state == "error").then(|| "scripted failure".to_string());
		Ok(CloudInstance {
			id: instance_id.to_string(),
			cloud_state,
			attributes: BTreeMap::new(),
			allocation: state.allocations.get(instance_id).copied(),
			fault_message,
		})
	}

	async fn delete_instance(
		&self,
		_resource: ResourceType,
		instance_id: &str,
	) -> Result<(), CloudError> {
		self.check_available()?;
		self.state()
			.instances
			.remove(instance_id)
			.map(|_| ())
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
	}

	async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
		self.check_available()?;
		let mut state = self.state();
		state.stop_calls += 1;
		let ignored = self.stop_ignored.load(Ordering::SeqCst);
		match state.instances.get_mut(instance_id) {
			Some(_) if ignored => Ok(()),
			Some(cloud_state) => {
				*cloud_state = "stopping".to_string();
				Ok(())
			},
			None => Err(CloudError::NotFound(instance_id.to_string())),
		}
	}

	fn is_ready(&self, cloud_state: &str) -> bool {
		cloud_state == "active"
	}

	fn has_failed(&self, cloud_state: &str) -> bool {
		cloud_state == "error"
	}

	fn is_stopped(&self, cloud_state: &str) -> bool {
		cloud_state == "shutoff"
	}

	fn is_stopping(&self, cloud_state: &str) -> bool {
		cloud_state == "stopping"
	}

	async fn get_user_quota(&self, _user: &SystemUser) -> Result<ComputeQuota, CloudError> {
		self.check_available()?;
		Ok(ComputeQuota {
			total: ComputeAllocation {
				instances: 10,
				vcpu: 20,
				memory_mb: 40960,
				disk_gb: 500,
			},
			used: ComputeAllocation::default(),
		})
	}

	async fn get_all_images(&self, _user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError> {
		self.check_available()?;
		Ok(vec![ImageSummary {
			id: "ubuntu-22.04".into(),
			name: "Ubuntu 22.04".into(),
			size_bytes: None,
			min_disk_gb: Some(10),
			status: Some("active".into()),
		}])
	}

	async fn get_image(
		&self,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, CloudError> {
		self.get_all_images(user)
			.await?
			.into_iter()
			.find(|image| image.id == image_id)
			.ok_or_else(|| CloudError::NotFound(image_id.to_string()))
	}

	async fn get_security_rules(
		&self,
		_instance_id: &str,
		_user: &SystemUser,
	) -> Result<Vec<SecurityRule>, CloudError> {
		self.check_available()?;
		Ok(Vec::new())
	}

	async fn request_security_rule(
		&self,
		_instance_id: &str,
		_rule: &SecurityRule,
		_user: &SystemUser,
	) -> Result<String, CloudError> {
		self.check_available()?;
		Ok("rule-1".into())
	}

	async fn delete_security_rule(
		&self,
		_rule_id: &str,
		_user: &SystemUser,
	) -> Result<(), CloudError> {
		self.check_available()
	}
}

/// Peer handler that records what it receives and knows no orders.
#[derive(Default)]
pub struct RecordingHandler {
	received: Mutex<Vec<String>>,
	deleted: Mutex<Vec<String>>,
}

impl RecordingHandler {
	pub fn received(&self) -> Vec<String> {
		self.received
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.clone()
	}

	pub fn deleted(&self) -> Vec<String> {
		self.deleted
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.clone()
	}
}

#[async_trait]
impl FederationHandler for RecordingHandler {
	async fn receive_order(&self, spec: OrderSpec) -> Result<(), TransportError> {
		self.received
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.push(spec.id);
		Ok(())
	}

	async fn get_order(&self, order_id: &str) -> Result<OrderRecord, TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn get_instance(&self, order_id: &str) -> Result<Instance, TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn delete_order(&self, order_id: &str) -> Result<(), TransportError> {
		self.deleted
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.push(order_id.to_string());
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn stop_order(&self, order_id: &str) -> Result<(), TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		_user: &SystemUser,
	) -> Result<ComputeQuota, TransportError> {
		Err(TransportError::NotFound(cloud_name.to_string()))
	}

	async fn get_all_images(
		&self,
		_cloud_name: &str,
		_user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError> {
		Ok(Vec::new())
	}

	async fn get_image(
		&self,
		_cloud_name: &str,
		image_id: &str,
		_user: &SystemUser,
	) -> Result<ImageSummary, TransportError> {
		Err(TransportError::NotFound(image_id.to_string()))
	}

	async fn get_security_rules(
		&self,
		order_id: &str,
		_user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn request_security_rule(
		&self,
		order_id: &str,
		_rule: &SecurityRule,
		_user: &SystemUser,
	) -> Result<String, TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}

	async fn delete_security_rule(
		&self,
		order_id: &str,
		_rule_id: &str,
		_user: &SystemUser,
	) -> Result<(), TransportError> {
		Err(TransportError::NotFound(order_id.to_string()))
	}
}
