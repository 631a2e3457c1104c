//! Connector for orders served by this broker's own clouds.

use super::{instance_without_id, AuditEntry, AuditService, CloudConnector, ConnectorError};
use crate::state::OrderRegistry;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use broker_cloud::{CloudError, CloudInstance, CloudPluginInterface, CloudPlugins, PluginRequest};
use broker_types::{
	truncate_id, ComputeQuota, ImageSummary, Instance, InstanceState, OrderRecord, OrderSpec,
	OrderState, OrderStatus, ResourceSpec, SecurityRule, SystemUser,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

pub struct LocalCloudConnector {
	local_provider: String,
	registry: Arc<OrderRegistry>,
	plugins: Arc<ArcSwap<CloudPlugins>>,
	audit: AuditService,
}

impl LocalCloudConnector {
	pub fn new(
		local_provider: String,
		registry: Arc<OrderRegistry>,
		plugins: Arc<ArcSwap<CloudPlugins>>,
		audit: AuditService,
	) -> Self {
		Self {
			local_provider,
			registry,
			plugins,
			audit,
		}
	}

	fn plugin(&self, cloud_name: &str) -> Result<Arc<dyn CloudPluginInterface>, ConnectorError> {
		Ok(self.plugins.load().get(cloud_name)?)
	}

	async fn audit<T>(
		&self,
		operation: &str,
		spec: Option<&OrderSpec>,
		cloud_name: &str,
		user: &SystemUser,
		result: &Result<T, CloudError>,
	) {
		let outcome = match result {
			Ok(_) => "ok".to_string(),
			Err(e) => e.to_string(),
		};
		self.audit
			.record(AuditEntry {
				operation: operation.to_string(),
				order_id: spec.map(|s| s.id.clone()),
				resource_type: spec.map(|s| s.resource_type()),
				cloud_name: cloud_name.to_string(),
				user_id: user.user_id.clone(),
				outcome,
				timestamp: Utc::now(),
			})
			.await;
	}

	/// Cloud-side id of a referenced order.
	async fn instance_id_of(&self, order_id: &str) -> Result<String, ConnectorError> {
		let order = self.registry.get(order_id).ok_or_else(|| {
			ConnectorError::Failed(format!("Referenced order {} is not active", order_id))
		})?;
		let status = order.lock().await;
		status.instance_id.clone().ok_or_else(|| {
			ConnectorError::Failed(format!("Referenced order {} has no instance yet", order_id))
		})
	}

	/// Replaces the order ids embedded in a composite resource with the
	/// instance ids the cloud knows them by.
	async fn resolve_embedded(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ConnectorError> {
		let mut resolved = resource.clone();
		match &mut resolved {
			ResourceSpec::Compute(spec) => {
				for network_id in spec.network_order_ids.iter_mut() {
					let instance_id = self.instance_id_of(network_id).await?;
					*network_id = instance_id;
				}
			},
			ResourceSpec::Attachment(spec) => {
				spec.compute_order_id = self.instance_id_of(&spec.compute_order_id).await?;
				spec.volume_order_id = self.instance_id_of(&spec.volume_order_id).await?;
			},
			ResourceSpec::PublicIp(spec) => {
				spec.compute_order_id = self.instance_id_of(&spec.compute_order_id).await?;
			},
			ResourceSpec::Volume(_) | ResourceSpec::Network(_) => {},
		}
		Ok(resolved)
	}

	fn normalize(
		plugin: &dyn CloudPluginInterface,
		raw: CloudInstance,
		spec: &OrderSpec,
		order_state: OrderState,
	) -> Instance {
		let state = if plugin.is_ready(&raw.cloud_state) {
			InstanceState::Ready
		} else if plugin.has_failed(&raw.cloud_state) {
			InstanceState::Failed
		} else if plugin.is_stopped(&raw.cloud_state) {
			InstanceState::Stopped
		} else if plugin.is_stopping(&raw.cloud_state) {
			InstanceState::Stopping
		} else if order_state == OrderState::Spawning {
			InstanceState::Spawning
		} else {
			InstanceState::Busy
		};
		Instance {
			id: Some(raw.id),
			state,
			cloud_state: Some(raw.cloud_state),
			provider: Some(spec.provider.clone()),
			cloud_name: Some(spec.cloud_name.clone()),
			attributes: raw.attributes,
			allocation: raw.allocation,
			fault_message: raw.fault_message,
		}
	}

	fn require_instance_id<'a>(status: &'a OrderStatus) -> Result<&'a str, ConnectorError> {
		status
			.instance_id
			.as_deref()
			.ok_or_else(|| ConnectorError::Failed("Order has no instance".to_string()))
	}
}

#[async_trait]
impl CloudConnector for LocalCloudConnector {
	#[instrument(skip_all, fields(order_id = %truncate_id(&spec.id), cloud = %spec.cloud_name))]
	async fn request_instance(&self, spec: &OrderSpec) -> Result<Option<String>, ConnectorError> {
		let plugin = self.plugin(&spec.cloud_name)?;
		let request = PluginRequest {
			order_id: spec.id.clone(),
			system_user: spec.system_user.clone(),
			resource: self.resolve_embedded(&spec.resource).await?,
		};

		let result = plugin.request_instance(&request).await;
		self.audit("request_instance", Some(spec), &spec.cloud_name, &spec.system_user, &result)
			.await;
		let instance_id = result?;
		if instance_id.is_empty() {
			return Ok(None);
		}
		Ok(Some(instance_id))
	}

	async fn get_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<Instance, ConnectorError> {
		if matches!(status.state, OrderState::Closed | OrderState::Deactivated) {
			return Err(ConnectorError::NotFound(format!(
				"order {} is {}",
				truncate_id(&spec.id),
				status.state
			)));
		}
		let Some(instance_id) = status.instance_id.as_deref() else {
			return instance_without_id(status.state);
		};

		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.get_instance(spec.resource_type(), instance_id).await;
		self.audit("get_instance", Some(spec), &spec.cloud_name, &spec.system_user, &result)
			.await;
		Ok(Self::normalize(plugin.as_ref(), result?, spec, status.state))
	}

	async fn delete_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError> {
		let Some(instance_id) = status.instance_id.as_deref() else {
			return Ok(());
		};
		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.delete_instance(spec.resource_type(), instance_id).await;
		self.audit("delete_instance", Some(spec), &spec.cloud_name, &spec.system_user, &result)
			.await;
		match result {
			Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	async fn stop_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError> {
		let instance_id = Self::require_instance_id(status)?;
		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.stop_instance(instance_id).await;
		self.audit("stop_instance", Some(spec), &spec.cloud_name, &spec.system_user, &result)
			.await;
		Ok(result?)
	}

	async fn get_remote_order(&self, spec: &OrderSpec) -> Result<OrderRecord, ConnectorError> {
		Err(ConnectorError::Unsupported(format!(
			"order {} is served by the local provider {}",
			truncate_id(&spec.id),
			self.local_provider
		)))
	}

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, ConnectorError> {
		let plugin = self.plugin(cloud_name)?;
		let result = plugin.get_user_quota(user).await;
		self.audit("get_user_quota", None, cloud_name, user, &result).await;
		Ok(result?)
	}

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, ConnectorError> {
		let plugin = self.plugin(cloud_name)?;
		let result = plugin.get_all_images(user).await;
		self.audit("get_all_images", None, cloud_name, user, &result).await;
		Ok(result?)
	}

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, ConnectorError> {
		let plugin = self.plugin(cloud_name)?;
		let result = plugin.get_image(image_id, user).await;
		self.audit("get_image", None, cloud_name, user, &result).await;
		Ok(result?)
	}

	async fn get_all_security_rules(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, ConnectorError> {
		let instance_id = Self::require_instance_id(status)?;
		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.get_security_rules(instance_id, user).await;
		self.audit("get_security_rules", Some(spec), &spec.cloud_name, user, &result)
			.await;
		Ok(result?)
	}

	async fn request_security_rule(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, ConnectorError> {
		let instance_id = Self::require_instance_id(status)?;
		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.request_security_rule(instance_id, rule, user).await;
		self.audit("request_security_rule", Some(spec), &spec.cloud_name, user, &result)
			.await;
		Ok(result?)
	}

	async fn delete_security_rule(
		&self,
		spec: &OrderSpec,
		_status: &OrderStatus,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), ConnectorError> {
		let plugin = self.plugin(&spec.cloud_name)?;
		let result = plugin.delete_security_rule(rule_id, user).await;
		self.audit("delete_security_rule", Some(spec), &spec.cloud_name, user, &result)
			.await;
		Ok(result?)
	}
}
