//! Cloud connectors.
//!
//! A connector performs resource operations for an order against whoever
//! serves it: the local cloud plugins when the order's provider is this
//! broker, or the owning peer otherwise. Processors and the order controller
//! only talk to clouds through this layer.

pub mod audit;
pub mod local;
pub mod remote;

pub use audit::{AuditEntry, AuditService};
pub use local::LocalCloudConnector;
pub use remote::RemoteCloudConnector;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use broker_cloud::{CloudError, CloudPlugins};
use broker_federation::{PeerTransportInterface, TransportError};
use broker_types::{
	ComputeQuota, ImageSummary, Instance, InstanceState, OrderRecord, OrderSpec, OrderState,
	OrderStatus, SecurityRule, SystemUser,
};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::state::OrderRegistry;

/// Errors surfaced by connectors.
///
/// `NotFound` is an authoritative answer that the resource does not exist.
/// `Unavailable` means the backend could not be asked and the call may be
/// retried. Everything else is a definite failure.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Request failed: {0}")]
	Failed(String),
	#[error("Unavailable: {0}")]
	Unavailable(String),
	#[error("Unauthorized: {0}")]
	Unauthorized(String),
	#[error("Unsupported: {0}")]
	Unsupported(String),
	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),
	#[error("Consistency error: {0}")]
	Consistency(String),
}

impl ConnectorError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, ConnectorError::NotFound(_))
	}

	pub fn is_unavailable(&self) -> bool {
		matches!(self, ConnectorError::Unavailable(_))
	}
}

impl From<CloudError> for ConnectorError {
	fn from(err: CloudError) -> Self {
		match err {
			CloudError::NotFound(msg) => ConnectorError::NotFound(msg),
			CloudError::Failed(msg) => ConnectorError::Failed(msg),
			CloudError::Unavailable(msg) => ConnectorError::Unavailable(msg),
			CloudError::Unauthorized(msg) => ConnectorError::Unauthorized(msg),
			CloudError::Unsupported(msg) => ConnectorError::Unsupported(msg),
			CloudError::InvalidParameter(msg) => ConnectorError::InvalidParameter(msg),
			CloudError::Configuration(msg) => ConnectorError::Consistency(msg),
		}
	}
}

impl From<TransportError> for ConnectorError {
	fn from(err: TransportError) -> Self {
		match err {
			TransportError::Unreachable(msg) => ConnectorError::Unavailable(msg),
			TransportError::Protocol(msg) => {
				ConnectorError::Unavailable(format!("protocol error: {}", msg))
			},
			TransportError::Rejected(msg) => ConnectorError::Failed(msg),
			TransportError::NotFound(msg) => ConnectorError::NotFound(msg),
			TransportError::Configuration(msg) => ConnectorError::Consistency(msg),
		}
	}
}

/// Resource operations for an order, wherever it is served.
///
/// Callers hold the order's lock and pass its status alongside the spec.
#[async_trait]
pub trait CloudConnector: Send + Sync {
	/// Issues the request. Returns the cloud-side id when the resource is
	/// created locally, None when the request was handed to a peer.
	async fn request_instance(&self, spec: &OrderSpec) -> Result<Option<String>, ConnectorError>;

	async fn get_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<Instance, ConnectorError>;

	/// Deletes the resource. A resource that is already gone counts as deleted.
	async fn delete_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError>;

	async fn stop_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError>;

	/// The serving provider's copy of the order.
	async fn get_remote_order(&self, spec: &OrderSpec) -> Result<OrderRecord, ConnectorError>;

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, ConnectorError>;

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, ConnectorError>;

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, ConnectorError>;

	async fn get_all_security_rules(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, ConnectorError>;

	async fn request_security_rule(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, ConnectorError>;

	async fn delete_security_rule(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), ConnectorError>;
}

/// What to report for an order that has no cloud-side instance yet.
///
/// Orders being torn down without an instance have nothing left to find.
pub(crate) fn instance_without_id(state: OrderState) -> Result<Instance, ConnectorError> {
	let instance_state = match state {
		OrderState::Open | OrderState::Pending => InstanceState::Dispatched,
		OrderState::FailedOnRequest | OrderState::FailedAfterSuccessfulRequest => {
			InstanceState::Failed
		},
		state if state.is_deleting() => {
			return Err(ConnectorError::NotFound(format!(
				"order in {} has no instance",
				state
			)))
		},
		_ => InstanceState::Inactive,
	};
	Ok(Instance::empty(instance_state))
}

/// Picks the connector for an order's provider.
pub struct CloudConnectorFactory {
	local_provider: String,
	local: Arc<LocalCloudConnector>,
	transport: Option<Arc<dyn PeerTransportInterface>>,
	remotes: DashMap<String, Arc<RemoteCloudConnector>>,
}

impl CloudConnectorFactory {
	pub fn new(
		registry: Arc<OrderRegistry>,
		plugins: Arc<ArcSwap<CloudPlugins>>,
		transport: Option<Arc<dyn PeerTransportInterface>>,
		audit: AuditService,
	) -> Self {
		let local_provider = registry.local_provider().to_string();
		Self {
			local: Arc::new(LocalCloudConnector::new(
				local_provider.clone(),
				registry,
				plugins,
				audit,
			)),
			local_provider,
			transport,
			remotes: DashMap::new(),
		}
	}

	/// Local connector when `provider` is this broker, the peer's otherwise.
	pub fn connector_for(&self, provider: &str) -> Arc<dyn CloudConnector> {
		if provider == self.local_provider {
			return self.local.clone();
		}
		self.remotes
			.entry(provider.to_string())
			.or_insert_with(|| {
				Arc::new(RemoteCloudConnector::new(
					provider.to_string(),
					self.transport.clone(),
				))
			})
			.value()
			.clone()
	}

	pub fn local(&self) -> &Arc<LocalCloudConnector> {
		&self.local
	}
}
