//! Order types for the broker.
//!
//! An order is split into an immutable [`OrderSpec`] describing what was
//! requested and by whom, and a mutable [`OrderStatus`] that the lifecycle
//! engine updates as the order advances through [`OrderState`]s.

use crate::cloud::{
	Allocation, ComputeAllocation, Instance, NetworkAllocation, PublicIpAllocation,
	VolumeAllocation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an unknown state or resource name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("Unknown order state: {0}")]
	UnknownState(String),
	#[error("Unknown resource type: {0}")]
	UnknownResourceType(String),
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
	/// Accepted and waiting for the request to be issued.
	Open,
	/// Forwarded to a remote provider; the remote request is outstanding.
	Pending,
	/// Instance requested from the cloud and not yet ready.
	Spawning,
	/// Instance ready.
	Fulfilled,
	/// Stop requested by the user.
	Stopping,
	/// Instance confirmed stopped.
	Stopped,
	/// The request itself failed; no instance exists.
	FailedOnRequest,
	/// The instance was created but later failed or vanished.
	FailedAfterSuccessfulRequest,
	/// The backend could not be reached to confirm the instance status.
	UnableToCheckStatus,
	/// Deletion requested by the user.
	AssignedForDeletion,
	/// Delete issued; waiting for the instance to disappear.
	CheckingDeletion,
	/// Teardown confirmed; awaiting eviction.
	Closed,
	/// Terminal. The order is no longer tracked in memory.
	Deactivated,
}

impl OrderState {
	/// Every state, in lifecycle order.
	pub const ALL: [OrderState; 13] = [
		OrderState::Open,
		OrderState::Pending,
		OrderState::Spawning,
		OrderState::Fulfilled,
		OrderState::Stopping,
		OrderState::Stopped,
		OrderState::FailedOnRequest,
		OrderState::FailedAfterSuccessfulRequest,
		OrderState::UnableToCheckStatus,
		OrderState::AssignedForDeletion,
		OrderState::CheckingDeletion,
		OrderState::Closed,
		OrderState::Deactivated,
	];

	/// Returns the canonical name of the state.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderState::Open => "OPEN",
			OrderState::Pending => "PENDING",
			OrderState::Spawning => "SPAWNING",
			OrderState::Fulfilled => "FULFILLED",
			OrderState::Stopping => "STOPPING",
			OrderState::Stopped => "STOPPED",
			OrderState::FailedOnRequest => "FAILED_ON_REQUEST",
			OrderState::FailedAfterSuccessfulRequest => "FAILED_AFTER_SUCCESSFUL_REQUEST",
			OrderState::UnableToCheckStatus => "UNABLE_TO_CHECK_STATUS",
			OrderState::AssignedForDeletion => "ASSIGNED_FOR_DELETION",
			OrderState::CheckingDeletion => "CHECKING_DELETION",
			OrderState::Closed => "CLOSED",
			OrderState::Deactivated => "DEACTIVATED",
		}
	}

	/// Returns true for the state in which orders are evicted.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderState::Deactivated)
	}

	/// Returns an iterator over all states that are recovered at startup.
	pub fn non_terminal() -> impl Iterator<Item = OrderState> {
		Self::ALL.into_iter().filter(|state| !state.is_terminal())
	}

	/// Returns true once deletion of the order has been requested.
	pub fn is_deleting(&self) -> bool {
		matches!(
			self,
			OrderState::AssignedForDeletion
				| OrderState::CheckingDeletion
				| OrderState::Closed
				| OrderState::Deactivated
		)
	}
}

impl fmt::Display for OrderState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OrderState {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|state| state.as_str() == s)
			.ok_or_else(|| ParseError::UnknownState(s.to_string()))
	}
}

/// Kind of resource an order requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
	Compute,
	Volume,
	Network,
	Attachment,
	PublicIp,
}

impl ResourceType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ResourceType::Compute => "compute",
			ResourceType::Volume => "volume",
			ResourceType::Network => "network",
			ResourceType::Attachment => "attachment",
			ResourceType::PublicIp => "public_ip",
		}
	}
}

impl fmt::Display for ResourceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ResourceType {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"compute" => Ok(Self::Compute),
			"volume" => Ok(Self::Volume),
			"network" => Ok(Self::Network),
			"attachment" => Ok(Self::Attachment),
			"public_ip" => Ok(Self::PublicIp),
			_ => Err(ParseError::UnknownResourceType(s.to_string())),
		}
	}
}

/// Identity of the user on whose behalf an order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemUser {
	pub user_id: String,
	pub user_name: String,
	/// Provider that authenticated the user.
	pub identity_provider_id: String,
}

/// Parameters of a compute request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeSpec {
	#[serde(default)]
	pub name: Option<String>,
	pub vcpu: u32,
	pub memory_mb: u64,
	pub disk_gb: u64,
	pub image_id: String,
	#[serde(default)]
	pub public_key: Option<String>,
	/// Ids of network orders the compute attaches to. Empty means the cloud default.
	#[serde(default)]
	pub network_order_ids: Vec<String>,
}

/// Parameters of a volume request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
	#[serde(default)]
	pub name: Option<String>,
	pub size_gb: u64,
}

/// Parameters of a network request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
	#[serde(default)]
	pub name: Option<String>,
	pub cidr: String,
	#[serde(default)]
	pub gateway: Option<String>,
	#[serde(default)]
	pub allocation_mode: NetworkAllocationMode,
}

/// Address allocation for a requested network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAllocationMode {
	#[default]
	Dynamic,
	Static,
}

/// Parameters of an attachment between a compute and a volume order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSpec {
	pub compute_order_id: String,
	pub volume_order_id: String,
	#[serde(default)]
	pub device: Option<String>,
}

/// Parameters of a public IP bound to a compute order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicIpSpec {
	pub compute_order_id: String,
}

/// Resource-specific parameters of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
	Compute(ComputeSpec),
	Volume(VolumeSpec),
	Network(NetworkSpec),
	Attachment(AttachmentSpec),
	PublicIp(PublicIpSpec),
}

impl ResourceSpec {
	pub fn resource_type(&self) -> ResourceType {
		match self {
			ResourceSpec::Compute(_) => ResourceType::Compute,
			ResourceSpec::Volume(_) => ResourceType::Volume,
			ResourceSpec::Network(_) => ResourceType::Network,
			ResourceSpec::Attachment(_) => ResourceType::Attachment,
			ResourceSpec::PublicIp(_) => ResourceType::PublicIp,
		}
	}

	/// Ids of the other orders this resource embeds.
	///
	/// A referenced order cannot be deleted while this order is active.
	pub fn embedded_order_ids(&self) -> Vec<&str> {
		match self {
			ResourceSpec::Compute(spec) => spec.network_order_ids.iter().map(String::as_str).collect(),
			ResourceSpec::Attachment(spec) => {
				vec![spec.compute_order_id.as_str(), spec.volume_order_id.as_str()]
			},
			ResourceSpec::PublicIp(spec) => vec![spec.compute_order_id.as_str()],
			ResourceSpec::Volume(_) | ResourceSpec::Network(_) => Vec::new(),
		}
	}

	/// User-facing name, when the resource has one.
	pub fn name(&self) -> Option<&str> {
		match self {
			ResourceSpec::Compute(spec) => spec.name.as_deref(),
			ResourceSpec::Volume(spec) => spec.name.as_deref(),
			ResourceSpec::Network(spec) => spec.name.as_deref(),
			ResourceSpec::Attachment(_) | ResourceSpec::PublicIp(_) => None,
		}
	}

	/// Resources the order asks for, used when the cloud does not report what
	/// it granted. Attachments hold nothing of their own.
	pub fn requested_allocation(&self) -> Option<Allocation> {
		match self {
			ResourceSpec::Compute(spec) => Some(Allocation::Compute(ComputeAllocation {
				instances: 1,
				vcpu: spec.vcpu,
				memory_mb: spec.memory_mb,
				disk_gb: spec.disk_gb,
			})),
			ResourceSpec::Volume(spec) => Some(Allocation::Volume(VolumeAllocation {
				volumes: 1,
				storage_gb: spec.size_gb,
			})),
			ResourceSpec::Network(_) => Some(Allocation::Network(NetworkAllocation { networks: 1 })),
			ResourceSpec::PublicIp(_) => {
				Some(Allocation::PublicIp(PublicIpAllocation { public_ips: 1 }))
			},
			ResourceSpec::Attachment(_) => None,
		}
	}
}

/// The immutable part of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
	/// Opaque id generated at creation.
	pub id: String,
	/// Provider through which the user placed the order.
	pub requester: String,
	/// Provider that owns the cloud serving the order.
	pub provider: String,
	/// Cloud, within the owning provider, that serves the order.
	pub cloud_name: String,
	pub system_user: SystemUser,
	pub resource: ResourceSpec,
	pub created_at: DateTime<Utc>,
}

impl OrderSpec {
	/// Creates a spec with a freshly generated id.
	pub fn new(
		requester: impl Into<String>,
		provider: impl Into<String>,
		cloud_name: impl Into<String>,
		system_user: SystemUser,
		resource: ResourceSpec,
	) -> Self {
		Self {
			id: crate::new_order_id(),
			requester: requester.into(),
			provider: provider.into(),
			cloud_name: cloud_name.into(),
			system_user,
			resource,
			created_at: Utc::now(),
		}
	}

	pub fn resource_type(&self) -> ResourceType {
		self.resource.resource_type()
	}

	pub fn is_provider_local(&self, local_provider: &str) -> bool {
		self.provider == local_provider
	}

	pub fn is_provider_remote(&self, local_provider: &str) -> bool {
		!self.is_provider_local(local_provider)
	}

	pub fn is_requester_local(&self, local_provider: &str) -> bool {
		self.requester == local_provider
	}

	pub fn is_requester_remote(&self, local_provider: &str) -> bool {
		!self.is_requester_local(local_provider)
	}
}

/// The mutable part of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
	pub state: OrderState,
	/// Cloud-side id, assigned once the request succeeds.
	#[serde(default)]
	pub instance_id: Option<String>,
	/// Last instance observed, served to status queries.
	#[serde(default)]
	pub cached_instance: Option<Instance>,
	/// Resources actually granted, which may differ from the request.
	#[serde(default)]
	pub actual_allocation: Option<Allocation>,
	#[serde(default)]
	pub fault_message: Option<String>,
	/// Whether the request was actually delivered to a remote provider.
	#[serde(default)]
	pub forwarded: bool,
	/// Whether the stop for the current STOPPING episode was sent to the cloud.
	#[serde(default)]
	pub stop_issued: bool,
}

impl Default for OrderStatus {
	fn default() -> Self {
		Self {
			state: OrderState::Open,
			instance_id: None,
			cached_instance: None,
			actual_allocation: None,
			fault_message: None,
			forwarded: false,
			stop_issued: false,
		}
	}
}

impl OrderStatus {
	/// Records the first failure cause. Later causes are ignored.
	pub fn set_fault_message_once(&mut self, message: impl Into<String>) {
		if self.fault_message.is_none() {
			self.fault_message = Some(message.into());
		}
	}

	/// Copies the fields owned by the remote provider from its snapshot.
	///
	/// The state is left alone; mirroring it goes through the transition protocol.
	pub fn update_from_remote(&mut self, remote: &OrderStatus) {
		self.instance_id = remote.instance_id.clone();
		self.cached_instance = remote.cached_instance.clone();
		self.actual_allocation = remote.actual_allocation;
		if let Some(message) = &remote.fault_message {
			self.set_fault_message_once(message.clone());
		}
	}
}

/// Persisted shape of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
	pub spec: OrderSpec,
	pub status: OrderStatus,
}
