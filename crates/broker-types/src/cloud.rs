//! Cloud-side resource types.
//!
//! These are the values a cloud plugin or a remote provider reports back about
//! the resources behind orders, normalized to a provider-independent shape.

use crate::order::ResourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

/// Provider-independent status of a cloud instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
	/// Request accepted by the broker, not yet sent to the cloud.
	Dispatched,
	/// Being created by the cloud.
	Spawning,
	/// Usable.
	Ready,
	/// Exists but is undergoing an operation.
	Busy,
	Stopping,
	Stopped,
	/// The cloud reports an error for the instance.
	Failed,
	/// No cloud-side instance to report on.
	Inactive,
}

impl InstanceState {
	pub fn is_ready(&self) -> bool {
		matches!(self, InstanceState::Ready)
	}

	pub fn has_failed(&self) -> bool {
		matches!(self, InstanceState::Failed)
	}

	pub fn is_stopped(&self) -> bool {
		matches!(self, InstanceState::Stopped)
	}
}

impl fmt::Display for InstanceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			InstanceState::Dispatched => "DISPATCHED",
			InstanceState::Spawning => "SPAWNING",
			InstanceState::Ready => "READY",
			InstanceState::Busy => "BUSY",
			InstanceState::Stopping => "STOPPING",
			InstanceState::Stopped => "STOPPED",
			InstanceState::Failed => "FAILED",
			InstanceState::Inactive => "INACTIVE",
		};
		f.write_str(name)
	}
}

/// Compute resources, either granted to an instance or aggregated over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeAllocation {
	pub instances: u32,
	pub vcpu: u32,
	pub memory_mb: u64,
	pub disk_gb: u64,
}

impl ComputeAllocation {
	/// Component-wise difference, floored at zero.
	pub fn saturating_sub(&self, other: &ComputeAllocation) -> ComputeAllocation {
		ComputeAllocation {
			instances: self.instances.saturating_sub(other.instances),
			vcpu: self.vcpu.saturating_sub(other.vcpu),
			memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
			disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
		}
	}

	/// Returns true when every component of `other` fits within `self`.
	pub fn covers(&self, other: &ComputeAllocation) -> bool {
		self.instances >= other.instances
			&& self.vcpu >= other.vcpu
			&& self.memory_mb >= other.memory_mb
			&& self.disk_gb >= other.disk_gb
	}
}

impl Add for ComputeAllocation {
	type Output = ComputeAllocation;

	fn add(self, rhs: ComputeAllocation) -> ComputeAllocation {
		ComputeAllocation {
			instances: self.instances + rhs.instances,
			vcpu: self.vcpu + rhs.vcpu,
			memory_mb: self.memory_mb + rhs.memory_mb,
			disk_gb: self.disk_gb + rhs.disk_gb,
		}
	}
}

impl AddAssign for ComputeAllocation {
	fn add_assign(&mut self, rhs: ComputeAllocation) {
		*self = *self + rhs;
	}
}

/// Volumes held, with their total size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAllocation {
	pub volumes: u32,
	pub storage_gb: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAllocation {
	pub networks: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpAllocation {
	pub public_ips: u32,
}

/// Resources held by one order, or summed over the orders of one resource type.
///
/// Attachments hold nothing of their own and have no allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Allocation {
	Compute(ComputeAllocation),
	Volume(VolumeAllocation),
	Network(NetworkAllocation),
	PublicIp(PublicIpAllocation),
}

impl Allocation {
	/// Empty allocation of `resource`, or None for attachments.
	pub fn zero(resource: ResourceType) -> Option<Allocation> {
		match resource {
			ResourceType::Compute => Some(Allocation::Compute(ComputeAllocation::default())),
			ResourceType::Volume => Some(Allocation::Volume(VolumeAllocation::default())),
			ResourceType::Network => Some(Allocation::Network(NetworkAllocation::default())),
			ResourceType::PublicIp => Some(Allocation::PublicIp(PublicIpAllocation::default())),
			ResourceType::Attachment => None,
		}
	}

	pub fn resource_type(&self) -> ResourceType {
		match self {
			Allocation::Compute(_) => ResourceType::Compute,
			Allocation::Volume(_) => ResourceType::Volume,
			Allocation::Network(_) => ResourceType::Network,
			Allocation::PublicIp(_) => ResourceType::PublicIp,
		}
	}

	pub fn as_compute(&self) -> Option<&ComputeAllocation> {
		match self {
			Allocation::Compute(compute) => Some(compute),
			_ => None,
		}
	}

	/// Adds `other` into `self`. Returns false, leaving `self` untouched, when
	/// the two describe different resource types.
	pub fn accumulate(&mut self, other: &Allocation) -> bool {
		match (self, other) {
			(Allocation::Compute(total), Allocation::Compute(more)) => *total += *more,
			(Allocation::Volume(total), Allocation::Volume(more)) => {
				total.volumes += more.volumes;
				total.storage_gb += more.storage_gb;
			},
			(Allocation::Network(total), Allocation::Network(more)) => {
				total.networks += more.networks;
			},
			(Allocation::PublicIp(total), Allocation::PublicIp(more)) => {
				total.public_ips += more.public_ips;
			},
			_ => return false,
		}
		true
	}
}

/// Snapshot of a cloud-side resource as seen by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
	/// Cloud-side id. None for an empty instance built from the order state.
	pub id: Option<String>,
	pub state: InstanceState,
	/// Raw state string reported by the cloud, kept for diagnostics.
	#[serde(default)]
	pub cloud_state: Option<String>,
	#[serde(default)]
	pub provider: Option<String>,
	#[serde(default)]
	pub cloud_name: Option<String>,
	/// Resource-specific details (addresses, image, device, ...).
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
	/// Resources actually granted to the instance.
	#[serde(default)]
	pub allocation: Option<Allocation>,
	#[serde(default)]
	pub fault_message: Option<String>,
}

impl Instance {
	/// Creates an instance that has no cloud-side counterpart.
	pub fn empty(state: InstanceState) -> Self {
		Self {
			id: None,
			state,
			cloud_state: None,
			provider: None,
			cloud_name: None,
			attributes: BTreeMap::new(),
			allocation: None,
			fault_message: None,
		}
	}

	pub fn is_ready(&self) -> bool {
		self.state.is_ready()
	}

	pub fn has_failed(&self) -> bool {
		self.state.has_failed()
	}

	pub fn is_stopped(&self) -> bool {
		self.state.is_stopped()
	}
}

/// Compute quota of a user in one cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeQuota {
	pub total: ComputeAllocation,
	pub used: ComputeAllocation,
}

impl ComputeQuota {
	pub fn available(&self) -> ComputeAllocation {
		self.total.saturating_sub(&self.used)
	}
}

/// Image available for compute requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub size_bytes: Option<u64>,
	#[serde(default)]
	pub min_disk_gb: Option<u64>,
	#[serde(default)]
	pub status: Option<String>,
}

/// Traffic direction of a security rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
	Ingress,
	Egress,
}

/// Firewall rule attached to a network or public IP order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
	/// Cloud-side id, empty until the rule is created.
	#[serde(default)]
	pub id: String,
	pub direction: RuleDirection,
	pub port_from: u16,
	pub port_to: u16,
	pub cidr: String,
	/// Transport protocol, e.g. "tcp", "udp" or "any".
	pub protocol: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_allocation_arithmetic() {
		let granted = ComputeAllocation {
			instances: 1,
			vcpu: 2,
			memory_mb: 2048,
			disk_gb: 20,
		};
		let mut total = ComputeAllocation::default();
		total += granted;
		total += granted;
		assert_eq!(total.vcpu, 4);
		assert_eq!(total.instances, 2);

		let quota = ComputeQuota {
			total: ComputeAllocation {
				instances: 3,
				vcpu: 4,
				memory_mb: 4096,
				disk_gb: 100,
			},
			used: total,
		};
		assert_eq!(quota.available().vcpu, 0);
		assert_eq!(quota.available().disk_gb, 60);
		assert!(!quota.available().covers(&granted));
	}

	#[test]
	fn test_allocation_accumulates_per_resource_type() {
		let mut volumes = Allocation::zero(ResourceType::Volume).unwrap();
		let volume = Allocation::Volume(VolumeAllocation {
			volumes: 1,
			storage_gb: 30,
		});
		assert!(volumes.accumulate(&volume));
		assert!(volumes.accumulate(&volume));
		assert_eq!(
			volumes,
			Allocation::Volume(VolumeAllocation {
				volumes: 2,
				storage_gb: 60,
			})
		);

		let network = Allocation::Network(NetworkAllocation { networks: 1 });
		assert!(!volumes.accumulate(&network));
		assert_eq!(volumes.resource_type(), ResourceType::Volume);
		assert!(volumes.as_compute().is_none());

		assert!(Allocation::zero(ResourceType::Attachment).is_none());
	}

	#[test]
	fn test_empty_instance() {
		let instance = Instance::empty(InstanceState::Dispatched);
		assert!(instance.id.is_none());
		assert!(!instance.is_ready());
		assert_eq!(instance.state.to_string(), "DISPATCHED");
	}
}
