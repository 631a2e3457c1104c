//! Request handling over the lifecycle engine.
//!
//! The order controller is the surface user-facing layers (and peers, through
//! the federation endpoint) use to create orders, read them and express user
//! intents. It never drives an order forward itself; it only places orders
//! in the lists the processors walk.

pub mod drain;
pub mod federation;

pub use drain::{DrainBarrier, DrainPermit};
pub use federation::FederationEndpoint;

use crate::connector::{CloudConnectorFactory, ConnectorError};
use crate::state::{Order, Transitioner, TransitionError};
use broker_storage::{OrderStore, StorageError};
use broker_types::{
	truncate_id, Allocation, ComputeQuota, ImageSummary, Instance, InstanceState,
	OrderRecord, OrderSpec, OrderState, ResourceType, SecurityRule, SystemUser,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum ControllerError {
	#[error("Order not found: {0}")]
	NotFound(String),
	#[error("Order already being deleted: {0}")]
	AlreadyDeleting(String),
	#[error("Order has active dependants: {0}")]
	HasDependants(String),
	#[error("Invalid state: {0}")]
	InvalidState(String),
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	#[error("Connector error: {0}")]
	Connector(#[from] ConnectorError),
	#[error("Transition error: {0}")]
	Transition(#[from] TransitionError),
	#[error("Storage error: {0}")]
	Storage(StorageError),
}

impl From<StorageError> for ControllerError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::NotFound => ControllerError::NotFound("no stored record".to_string()),
			other => ControllerError::Storage(other),
		}
	}
}

/// Status line of one order, as listed to its user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
	pub order_id: String,
	pub name: Option<String>,
	pub provider: String,
	pub cloud_name: String,
	pub state: InstanceState,
}

/// Instance state a user sees for an order in `state`.
fn displayed_state(state: OrderState) -> InstanceState {
	match state {
		OrderState::Open | OrderState::Pending => InstanceState::Dispatched,
		OrderState::Spawning => InstanceState::Spawning,
		OrderState::Fulfilled => InstanceState::Ready,
		OrderState::Stopping => InstanceState::Stopping,
		OrderState::Stopped => InstanceState::Stopped,
		OrderState::FailedOnRequest | OrderState::FailedAfterSuccessfulRequest => {
			InstanceState::Failed
		},
		OrderState::UnableToCheckStatus => InstanceState::Busy,
		OrderState::AssignedForDeletion
		| OrderState::CheckingDeletion
		| OrderState::Closed
		| OrderState::Deactivated => InstanceState::Inactive,
	}
}

pub struct OrderController {
	transitioner: Arc<Transitioner>,
	connectors: Arc<CloudConnectorFactory>,
	store: OrderStore,
	barrier: Arc<DrainBarrier>,
}

impl OrderController {
	pub fn new(
		transitioner: Arc<Transitioner>,
		connectors: Arc<CloudConnectorFactory>,
		store: OrderStore,
		barrier: Arc<DrainBarrier>,
	) -> Self {
		Self {
			transitioner,
			connectors,
			store,
			barrier,
		}
	}

	pub fn local_provider(&self) -> &str {
		self.transitioner.registry().local_provider()
	}

	fn active(&self, order_id: &str) -> Result<Arc<Order>, ControllerError> {
		self.transitioner
			.registry()
			.get(order_id)
			.ok_or_else(|| ControllerError::NotFound(order_id.to_string()))
	}

	/// Accepts a new order. It starts OPEN and is picked up by the open processor.
	///
	/// Orders embedded in a composite resource must be active and not being
	/// deleted. Their locks are held until the new order is registered as a
	/// dependant, so a concurrent delete either sees the dependant or wins
	/// and makes this call fail.
	#[instrument(skip_all, fields(order_id = %truncate_id(&spec.id)))]
	pub async fn activate_order(&self, spec: OrderSpec) -> Result<String, ControllerError> {
		let _permit = self.barrier.enter().await;
		let registry = self.transitioner.registry();

		// Sorted so concurrent activations take shared locks in the same order.
		let mut referenced_ids = spec.resource.embedded_order_ids();
		referenced_ids.sort_unstable();
		referenced_ids.dedup();
		let mut referenced = Vec::with_capacity(referenced_ids.len());
		for id in referenced_ids {
			let order = registry.get(id).ok_or_else(|| {
				ControllerError::InvalidRequest(format!("referenced order {} is not active", id))
			})?;
			referenced.push(order);
		}

		let mut held = Vec::with_capacity(referenced.len());
		for order in &referenced {
			let status = order.lock().await;
			if status.state.is_deleting() {
				return Err(ControllerError::InvalidRequest(format!(
					"referenced order {} is being deleted",
					order.id()
				)));
			}
			held.push(status);
		}

		let order = self.transitioner.activate(spec).await?;
		drop(held);
		Ok(order.id().to_string())
	}

	/// The order's record. Deactivated orders are served from storage.
	pub async fn get_order(&self, order_id: &str) -> Result<OrderRecord, ControllerError> {
		let _permit = self.barrier.enter().await;
		match self.transitioner.registry().get(order_id) {
			Some(order) => Ok(order.record().await),
			None => self.store.get(order_id).await.map_err(|e| match e {
				StorageError::NotFound => ControllerError::NotFound(order_id.to_string()),
				other => other.into(),
			}),
		}
	}

	/// Fetches the order's instance and caches it. When the backend cannot be
	/// reached, the last cached instance is returned instead.
	pub async fn get_resource_instance(&self, order_id: &str) -> Result<Instance, ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		let mut status = order.lock().await;
		let connector = self.connectors.connector_for(&order.spec().provider);
		match connector.get_instance(order.spec(), &status).await {
			Ok(instance) => {
				status.cached_instance = Some(instance.clone());
				Ok(instance)
			},
			Err(e) if e.is_unavailable() => match &status.cached_instance {
				Some(cached) => {
					tracing::debug!(order_id = %truncate_id(order_id), error = %e, "Serving cached instance");
					Ok(cached.clone())
				},
				None => Err(e.into()),
			},
			Err(e) => Err(e.into()),
		}
	}

	/// User intent to stop a fulfilled compute order.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn stop_order(&self, order_id: &str) -> Result<(), ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		if order.spec().resource_type() != ResourceType::Compute {
			return Err(ControllerError::InvalidRequest(format!(
				"only compute orders can be stopped, not {}",
				order.spec().resource_type()
			)));
		}
		let mut status = order.lock().await;
		if status.state != OrderState::Fulfilled {
			return Err(ControllerError::InvalidState(format!(
				"order {} is {}",
				order_id, status.state
			)));
		}
		status.stop_issued = false;
		self.transitioner
			.transition_locked(&order, &mut status, OrderState::Stopping)
			.await?;
		Ok(())
	}

	/// User intent to delete an order.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn delete_order(&self, order_id: &str) -> Result<(), ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		let mut status = order.lock().await;
		if status.state.is_deleting() {
			return Err(ControllerError::AlreadyDeleting(order_id.to_string()));
		}
		let dependants = self.transitioner.registry().dependant_count(order_id);
		if dependants > 0 {
			return Err(ControllerError::HasDependants(format!(
				"{} is used by {} active order(s)",
				order_id, dependants
			)));
		}
		self.transitioner
			.transition_locked(&order, &mut status, OrderState::AssignedForDeletion)
			.await?;
		Ok(())
	}

	/// Resources held by the user's fulfilled orders of one type on one cloud.
	///
	/// Orders whose cloud never reported a grant count with what they asked for.
	pub async fn get_user_allocation(
		&self,
		user_id: &str,
		provider: &str,
		cloud_name: &str,
		resource_type: ResourceType,
	) -> Result<Allocation, ControllerError> {
		let _permit = self.barrier.enter().await;
		let mut total = Allocation::zero(resource_type).ok_or_else(|| {
			ControllerError::InvalidRequest(format!("{} orders hold no allocation", resource_type))
		})?;
		for order in self.transitioner.registry().all_orders() {
			let spec = order.spec();
			if spec.system_user.user_id != user_id
				|| spec.provider != provider
				|| spec.cloud_name != cloud_name
				|| spec.resource_type() != resource_type
			{
				continue;
			}
			let status = order.status().await;
			if status.state != OrderState::Fulfilled {
				continue;
			}
			let Some(allocation) = status
				.actual_allocation
				.or_else(|| spec.resource.requested_allocation())
			else {
				continue;
			};
			if !total.accumulate(&allocation) {
				tracing::warn!(
					order_id = %truncate_id(order.id()),
					resource = %resource_type,
					"Ignoring allocation of another resource type"
				);
			}
		}
		Ok(total)
	}

	/// Status lines for the user's active orders of one resource type, oldest first.
	pub async fn get_instances_status(
		&self,
		user_id: &str,
		resource_type: ResourceType,
	) -> Result<Vec<InstanceStatus>, ControllerError> {
		let _permit = self.barrier.enter().await;
		let mut orders: Vec<Arc<Order>> = self
			.transitioner
			.registry()
			.all_orders()
			.into_iter()
			.filter(|order| {
				order.spec().system_user.user_id == user_id
					&& order.spec().resource_type() == resource_type
			})
			.collect();
		orders.sort_by(|a, b| {
			a.spec()
				.created_at
				.cmp(&b.spec().created_at)
				.then_with(|| a.id().cmp(b.id()))
		});

		let mut statuses = Vec::with_capacity(orders.len());
		for order in orders {
			let spec = order.spec();
			statuses.push(InstanceStatus {
				order_id: spec.id.clone(),
				name: spec.resource.name().map(str::to_string),
				provider: spec.provider.clone(),
				cloud_name: spec.cloud_name.clone(),
				state: displayed_state(order.state().await),
			});
		}
		Ok(statuses)
	}

	pub async fn get_user_quota(
		&self,
		provider: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, ControllerError> {
		let _permit = self.barrier.enter().await;
		Ok(self
			.connectors
			.connector_for(provider)
			.get_user_quota(cloud_name, user)
			.await?)
	}

	pub async fn get_all_images(
		&self,
		provider: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, ControllerError> {
		let _permit = self.barrier.enter().await;
		Ok(self
			.connectors
			.connector_for(provider)
			.get_all_images(cloud_name, user)
			.await?)
	}

	pub async fn get_image(
		&self,
		provider: &str,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, ControllerError> {
		let _permit = self.barrier.enter().await;
		Ok(self
			.connectors
			.connector_for(provider)
			.get_image(cloud_name, image_id, user)
			.await?)
	}

	pub async fn get_all_security_rules(
		&self,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		let status = order.lock().await;
		Ok(self
			.connectors
			.connector_for(&order.spec().provider)
			.get_all_security_rules(order.spec(), &status, user)
			.await?)
	}

	pub async fn request_security_rule(
		&self,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		let status = order.lock().await;
		Ok(self
			.connectors
			.connector_for(&order.spec().provider)
			.request_security_rule(order.spec(), &status, rule, user)
			.await?)
	}

	pub async fn delete_security_rule(
		&self,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), ControllerError> {
		let _permit = self.barrier.enter().await;
		let order = self.active(order_id)?;
		let status = order.lock().await;
		Ok(self
			.connectors
			.connector_for(&order.spec().provider)
			.delete_security_rule(order.spec(), &status, rule_id, user)
			.await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::processors::{process_pass, ProcessorContext, ProcessorKind, StateProcessor};
	use crate::test_support::{
		attachment_spec, compute_spec, memory_store, network_spec, processor_context,
		public_ip_spec, user, volume_spec, ScriptedCloud, LOCAL,
	};
	use broker_types::{NetworkAllocation, PublicIpAllocation, VolumeAllocation};

	struct Harness {
		cloud: Arc<ScriptedCloud>,
		context: Arc<ProcessorContext>,
		controller: OrderController,
		barrier: Arc<DrainBarrier>,
	}

	fn harness() -> Harness {
		let cloud = Arc::new(ScriptedCloud::default());
		let store = memory_store();
		let context = processor_context(cloud.clone(), None, store.clone());
		let barrier = Arc::new(DrainBarrier::new());
		let controller = OrderController::new(
			context.transitioner.clone(),
			context.connectors.clone(),
			store,
			barrier.clone(),
		);
		Harness {
			cloud,
			context,
			controller,
			barrier,
		}
	}

	impl Harness {
		async fn pass(&self, kind: ProcessorKind) {
			let processor = StateProcessor::new(kind, self.context.clone()).unwrap();
			process_pass(&processor, None).await;
		}

		async fn instance_id(&self, order_id: &str) -> String {
			self.controller
				.get_order(order_id)
				.await
				.unwrap()
				.status
				.instance_id
				.unwrap()
		}

		/// Marks the order's instance active and runs the spawning pass.
		async fn fulfil(&self, order_id: &str) {
			let instance_id = self.instance_id(order_id).await;
			self.cloud.set_instance_state(&instance_id, "active");
			self.pass(ProcessorKind::Spawning).await;
			assert_eq!(
				self.controller.get_order(order_id).await.unwrap().status.state,
				OrderState::Fulfilled
			);
		}

		/// Activates an order and drives it to FULFILLED.
		async fn fulfilled(&self, spec: OrderSpec) -> String {
			let id = self.controller.activate_order(spec).await.unwrap();
			self.pass(ProcessorKind::Open).await;
			self.fulfil(&id).await;
			id
		}

		async fn fulfilled_compute(&self) -> String {
			self.fulfilled(compute_spec(LOCAL)).await
		}
	}

	#[tokio::test]
	async fn test_get_order_falls_back_to_history() {
		let h = harness();
		let id = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		assert_eq!(
			h.controller.get_order(&id).await.unwrap().status.state,
			OrderState::Open
		);

		h.controller.delete_order(&id).await.unwrap();
		h.pass(ProcessorKind::AssignedForDeletion).await;
		h.pass(ProcessorKind::CheckingDeletion).await;
		h.pass(ProcessorKind::Closed).await;

		let record = h.controller.get_order(&id).await.unwrap();
		assert_eq!(record.status.state, OrderState::Deactivated);
		assert!(matches!(
			h.controller.get_order("missing").await,
			Err(ControllerError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_delete_rules() {
		let h = harness();
		let compute = h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();
		let volume = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		let attachment = h
			.controller
			.activate_order(attachment_spec(LOCAL, &compute, &volume))
			.await
			.unwrap();

		assert!(matches!(
			h.controller.delete_order(&compute).await,
			Err(ControllerError::HasDependants(_))
		));

		h.controller.delete_order(&attachment).await.unwrap();
		assert!(matches!(
			h.controller.delete_order(&attachment).await,
			Err(ControllerError::AlreadyDeleting(_))
		));

		// The attachment still counts until it is evicted.
		assert!(h.controller.delete_order(&volume).await.is_err());
		h.pass(ProcessorKind::AssignedForDeletion).await;
		h.pass(ProcessorKind::CheckingDeletion).await;
		h.pass(ProcessorKind::Closed).await;
		h.controller.delete_order(&volume).await.unwrap();
	}

	#[tokio::test]
	async fn test_unknown_reference_is_rejected() {
		let h = harness();
		let result = h
			.controller
			.activate_order(attachment_spec(LOCAL, "nope", "nada"))
			.await;
		assert!(matches!(result, Err(ControllerError::InvalidRequest(_))));
		assert!(h.context.transitioner.registry().is_empty());
	}

	#[tokio::test]
	async fn test_reference_to_deleting_order_is_rejected() {
		let h = harness();
		let compute = h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();
		let volume = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		h.controller.delete_order(&compute).await.unwrap();

		let result = h
			.controller
			.activate_order(attachment_spec(LOCAL, &compute, &volume))
			.await;
		assert!(matches!(result, Err(ControllerError::InvalidRequest(_))));
		assert_eq!(h.context.transitioner.registry().dependant_count(&volume), 0);
		assert_eq!(h.context.transitioner.registry().len(), 2);
	}

	#[tokio::test]
	async fn test_concurrent_delete_and_reference_never_both_succeed() {
		let h = harness();
		for _ in 0..20 {
			let compute = h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();
			let volume = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();

			let (attached, deleted) = tokio::join!(
				h.controller
					.activate_order(attachment_spec(LOCAL, &compute, &volume)),
				h.controller.delete_order(&compute),
			);
			match (attached, deleted) {
				(Ok(_), Err(ControllerError::HasDependants(_))) => {
					assert_eq!(h.context.transitioner.registry().dependant_count(&compute), 1);
				},
				(Err(ControllerError::InvalidRequest(_)), Ok(())) => {
					assert_eq!(h.context.transitioner.registry().dependant_count(&compute), 0);
				},
				(attached, deleted) => {
					panic!("unexpected outcome: {:?} / {:?}", attached, deleted)
				},
			}
		}
	}

	#[tokio::test]
	async fn test_stop_only_from_fulfilled_compute() {
		let h = harness();
		let volume = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		assert!(matches!(
			h.controller.stop_order(&volume).await,
			Err(ControllerError::InvalidRequest(_))
		));

		let pending = h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();
		assert!(matches!(
			h.controller.stop_order(&pending).await,
			Err(ControllerError::InvalidState(_))
		));

		let compute = h.fulfilled_compute().await;
		h.controller.stop_order(&compute).await.unwrap();
		assert_eq!(
			h.controller.get_order(&compute).await.unwrap().status.state,
			OrderState::Stopping
		);
	}

	#[tokio::test]
	async fn test_compute_allocation_counts_fulfilled_orders() {
		let h = harness();
		h.fulfilled_compute().await;
		h.fulfilled_compute().await;
		h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();

		let allocation = h
			.controller
			.get_user_allocation("u-1", LOCAL, "default", ResourceType::Compute)
			.await
			.unwrap();
		let compute = allocation.as_compute().copied().unwrap();
		assert_eq!(compute.instances, 2);
		assert_eq!(compute.vcpu, 4);
		assert_eq!(
			h.controller
				.get_user_allocation("someone-else", LOCAL, "default", ResourceType::Compute)
				.await
				.unwrap(),
			Allocation::zero(ResourceType::Compute).unwrap()
		);
	}

	#[tokio::test]
	async fn test_volume_allocation_uses_granted_storage() {
		let h = harness();
		let id = h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		h.pass(ProcessorKind::Open).await;
		let instance_id = h.instance_id(&id).await;
		// The cloud rounds the 10 GB request up.
		h.cloud.set_allocation(
			&instance_id,
			Allocation::Volume(VolumeAllocation {
				volumes: 1,
				storage_gb: 16,
			}),
		);
		h.fulfil(&id).await;
		h.fulfilled(volume_spec(LOCAL)).await;

		let allocation = h
			.controller
			.get_user_allocation("u-1", LOCAL, "default", ResourceType::Volume)
			.await
			.unwrap();
		assert_eq!(
			allocation,
			Allocation::Volume(VolumeAllocation {
				volumes: 2,
				storage_gb: 26,
			})
		);
	}

	#[tokio::test]
	async fn test_network_allocation_counts_networks() {
		let h = harness();
		h.fulfilled(network_spec(LOCAL)).await;
		h.fulfilled(network_spec(LOCAL)).await;
		h.controller.activate_order(network_spec(LOCAL)).await.unwrap();

		let allocation = h
			.controller
			.get_user_allocation("u-1", LOCAL, "default", ResourceType::Network)
			.await
			.unwrap();
		assert_eq!(allocation, Allocation::Network(NetworkAllocation { networks: 2 }));
	}

	#[tokio::test]
	async fn test_public_ip_allocation_counts_addresses() {
		let h = harness();
		let compute = h.fulfilled_compute().await;
		h.fulfilled(public_ip_spec(LOCAL, &compute)).await;

		let allocation = h
			.controller
			.get_user_allocation("u-1", LOCAL, "default", ResourceType::PublicIp)
			.await
			.unwrap();
		assert_eq!(
			allocation,
			Allocation::PublicIp(PublicIpAllocation { public_ips: 1 })
		);
		// The compute behind the address is counted on its own.
		let computes = h
			.controller
			.get_user_allocation("u-1", LOCAL, "default", ResourceType::Compute)
			.await
			.unwrap();
		assert_eq!(computes.as_compute().map(|c| c.instances), Some(1));
	}

	#[tokio::test]
	async fn test_attachment_allocation_is_rejected() {
		let h = harness();
		assert!(matches!(
			h.controller
				.get_user_allocation("u-1", LOCAL, "default", ResourceType::Attachment)
				.await,
			Err(ControllerError::InvalidRequest(_))
		));
	}

	#[tokio::test]
	async fn test_instances_status_lists_user_orders() {
		let h = harness();
		let ready = h.fulfilled_compute().await;
		let waiting = h.controller.activate_order(compute_spec(LOCAL)).await.unwrap();
		h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();

		let statuses = h
			.controller
			.get_instances_status("u-1", ResourceType::Compute)
			.await
			.unwrap();
		assert_eq!(statuses.len(), 2);
		let state_of = |id: &str| {
			statuses
				.iter()
				.find(|s| s.order_id == id)
				.map(|s| s.state)
		};
		assert_eq!(state_of(&ready), Some(InstanceState::Ready));
		assert_eq!(state_of(&waiting), Some(InstanceState::Dispatched));
		assert!(statuses.iter().all(|s| s.name.as_deref() == Some("vm")));
	}

	#[tokio::test]
	async fn test_cached_instance_served_when_cloud_down() {
		let h = harness();
		let id = h.fulfilled_compute().await;
		let live = h.controller.get_resource_instance(&id).await.unwrap();
		assert_eq!(live.state, InstanceState::Ready);

		h.cloud.set_unavailable(true);
		let cached = h.controller.get_resource_instance(&id).await.unwrap();
		assert_eq!(cached, live);
	}

	#[tokio::test]
	async fn test_pass_throughs_reach_the_cloud() {
		let h = harness();
		let quota = h
			.controller
			.get_user_quota(LOCAL, "default", &user())
			.await
			.unwrap();
		assert_eq!(quota.total.instances, 10);
		let images = h
			.controller
			.get_all_images(LOCAL, "default", &user())
			.await
			.unwrap();
		assert_eq!(images.len(), 1);
		let image = h
			.controller
			.get_image(LOCAL, "default", &images[0].id, &user())
			.await
			.unwrap();
		assert_eq!(image, images[0]);
	}

	#[tokio::test]
	async fn test_calls_hold_a_permit_while_running() {
		let h = harness();
		h.barrier.drain().await;
		let blocked = tokio::time::timeout(
			std::time::Duration::from_millis(50),
			h.controller.activate_order(volume_spec(LOCAL)),
		)
		.await;
		assert!(blocked.is_err());

		h.barrier.resume();
		h.controller.activate_order(volume_spec(LOCAL)).await.unwrap();
		assert_eq!(h.barrier.in_flight(), 0);
	}
}
