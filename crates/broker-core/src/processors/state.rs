//! Processors for the per-state lists.
//!
//! Each pass polls the cloud (or peer) serving an order and moves the order
//! according to what it reports. Definite answers move the order; a backend
//! that cannot be reached leaves it where it is for the next pass, except in
//! FAILED_AFTER_SUCCESSFUL_REQUEST where that is itself worth recording.

use super::{OrderProcessor, ProcessorContext, ProcessorError, ProcessorKind};
use crate::connector::CloudConnector;
use crate::state::{Order, OrderList, RegistryError, TransitionError};
use async_trait::async_trait;
use broker_types::{truncate_id, Instance, InstanceState, OrderState, OrderStatus};
use std::sync::Arc;
use tracing::instrument;

pub struct StateProcessor {
	kind: ProcessorKind,
	source: OrderState,
	list: Arc<OrderList>,
	context: Arc<ProcessorContext>,
}

impl StateProcessor {
	/// Creates the processor for `kind`. Fails for the remote sync kind,
	/// which has no state list of its own.
	pub fn new(kind: ProcessorKind, context: Arc<ProcessorContext>) -> Result<Self, RegistryError> {
		let source = kind.source_state().ok_or_else(|| {
			RegistryError::Consistency(format!("{} does not walk a state list", kind))
		})?;
		let list = context.transitioner.registry().state_list(source)?.clone();
		Ok(Self {
			kind,
			source,
			list,
			context,
		})
	}

	fn connector(&self, order: &Order) -> Arc<dyn CloudConnector> {
		self.context.connectors.connector_for(&order.spec().provider)
	}

	fn is_remote(&self, order: &Order) -> bool {
		self.context.transitioner.registry().is_remote(order.spec())
	}

	async fn move_to(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
		state: OrderState,
	) -> Result<(), ProcessorError> {
		self.context
			.transitioner
			.transition_locked(order, status, state)
			.await?;
		Ok(())
	}

	fn record_failure(status: &mut OrderStatus, instance: Option<&Instance>, fallback: &str) {
		let message = instance
			.and_then(|i| i.fault_message.clone())
			.unwrap_or_else(|| fallback.to_string());
		status.set_fault_message_once(message);
	}

	async fn process_open(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		let remote = self.is_remote(order);
		match self.connector(order).request_instance(order.spec()).await {
			Ok(Some(instance_id)) => {
				status.instance_id = Some(instance_id);
				self.move_to(order, status, OrderState::Spawning).await
			},
			Ok(None) if remote => {
				status.forwarded = true;
				self.move_to(order, status, OrderState::Pending).await
			},
			Ok(None) => {
				tracing::warn!(order_id = %truncate_id(order.id()), "Cloud returned no instance id");
				status.set_fault_message_once("Cloud returned no instance id");
				self.move_to(order, status, OrderState::FailedOnRequest).await
			},
			Err(e) => {
				tracing::warn!(order_id = %truncate_id(order.id()), error = %e, "Request failed");
				status.set_fault_message_once(e.to_string());
				self.move_to(order, status, OrderState::FailedOnRequest).await
			},
		}
	}

	async fn process_spawning(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		let instance = match self.connector(order).get_instance(order.spec(), status).await {
			Ok(instance) => instance,
			Err(e) if e.is_not_found() => {
				status.set_fault_message_once("Instance disappeared while spawning");
				return self
					.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await;
			},
			Err(e) => return Err(e.into()),
		};

		if instance.is_ready() {
			status.actual_allocation = instance
				.allocation
				.or_else(|| order.spec().resource.requested_allocation());
			status.cached_instance = Some(instance);
			self.move_to(order, status, OrderState::Fulfilled).await
		} else if instance.has_failed() {
			Self::record_failure(status, Some(&instance), "Instance failed while spawning");
			status.cached_instance = Some(instance);
			self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
				.await
		} else {
			status.cached_instance = Some(instance);
			Ok(())
		}
	}

	async fn process_fulfilled(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		match self.connector(order).get_instance(order.spec(), status).await {
			Ok(instance) if instance.has_failed() => {
				Self::record_failure(status, Some(&instance), "Instance failed");
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await
			},
			Ok(instance) => {
				status.cached_instance = Some(instance);
				Ok(())
			},
			Err(e) if e.is_not_found() => {
				status.set_fault_message_once("Instance no longer exists");
				self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await
			},
			Err(e) => Err(e.into()),
		}
	}

	async fn process_failed(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		match self.connector(order).get_instance(order.spec(), status).await {
			Ok(instance) if instance.is_ready() => {
				tracing::info!(order_id = %truncate_id(order.id()), "Instance recovered");
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::Fulfilled).await
			},
			Ok(instance) => {
				status.cached_instance = Some(instance);
				Ok(())
			},
			Err(e) if e.is_not_found() => Ok(()),
			Err(e) if e.is_unavailable() => {
				tracing::warn!(order_id = %truncate_id(order.id()), error = %e, "Unable to check instance status");
				self.move_to(order, status, OrderState::UnableToCheckStatus)
					.await
			},
			Err(e) => Err(e.into()),
		}
	}

	async fn process_unable_to_check(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		match self.connector(order).get_instance(order.spec(), status).await {
			Ok(instance) if instance.is_ready() => {
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::Fulfilled).await
			},
			Ok(instance) if instance.has_failed() => {
				Self::record_failure(status, Some(&instance), "Instance failed");
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await
			},
			Ok(instance) => {
				status.cached_instance = Some(instance);
				Ok(())
			},
			Err(e) if e.is_not_found() => {
				status.set_fault_message_once("Instance no longer exists");
				self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await
			},
			Err(e) if e.is_unavailable() => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	async fn process_stopping(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		let connector = self.connector(order);
		if self.is_remote(order) {
			// The peer drives the stop from here; remote sync mirrors its progress.
			connector.stop_instance(order.spec(), status).await?;
			return self.move_to(order, status, OrderState::Pending).await;
		}

		let instance = match connector.get_instance(order.spec(), status).await {
			Ok(instance) => instance,
			Err(e) if e.is_not_found() => {
				status.set_fault_message_once("Instance no longer exists");
				return self
					.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await;
			},
			Err(e) => return Err(e.into()),
		};

		match instance.state {
			InstanceState::Stopped => {
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::Stopped).await
			},
			InstanceState::Failed => {
				Self::record_failure(status, Some(&instance), "Instance failed while stopping");
				status.cached_instance = Some(instance);
				self.move_to(order, status, OrderState::FailedAfterSuccessfulRequest)
					.await
			},
			InstanceState::Stopping => {
				status.cached_instance = Some(instance);
				Ok(())
			},
			_ if status.stop_issued => {
				tracing::debug!(order_id = %truncate_id(order.id()), state = %instance.state, "Waiting for the cloud to stop the instance");
				status.cached_instance = Some(instance);
				Ok(())
			},
			_ => {
				connector.stop_instance(order.spec(), status).await?;
				status.stop_issued = true;
				tracing::info!(order_id = %truncate_id(order.id()), "Stop issued");
				status.cached_instance = Some(instance);
				Ok(())
			},
		}
	}

	async fn process_assigned_for_deletion(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		self.connector(order)
			.delete_instance(order.spec(), status)
			.await?;
		self.move_to(order, status, OrderState::CheckingDeletion).await
	}

	async fn process_checking_deletion(
		&self,
		order: &Arc<Order>,
		status: &mut OrderStatus,
	) -> Result<(), ProcessorError> {
		match self.connector(order).get_instance(order.spec(), status).await {
			Err(e) if e.is_not_found() => {
				status.cached_instance = None;
				self.move_to(order, status, OrderState::Closed).await
			},
			Ok(instance) => {
				tracing::debug!(
					order_id = %truncate_id(order.id()),
					instance_state = %instance.state,
					"Instance still present"
				);
				Ok(())
			},
			Err(e) => Err(e.into()),
		}
	}
}

#[async_trait]
impl OrderProcessor for StateProcessor {
	fn kind(&self) -> ProcessorKind {
		self.kind
	}

	fn list(&self) -> &OrderList {
		&self.list
	}

	#[instrument(skip_all, fields(processor = %self.kind, order_id = %truncate_id(order.id())))]
	async fn process_order(&self, order: &Arc<Order>) -> Result<(), ProcessorError> {
		if self.kind == ProcessorKind::Closed {
			// `deactivate` takes the lock and re-checks the state itself.
			self.context.transitioner.deactivate(order).await?;
			return Ok(());
		}

		let mut status = order.lock().await;
		if status.state != self.source {
			return Ok(());
		}

		let served_remotely = self.is_remote(order);
		match self.kind {
			ProcessorKind::Spawning
			| ProcessorKind::Fulfilled
			| ProcessorKind::Failed
			| ProcessorKind::UnableToCheckStatus
				if served_remotely =>
			{
				// Remote sync owns these while the peer serves the order.
				Ok(())
			},
			ProcessorKind::Open => self.process_open(order, &mut status).await,
			ProcessorKind::Spawning => self.process_spawning(order, &mut status).await,
			ProcessorKind::Fulfilled => self.process_fulfilled(order, &mut status).await,
			ProcessorKind::Failed => self.process_failed(order, &mut status).await,
			ProcessorKind::UnableToCheckStatus => {
				self.process_unable_to_check(order, &mut status).await
			},
			ProcessorKind::Stopping => self.process_stopping(order, &mut status).await,
			ProcessorKind::AssignedForDeletion => {
				self.process_assigned_for_deletion(order, &mut status).await
			},
			ProcessorKind::CheckingDeletion => {
				self.process_checking_deletion(order, &mut status).await
			},
			ProcessorKind::Closed | ProcessorKind::RemoteSync => Err(ProcessorError::Transition(
				TransitionError::Consistency(format!("{} cannot handle {}", self.kind, self.source)),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::processors::process_pass;
	use crate::test_support::{
		compute_spec, memory_store, processor_context, volume_spec, RecordingHandler,
		ScriptedCloud, LOCAL, PEER,
	};
	use broker_federation::implementations::loopback::LoopbackTransport;
	use broker_storage::OrderStore;

	struct Harness {
		cloud: Arc<ScriptedCloud>,
		context: Arc<ProcessorContext>,
		store: OrderStore,
	}

	impl Harness {
		fn new() -> Self {
			let cloud = Arc::new(ScriptedCloud::default());
			let store = memory_store();
			let context = processor_context(cloud.clone(), None, store.clone());
			Self {
				cloud,
				context,
				store,
			}
		}

		async fn pass(&self, kind: ProcessorKind) -> usize {
			let processor = StateProcessor::new(kind, self.context.clone()).unwrap();
			process_pass(&processor, None).await
		}

		async fn activate(&self, spec: broker_types::OrderSpec) -> Arc<Order> {
			self.context.transitioner.activate(spec).await.unwrap()
		}
	}

	#[tokio::test]
	async fn test_compute_lifecycle_until_instance_vanishes() {
		let h = Harness::new();
		h.cloud.set_request_result(Ok("i-1".into()));
		let order = h.activate(compute_spec(LOCAL)).await;

		h.pass(ProcessorKind::Open).await;
		let status = order.status().await;
		assert_eq!(status.state, OrderState::Spawning);
		assert_eq!(status.instance_id.as_deref(), Some("i-1"));

		// Still building: nothing moves.
		h.pass(ProcessorKind::Spawning).await;
		assert_eq!(order.state().await, OrderState::Spawning);

		h.cloud.set_instance_state("i-1", "active");
		h.pass(ProcessorKind::Spawning).await;
		let status = order.status().await;
		assert_eq!(status.state, OrderState::Fulfilled);
		assert_eq!(
			status
				.actual_allocation
				.and_then(|a| a.as_compute().copied())
				.map(|a| a.vcpu),
			Some(2)
		);
		assert_eq!(
			status.cached_instance.map(|i| i.state),
			Some(InstanceState::Ready)
		);

		h.cloud.remove_instance("i-1");
		h.pass(ProcessorKind::Fulfilled).await;
		assert_eq!(
			order.state().await,
			OrderState::FailedAfterSuccessfulRequest
		);
		assert_eq!(
			h.store.get(order.id()).await.unwrap().status.state,
			OrderState::FailedAfterSuccessfulRequest
		);
	}

	#[tokio::test]
	async fn test_missing_instance_id_fails_on_request_only() {
		let h = Harness::new();
		h.cloud.set_request_result(Ok(String::new()));
		let order = h.activate(volume_spec(LOCAL)).await;

		h.pass(ProcessorKind::Open).await;
		assert_eq!(order.state().await, OrderState::FailedOnRequest);

		for kind in ProcessorKind::ALL {
			if kind != ProcessorKind::RemoteSync {
				h.pass(kind).await;
			}
		}
		let status = order.status().await;
		assert_eq!(status.state, OrderState::FailedOnRequest);
		assert!(status.instance_id.is_none());
		assert!(status.fault_message.is_some());
	}

	#[tokio::test]
	async fn test_request_error_records_cause() {
		let h = Harness::new();
		h.cloud.set_request_result(Err(broker_cloud::CloudError::Failed(
			"quota exceeded".into(),
		)));
		let order = h.activate(volume_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		let status = order.status().await;
		assert_eq!(status.state, OrderState::FailedOnRequest);
		assert!(status.fault_message.unwrap().contains("quota exceeded"));
	}

	#[tokio::test]
	async fn test_deletion_closes_and_evicts() {
		let h = Harness::new();
		let order = h.activate(volume_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.context
			.transitioner
			.transition(&order, OrderState::AssignedForDeletion)
			.await
			.unwrap();

		h.pass(ProcessorKind::AssignedForDeletion).await;
		assert_eq!(order.state().await, OrderState::CheckingDeletion);
		assert!(!h.cloud.has_instance("i-1"));

		h.pass(ProcessorKind::CheckingDeletion).await;
		assert_eq!(order.state().await, OrderState::Closed);
		assert!(h.context.transitioner.registry().contains(order.id()));

		h.pass(ProcessorKind::Closed).await;
		assert_eq!(order.state().await, OrderState::Deactivated);
		assert!(!h.context.transitioner.registry().contains(order.id()));
		assert_eq!(
			h.store.get(order.id()).await.unwrap().status.state,
			OrderState::Deactivated
		);
	}

	#[tokio::test]
	async fn test_instance_still_present_keeps_checking() {
		let h = Harness::new();
		let order = h.activate(volume_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.context
			.transitioner
			.transition(&order, OrderState::CheckingDeletion)
			.await
			.unwrap();

		h.pass(ProcessorKind::CheckingDeletion).await;
		assert_eq!(order.state().await, OrderState::CheckingDeletion);

		h.cloud.set_unavailable(true);
		h.pass(ProcessorKind::CheckingDeletion).await;
		assert_eq!(order.state().await, OrderState::CheckingDeletion);
	}

	#[tokio::test]
	async fn test_failed_order_goes_through_unable_to_check() {
		let h = Harness::new();
		let order = h.activate(volume_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.context
			.transitioner
			.transition(&order, OrderState::FailedAfterSuccessfulRequest)
			.await
			.unwrap();

		// Failed instance: stays.
		h.cloud.set_instance_state("i-1", "error");
		h.pass(ProcessorKind::Failed).await;
		assert_eq!(
			order.state().await,
			OrderState::FailedAfterSuccessfulRequest
		);

		h.cloud.set_unavailable(true);
		h.pass(ProcessorKind::Failed).await;
		assert_eq!(order.state().await, OrderState::UnableToCheckStatus);

		// Still unreachable: stays.
		h.pass(ProcessorKind::UnableToCheckStatus).await;
		assert_eq!(order.state().await, OrderState::UnableToCheckStatus);

		h.cloud.set_unavailable(false);
		h.cloud.set_instance_state("i-1", "active");
		h.pass(ProcessorKind::UnableToCheckStatus).await;
		assert_eq!(order.state().await, OrderState::Fulfilled);
	}

	#[tokio::test]
	async fn test_unavailable_cloud_leaves_spawning_order() {
		let h = Harness::new();
		let order = h.activate(volume_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.cloud.set_unavailable(true);
		assert_eq!(h.pass(ProcessorKind::Spawning).await, 1);
		assert_eq!(order.state().await, OrderState::Spawning);
	}

	#[tokio::test]
	async fn test_local_stop_waits_for_instance() {
		let h = Harness::new();
		let order = h.activate(compute_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.cloud.set_instance_state("i-1", "active");
		h.pass(ProcessorKind::Spawning).await;
		h.context
			.transitioner
			.transition(&order, OrderState::Stopping)
			.await
			.unwrap();

		h.pass(ProcessorKind::Stopping).await;
		assert_eq!(h.cloud.stop_calls(), 1);
		assert_eq!(order.state().await, OrderState::Stopping);

		// Already stopping: no second stop call.
		h.pass(ProcessorKind::Stopping).await;
		assert_eq!(h.cloud.stop_calls(), 1);

		h.cloud.set_instance_state("i-1", "shutoff");
		h.pass(ProcessorKind::Stopping).await;
		assert_eq!(order.state().await, OrderState::Stopped);
	}

	#[tokio::test]
	async fn test_stop_is_sent_once_while_cloud_lags() {
		let h = Harness::new();
		let order = h.activate(compute_spec(LOCAL)).await;
		h.pass(ProcessorKind::Open).await;
		h.cloud.set_instance_state("i-1", "active");
		h.pass(ProcessorKind::Spawning).await;
		h.context
			.transitioner
			.transition(&order, OrderState::Stopping)
			.await
			.unwrap();

		// The cloud accepts the stop but keeps reporting the instance active.
		h.cloud.set_stop_ignored(true);
		for _ in 0..3 {
			h.pass(ProcessorKind::Stopping).await;
		}
		assert_eq!(h.cloud.stop_calls(), 1);
		assert!(order.status().await.stop_issued);
		assert_eq!(order.state().await, OrderState::Stopping);

		h.cloud.set_instance_state("i-1", "shutoff");
		h.pass(ProcessorKind::Stopping).await;
		assert_eq!(order.state().await, OrderState::Stopped);
	}

	#[tokio::test]
	async fn test_remote_order_is_forwarded_then_pending() {
		let cloud = Arc::new(ScriptedCloud::default());
		let transport = Arc::new(LoopbackTransport::new());
		let peer = Arc::new(RecordingHandler::default());
		transport.register(PEER, peer.clone());
		let context = processor_context(cloud, Some(transport), memory_store());
		let order = context
			.transitioner
			.activate(volume_spec(PEER))
			.await
			.unwrap();

		let open = StateProcessor::new(ProcessorKind::Open, context.clone()).unwrap();
		process_pass(&open, None).await;

		let status = order.status().await;
		assert_eq!(status.state, OrderState::Pending);
		assert!(status.forwarded);
		assert_eq!(peer.received(), vec![order.id().to_string()]);
		assert!(context
			.transitioner
			.registry()
			.remote_list()
			.contains(order.id()));
	}

	#[tokio::test]
	async fn test_unreachable_peer_fails_the_request() {
		let transport = Arc::new(LoopbackTransport::new());
		let context = processor_context(
			Arc::new(ScriptedCloud::default()),
			Some(transport),
			memory_store(),
		);
		let order = context
			.transitioner
			.activate(volume_spec(PEER))
			.await
			.unwrap();
		let open = StateProcessor::new(ProcessorKind::Open, context).unwrap();
		process_pass(&open, None).await;

		let status = order.status().await;
		assert_eq!(status.state, OrderState::FailedOnRequest);
		assert!(!status.forwarded);
	}

	#[test]
	fn test_remote_sync_kind_has_no_state_list() {
		let context = processor_context(Arc::new(ScriptedCloud::default()), None, memory_store());
		assert!(StateProcessor::new(ProcessorKind::RemoteSync, context).is_err());
	}
}
