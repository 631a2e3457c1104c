//! Synchronization of orders served by remote providers.
//!
//! While a peer drives an order, the local copy sits in the remote list. Each
//! pass fetches the peer's snapshot, copies the fields the peer owns and
//! mirrors its state. An unreachable peer leaves the cached copy untouched.

use super::{OrderProcessor, ProcessorContext, ProcessorError, ProcessorKind};
use crate::state::{Order, OrderList};
use async_trait::async_trait;
use broker_types::{truncate_id, OrderState};
use std::sync::Arc;
use tracing::instrument;

/// Local state matching the state the serving peer reports.
pub fn mirrored_state(peer_state: OrderState) -> OrderState {
	match peer_state {
		OrderState::Open | OrderState::Pending | OrderState::Stopping => OrderState::Pending,
		OrderState::Spawning
		| OrderState::Fulfilled
		| OrderState::FailedAfterSuccessfulRequest
		| OrderState::UnableToCheckStatus
		| OrderState::Stopped => peer_state,
		OrderState::FailedOnRequest => OrderState::FailedAfterSuccessfulRequest,
		// The peer is tearing the order down; checking deletion confirms and closes.
		OrderState::AssignedForDeletion
		| OrderState::CheckingDeletion
		| OrderState::Closed
		| OrderState::Deactivated => OrderState::CheckingDeletion,
	}
}

/// States in which a remotely served order sits in the remote list.
fn is_synchronized(state: OrderState) -> bool {
	matches!(
		state,
		OrderState::Pending
			| OrderState::Spawning
			| OrderState::Fulfilled
			| OrderState::FailedAfterSuccessfulRequest
			| OrderState::UnableToCheckStatus
			| OrderState::Stopped
	)
}

pub struct RemoteSyncProcessor {
	list: Arc<OrderList>,
	context: Arc<ProcessorContext>,
}

impl RemoteSyncProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self {
			list: context.transitioner.registry().remote_list().clone(),
			context,
		}
	}
}

#[async_trait]
impl OrderProcessor for RemoteSyncProcessor {
	fn kind(&self) -> ProcessorKind {
		ProcessorKind::RemoteSync
	}

	fn list(&self) -> &OrderList {
		&self.list
	}

	#[instrument(skip_all, fields(processor = "remote-sync-proc", order_id = %truncate_id(order.id())))]
	async fn process_order(&self, order: &Arc<Order>) -> Result<(), ProcessorError> {
		let transitioner = &self.context.transitioner;
		let mut status = order.lock().await;
		if !is_synchronized(status.state) || !transitioner.registry().is_remote(order.spec()) {
			return Ok(());
		}

		let connector = self.context.connectors.connector_for(&order.spec().provider);
		let snapshot = match connector.get_remote_order(order.spec()).await {
			Ok(record) => record,
			Err(e) if e.is_not_found() => {
				tracing::warn!(provider = %order.spec().provider, "Order unknown to its provider");
				status.set_fault_message_once(format!(
					"Order unknown to provider {}",
					order.spec().provider
				));
				transitioner
					.transition_locked(order, &mut status, OrderState::FailedAfterSuccessfulRequest)
					.await?;
				return Ok(());
			},
			Err(e) if e.is_unavailable() => {
				tracing::debug!(provider = %order.spec().provider, error = %e, "Provider unreachable, keeping cached state");
				return Ok(());
			},
			Err(e) => return Err(e.into()),
		};

		let before = status.clone();
		status.update_from_remote(&snapshot.status);
		let target = mirrored_state(snapshot.status.state);
		let moved = transitioner
			.transition_locked(order, &mut status, target)
			.await?;
		if !moved && *status != before {
			transitioner.persist_locked(order, &status).await?;
		}
		Ok(())
	}
}
