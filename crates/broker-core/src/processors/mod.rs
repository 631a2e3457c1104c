//! Order processors.
//!
//! One processor per non-terminal state list, plus one that synchronizes
//! orders served by remote providers. Each runs as its own task: sleep for
//! its configured interval, rewind its list, then walk it order by order.
//! A failure or panic while processing one order is logged and never stops
//! the pass.

pub mod controller;
pub mod remote_sync;
pub mod state;

pub use controller::ProcessorsController;
pub use remote_sync::RemoteSyncProcessor;
pub use state::StateProcessor;

use crate::connector::{CloudConnectorFactory, ConnectorError};
use crate::state::{Order, OrderList, Transitioner, TransitionError};
use async_trait::async_trait;
use broker_config::ProcessorsConfig;
use broker_types::{truncate_id, OrderState};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ProcessorError {
	#[error("Connector error: {0}")]
	Connector(#[from] ConnectorError),
	#[error("Transition error: {0}")]
	Transition(#[from] TransitionError),
}

/// The processors the broker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
	Open,
	Spawning,
	Fulfilled,
	Failed,
	UnableToCheckStatus,
	Stopping,
	AssignedForDeletion,
	CheckingDeletion,
	Closed,
	RemoteSync,
}

impl ProcessorKind {
	pub const ALL: [ProcessorKind; 10] = [
		ProcessorKind::Open,
		ProcessorKind::Spawning,
		ProcessorKind::Fulfilled,
		ProcessorKind::Failed,
		ProcessorKind::UnableToCheckStatus,
		ProcessorKind::Stopping,
		ProcessorKind::AssignedForDeletion,
		ProcessorKind::CheckingDeletion,
		ProcessorKind::Closed,
		ProcessorKind::RemoteSync,
	];

	pub fn task_name(&self) -> &'static str {
		match self {
			ProcessorKind::Open => "open-proc",
			ProcessorKind::Spawning => "spawning-proc",
			ProcessorKind::Fulfilled => "fulfilled-proc",
			ProcessorKind::Failed => "failed-proc",
			ProcessorKind::UnableToCheckStatus => "unable-to-check-proc",
			ProcessorKind::Stopping => "stopping-proc",
			ProcessorKind::AssignedForDeletion => "assigned-for-deletion-proc",
			ProcessorKind::CheckingDeletion => "checking-deletion-proc",
			ProcessorKind::Closed => "closed-proc",
			ProcessorKind::RemoteSync => "remote-sync-proc",
		}
	}

	/// State whose list the processor walks. None for the remote list.
	pub fn source_state(&self) -> Option<OrderState> {
		match self {
			ProcessorKind::Open => Some(OrderState::Open),
			ProcessorKind::Spawning => Some(OrderState::Spawning),
			ProcessorKind::Fulfilled => Some(OrderState::Fulfilled),
			ProcessorKind::Failed => Some(OrderState::FailedAfterSuccessfulRequest),
			ProcessorKind::UnableToCheckStatus => Some(OrderState::UnableToCheckStatus),
			ProcessorKind::Stopping => Some(OrderState::Stopping),
			ProcessorKind::AssignedForDeletion => Some(OrderState::AssignedForDeletion),
			ProcessorKind::CheckingDeletion => Some(OrderState::CheckingDeletion),
			ProcessorKind::Closed => Some(OrderState::Closed),
			ProcessorKind::RemoteSync => None,
		}
	}

	pub fn sleep_time(&self, config: &ProcessorsConfig) -> Duration {
		let ms = match self {
			ProcessorKind::Open => config.open_sleep_ms,
			ProcessorKind::Spawning => config.spawning_sleep_ms,
			ProcessorKind::Fulfilled => config.fulfilled_sleep_ms,
			ProcessorKind::Failed => config.failed_sleep_ms,
			ProcessorKind::UnableToCheckStatus => config.unable_to_check_status_sleep_ms,
			ProcessorKind::Stopping => config.stopping_sleep_ms,
			ProcessorKind::AssignedForDeletion => config.assigned_for_deletion_sleep_ms,
			ProcessorKind::CheckingDeletion => config.checking_deletion_sleep_ms,
			ProcessorKind::Closed => config.closed_sleep_ms,
			ProcessorKind::RemoteSync => config.remote_sync_sleep_ms,
		};
		Duration::from_millis(ms)
	}
}

impl fmt::Display for ProcessorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.task_name())
	}
}

/// Collaborators shared by every processor.
pub struct ProcessorContext {
	pub transitioner: Arc<Transitioner>,
	pub connectors: Arc<CloudConnectorFactory>,
}

/// A processor walks one list and acts on each order it finds there.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
	fn kind(&self) -> ProcessorKind;

	fn list(&self) -> &OrderList;

	/// Handles one order. Implementations take the order's lock and re-check
	/// its state, since it may have moved after being picked from the list.
	async fn process_order(&self, order: &Arc<Order>) -> Result<(), ProcessorError>;
}

/// Walks the processor's list once. Returns how many orders were visited.
///
/// With a stop receiver, the pass ends early once stop is signalled.
pub async fn process_pass(
	processor: &dyn OrderProcessor,
	stop: Option<&watch::Receiver<bool>>,
) -> usize {
	let kind = processor.kind();
	let list = processor.list();
	list.reset_pointer();

	let mut visited = 0;
	while let Some(order) = list.get_next() {
		if stop.is_some_and(|rx| *rx.borrow()) {
			break;
		}
		visited += 1;
		match AssertUnwindSafe(processor.process_order(&order))
			.catch_unwind()
			.await
		{
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				tracing::warn!(
					processor = %kind,
					order_id = %truncate_id(order.id()),
					error = %e,
					"Failed to process order"
				);
			},
			Err(_) => {
				tracing::error!(
					processor = %kind,
					order_id = %truncate_id(order.id()),
					"Processor panicked while handling order"
				);
			},
		}
	}
	visited
}

/// Processor loop: sleep, pass, repeat until stop is signalled.
pub(crate) async fn run_processor(
	processor: Arc<dyn OrderProcessor>,
	mut sleep_times: watch::Receiver<ProcessorsConfig>,
	mut stop: watch::Receiver<bool>,
) {
	let kind = processor.kind();
	tracing::info!(processor = %kind, "Started");

	loop {
		let interval = kind.sleep_time(&sleep_times.borrow_and_update());
		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			changed = stop.changed() => {
				if changed.is_err() {
					break;
				}
			}
		}
		if *stop.borrow() {
			break;
		}
		let visited = process_pass(processor.as_ref(), Some(&stop)).await;
		if visited > 0 {
			tracing::trace!(processor = %kind, visited, "Pass complete");
		}
	}

	tracing::info!(processor = %kind, "Stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state::OrderRegistry;
	use crate::test_support::{memory_store, volume_spec};
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Flaky {
		list: OrderList,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl OrderProcessor for Flaky {
		fn kind(&self) -> ProcessorKind {
			ProcessorKind::Open
		}

		fn list(&self) -> &OrderList {
			&self.list
		}

		async fn process_order(&self, _order: &Arc<Order>) -> Result<(), ProcessorError> {
			match self.calls.fetch_add(1, Ordering::SeqCst) {
				0 => panic!("first order blows up"),
				1 => Err(ConnectorError::Unavailable("cloud down".into()).into()),
				_ => Ok(()),
			}
		}
	}

	#[tokio::test]
	async fn test_pass_survives_panics_and_errors() {
		let transitioner = Transitioner::new(Arc::new(OrderRegistry::new("provider-a")), memory_store());
		let list = OrderList::new();
		for _ in 0..3 {
			list.add_item(transitioner.activate(volume_spec("provider-a")).await.unwrap());
		}
		let processor = Flaky {
			list,
			calls: AtomicUsize::new(0),
		};

		assert_eq!(process_pass(&processor, None).await, 3);
		assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
		// A second pass starts from the head again.
		assert_eq!(process_pass(&processor, None).await, 3);
	}

	#[tokio::test]
	async fn test_pass_stops_when_signalled() {
		let transitioner = Transitioner::new(Arc::new(OrderRegistry::new("provider-a")), memory_store());
		let list = OrderList::new();
		list.add_item(transitioner.activate(volume_spec("provider-a")).await.unwrap());
		let processor = Flaky {
			list,
			calls: AtomicUsize::new(2),
		};
		let (_tx, rx) = watch::channel(true);
		assert_eq!(process_pass(&processor, Some(&rx)).await, 0);
	}

	#[test]
	fn test_every_kind_has_a_distinct_task_name() {
		let mut names: Vec<_> = ProcessorKind::ALL.iter().map(|k| k.task_name()).collect();
		names.sort();
		names.dedup();
		assert_eq!(names.len(), ProcessorKind::ALL.len());
		assert_eq!(ProcessorKind::RemoteSync.source_state(), None);
		assert_eq!(
			ProcessorKind::Failed.source_state(),
			Some(OrderState::FailedAfterSuccessfulRequest)
		);
	}
}
