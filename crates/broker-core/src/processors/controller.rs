//! Starts and stops the processor tasks.

use super::{
	process_pass, run_processor, OrderProcessor, ProcessorContext, ProcessorKind,
	RemoteSyncProcessor, StateProcessor,
};
use crate::state::RegistryError;
use broker_config::ProcessorsConfig;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

pub struct ProcessorsController {
	processors: Vec<Arc<dyn OrderProcessor>>,
	sleep_times: watch::Sender<ProcessorsConfig>,
	stop: watch::Sender<bool>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorsController {
	pub fn new(
		context: Arc<ProcessorContext>,
		config: ProcessorsConfig,
	) -> Result<Self, RegistryError> {
		let mut processors: Vec<Arc<dyn OrderProcessor>> = Vec::new();
		for kind in ProcessorKind::ALL {
			if kind == ProcessorKind::RemoteSync {
				processors.push(Arc::new(RemoteSyncProcessor::new(context.clone())));
			} else {
				processors.push(Arc::new(StateProcessor::new(kind, context.clone())?));
			}
		}
		let (sleep_times, _) = watch::channel(config);
		let (stop, _) = watch::channel(false);
		Ok(Self {
			processors,
			sleep_times,
			stop,
			handles: Mutex::new(Vec::new()),
		})
	}

	/// Spawns one task per processor. Does nothing if they are running.
	pub fn start_all(&self) {
		let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
		if !handles.is_empty() {
			tracing::warn!(component = "processors", "Processors already running");
			return;
		}
		self.stop.send_replace(false);
		for processor in &self.processors {
			let span = tracing::info_span!("processor", name = processor.kind().task_name());
			handles.push(tokio::spawn(
				run_processor(
					processor.clone(),
					self.sleep_times.subscribe(),
					self.stop.subscribe(),
				)
				.instrument(span),
			));
		}
		tracing::info!(component = "processors", count = handles.len(), "Started");
	}

	/// Signals every task to stop and waits for them to finish their current order.
	pub async fn stop_all(&self) {
		self.stop.send_replace(true);
		let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
		for handle in handles {
			if let Err(e) = handle.await {
				tracing::error!(component = "processors", error = %e, "Processor task ended abnormally");
			}
		}
		tracing::info!(component = "processors", "Stopped");
	}

	pub fn is_running(&self) -> bool {
		!self
			.handles
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.is_empty()
	}

	/// Applies new sleep times. Each task picks them up on its next sleep.
	pub fn reset_sleep_times(&self, config: ProcessorsConfig) {
		self.sleep_times.send_replace(config);
		tracing::info!(component = "processors", "Sleep times updated");
	}

	pub fn sleep_times(&self) -> ProcessorsConfig {
		self.sleep_times.borrow().clone()
	}

	/// Runs one pass of a single processor on the caller's task.
	pub async fn run_pass(&self, kind: ProcessorKind) -> usize {
		match self.processors.iter().find(|p| p.kind() == kind) {
			Some(processor) => process_pass(processor.as_ref(), None).await,
			None => 0,
		}
	}
}
