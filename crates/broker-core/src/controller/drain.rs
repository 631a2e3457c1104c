//! Drain barrier for request handling.
//!
//! Requests hold a permit while they run. Draining closes the barrier to new
//! requests and waits until every permit in flight has been dropped, so the
//! caller can swap shared components underneath. Resuming reopens it and
//! wakes the requests that queued up meanwhile.

use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BarrierState {
	draining: bool,
	in_flight: usize,
}

#[derive(Debug, Default)]
pub struct DrainBarrier {
	state: Mutex<BarrierState>,
	drained: Notify,
	resumed: Notify,
}

/// Held for the duration of one request.
#[must_use]
pub struct DrainPermit<'a> {
	barrier: &'a DrainBarrier,
}

impl DrainBarrier {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, BarrierState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	/// Waits until the barrier is open and registers a request.
	pub async fn enter(&self) -> DrainPermit<'_> {
		loop {
			// Created before checking, so a resume in between is not missed.
			let resumed = self.resumed.notified();
			{
				let mut state = self.state();
				if !state.draining {
					state.in_flight += 1;
					return DrainPermit { barrier: self };
				}
			}
			resumed.await;
		}
	}

	/// Closes the barrier and waits for in-flight requests to finish.
	pub async fn drain(&self) {
		loop {
			let drained = self.drained.notified();
			{
				let mut state = self.state();
				state.draining = true;
				if state.in_flight == 0 {
					return;
				}
			}
			drained.await;
		}
	}

	/// Reopens the barrier.
	pub fn resume(&self) {
		self.state().draining = false;
		self.resumed.notify_waiters();
	}

	pub fn in_flight(&self) -> usize {
		self.state().in_flight
	}

	pub fn is_draining(&self) -> bool {
		self.state().draining
	}
}

impl Drop for DrainPermit<'_> {
	fn drop(&mut self) {
		let mut state = self.barrier.state();
		state.in_flight = state.in_flight.saturating_sub(1);
		if state.in_flight == 0 {
			self.barrier.drained.notify_waiters();
		}
	}
}
