//! Delayed tasks and waits
//!
//! Deferred deletes and the settle delay before re-sharding a modified file go
//! through a [`Scheduler`] so that tests can drive them with a fake clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// A deferred unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
	/// Run `task` once `delay` has elapsed. Tasks are not cancelled on shutdown
	/// and must tolerate the paths they act on being gone.
	fn schedule(&self, delay: Duration, task: Task);

	/// Block the calling thread for `delay`
	fn block_for(&self, delay: Duration);
}

/// Runs deferred tasks on a tokio runtime
pub struct TokioScheduler {
	handle: tokio::runtime::Handle,
}

impl TokioScheduler {
	/// Scheduler bound to the runtime of the calling context
	pub fn current() -> Self {
		TokioScheduler { handle: tokio::runtime::Handle::current() }
	}
}

impl Scheduler for TokioScheduler {
	fn schedule(&self, delay: Duration, task: Task) {
		debug!("Scheduling task in {:?}", delay);
		self.handle.spawn(async move {
			tokio::time::sleep(delay).await;
			// Tasks do blocking filesystem work
			if let Err(e) = tokio::task::spawn_blocking(task).await {
				warn!("Deferred task failed: {}", e);
			}
		});
	}

	fn block_for(&self, delay: Duration) {
		std::thread::sleep(delay);
	}
}

struct Pending {
	due: Duration,
	seq: u64,
	task: Task,
}

#[derive(Default)]
struct ManualState {
	now: Duration,
	seq: u64,
	pending: Vec<Pending>,
	slept: Vec<Duration>,
}

/// Fake-clock scheduler: nothing runs until [`ManualScheduler::advance`]
#[derive(Clone, Default)]
pub struct ManualScheduler {
	state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
	pub fn new() -> Self {
		Self::default()
	}

	/// Current fake time
	pub fn now(&self) -> Duration {
		self.lock().now
	}

	pub fn pending(&self) -> usize {
		self.lock().pending.len()
	}

	/// Waits requested through `block_for`, in order
	pub fn slept(&self) -> Vec<Duration> {
		self.lock().slept.clone()
	}

	/// Move the clock forward and run every task that became due, in due order.
	/// Tasks scheduled while running are picked up if they fall inside the window.
	pub fn advance(&self, by: Duration) -> usize {
		let target = self.lock().now + by;
		let mut ran = 0;
		loop {
			let next = {
				let mut state = self.lock();
				let idx = state
					.pending
					.iter()
					.enumerate()
					.filter(|(_, p)| p.due <= target)
					.min_by_key(|(_, p)| (p.due, p.seq))
					.map(|(i, _)| i);
				match idx {
					Some(i) => {
						let p = state.pending.remove(i);
						state.now = state.now.max(p.due);
						Some(p.task)
					}
					None => {
						state.now = target;
						None
					}
				}
			};
			match next {
				// Lock is released before the task runs
				Some(task) => {
					task();
					ran += 1;
				}
				None => return ran,
			}
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl Scheduler for ManualScheduler {
	fn schedule(&self, delay: Duration, task: Task) {
		let mut state = self.lock();
		let due = state.now + delay;
		let seq = state.seq;
		state.seq += 1;
		state.pending.push(Pending { due, seq, task });
	}

	fn block_for(&self, delay: Duration) {
		let mut state = self.lock();
		state.slept.push(delay);
	}
}


// vim: ts=4
