//! Background jobs and the minimal engine that runs them.
//!
//! Jobs advance through discrete steps so that cancellation and progress
//! reporting have natural boundaries. The registry runs each submitted job
//! on its own tokio task and keeps the last observed state and public
//! content, which is what the HTTP surface and the archive sender poll.

pub mod archive;
pub mod registry;
pub mod retrieve;

use crate::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
	Pending,
	Running,
	Success,
	Failure,
}

impl JobState {
	/// Whether more chunks or progress can still be produced.
	pub const fn is_active(self) -> bool {
		matches!(self, Self::Pending | Self::Running | Self::Success)
	}
}

/// Outcome of one job step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
	Continue,
	Done,
}

#[async_trait]
pub trait Job: Send + 'static {
	/// Runs the next unit of work.
	async fn step(&mut self) -> Result<StepOutcome, RelayError>;

	/// Fraction of the work done, between 0 and 1.
	fn progress(&self) -> f32;

	/// User-visible state of the job.
	fn public_content(&self) -> serde_json::Value;
}

#[derive(Debug, Default)]
struct JobRegistryInner {
	states: Mutex<HashMap<JobId, JobState>>,
	contents: Mutex<HashMap<JobId, serde_json::Value>>,
	tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

/// Tracks submitted jobs. Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
	inner: Arc<JobRegistryInner>,
}

impl JobRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Submits a job and returns immediately with its id.
	pub fn submit(&self, mut job: impl Job) -> JobId {
		let id = Uuid::new_v4();
		self.set_state(id, JobState::Pending);

		let registry = self.clone();
		let handle = tokio::spawn(async move {
			registry.set_state(id, JobState::Running);
			registry.set_content(id, job.public_content());

			let outcome = loop {
				match job.step().await {
					Ok(StepOutcome::Continue) => {
						registry.set_content(id, job.public_content());
					}
					Ok(StepOutcome::Done) => break JobState::Success,
					Err(err) => {
						warn!(job_id = id.to_string(), "Job failed: {err}");
						break JobState::Failure;
					}
				}
			};

			registry.set_content(id, job.public_content());
			registry.set_state(id, outcome);
		});
		self.inner.tasks.lock().expect("job tasks poisoned").insert(id, handle);

		id
	}

	/// Submits a job and waits for its terminal state.
	pub async fn submit_and_wait(&self, job: impl Job) -> (JobId, JobState) {
		let id = self.submit(job);
		let handle = self.inner.tasks.lock().expect("job tasks poisoned").remove(&id);
		if let Some(handle) = handle {
			let _ = handle.await;
		}
		(id, self.state(id).unwrap_or(JobState::Failure))
	}

	pub fn state(&self, id: JobId) -> Option<JobState> {
		self.inner
			.states
			.lock()
			.expect("job states poisoned")
			.get(&id)
			.copied()
	}

	pub fn public_content(&self, id: JobId) -> Option<serde_json::Value> {
		self.inner
			.contents
			.lock()
			.expect("job contents poisoned")
			.get(&id)
			.cloned()
	}

	/// Aborts a running job. The job future is dropped, which releases its
	/// control connection and interrupts any blocked DIMSE read.
	pub fn stop(&self, id: JobId) {
		let handle = self.inner.tasks.lock().expect("job tasks poisoned").remove(&id);
		if let Some(handle) = handle {
			handle.abort();
			self.set_state(id, JobState::Failure);
		}
	}

	fn set_state(&self, id: JobId, state: JobState) {
		self.inner
			.states
			.lock()
			.expect("job states poisoned")
			.insert(id, state);
	}

	fn set_content(&self, id: JobId, content: serde_json::Value) {
		self.inner
			.contents
			.lock()
			.expect("job contents poisoned")
			.insert(id, content);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct CountingJob {
		steps_left: u32,
		fail: bool,
	}

	#[async_trait]
	impl Job for CountingJob {
		async fn step(&mut self) -> Result<StepOutcome, RelayError> {
			if self.steps_left == 0 {
				if self.fail {
					return Err(RelayError::InternalError(String::from("boom")));
				}
				return Ok(StepOutcome::Done);
			}
			self.steps_left -= 1;
			Ok(StepOutcome::Continue)
		}

		fn progress(&self) -> f32 {
			0.0
		}

		fn public_content(&self) -> serde_json::Value {
			serde_json::json!({ "StepsLeft": self.steps_left })
		}
	}

	#[tokio::test]
	async fn job_runs_to_success() {
		let registry = JobRegistry::new();
		let (id, state) = registry
			.submit_and_wait(CountingJob {
				steps_left: 3,
				fail: false,
			})
			.await;
		assert_eq!(state, JobState::Success);
		assert_eq!(
			registry.public_content(id).unwrap()["StepsLeft"],
			serde_json::json!(0)
		);
	}

	#[tokio::test]
	async fn failing_job_ends_in_failure_state() {
		let registry = JobRegistry::new();
		let (_, state) = registry
			.submit_and_wait(CountingJob {
				steps_left: 0,
				fail: true,
			})
			.await;
		assert_eq!(state, JobState::Failure);
	}

	#[tokio::test]
	async fn stop_aborts_and_marks_failure() {
		struct StuckJob;

		#[async_trait]
		impl Job for StuckJob {
			async fn step(&mut self) -> Result<StepOutcome, RelayError> {
				tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
				Ok(StepOutcome::Continue)
			}

			fn progress(&self) -> f32 {
				0.0
			}

			fn public_content(&self) -> serde_json::Value {
				serde_json::Value::Null
			}
		}

		let registry = JobRegistry::new();
		let id = registry.submit(StuckJob);
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		registry.stop(id);
		assert_eq!(registry.state(id), Some(JobState::Failure));
	}
}
