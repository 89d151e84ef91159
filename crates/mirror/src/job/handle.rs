use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{JobOutcome, JobShared, JobStatus};
use crate::completion;
use crate::error::MirrorError;

/// Control handle of a running mirror job.
///
/// Dropping the handle does not stop the job; it keeps running detached and
/// still invokes its completion callback.
#[derive(Debug)]
pub struct JobHandle {
    shared: Arc<JobShared>,
    status: watch::Receiver<JobStatus>,
    task: JoinHandle<Result<JobOutcome, MirrorError>>,
}

impl JobHandle {
    pub(super) fn new(shared: Arc<JobShared>, task: JoinHandle<Result<JobOutcome, MirrorError>>) -> Self {
        let status = shared.status.subscribe();
        Self { shared, status, task }
    }

    /// Job identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Latest progress snapshot.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every progress change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.shared.status.subscribe()
    }

    /// Waits until the job signals readiness. Returns `false` if it finished
    /// without ever becoming ready.
    pub async fn ready(&self) -> bool {
        let mut status = self.status.clone();
        status
            .wait_for(|status| status.ready || status.finished)
            .await
            .is_ok_and(|status| status.ready)
    }

    /// Asks a converged job to hand over to the target and finish.
    ///
    /// # Errors
    ///
    /// [`MirrorError::NotReady`] before convergence, and
    /// [`MirrorError::NodeNotFound`] when the configured replacement node no
    /// longer exists. A rejected request changes nothing.
    pub async fn complete(&self) -> Result<(), MirrorError> {
        completion::request_complete(&self.shared).await
    }

    /// Requests cancellation. Before convergence the job stops without a
    /// consistent target; afterwards it finishes the copy and ends in sync
    /// without replacing anything.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.wake.notify_one();
    }

    /// Changes the speed limit in bytes per second; zero removes it.
    pub fn set_speed(&self, speed: u64) {
        self.shared.speed.store(speed, Ordering::Release);
        self.shared.status.send_modify(|status| status.speed = speed);
        self.shared.wake.notify_one();
    }

    /// Pauses the job at its next pause point. Outstanding I/O still
    /// completes.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.shared.status.send_modify(|status| status.paused = true);
    }

    /// Resumes a paused or stopped job.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.status.send_modify(|status| status.paused = false);
        self.shared.wake.notify_one();
    }

    /// Clears the failed I/O status left by a stop verdict and resumes.
    pub fn iostatus_reset(&self) {
        self.resume();
    }

    /// Returns `true` once the job has delivered its final status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the final status.
    ///
    /// # Errors
    ///
    /// Returns the job's failure, or [`MirrorError::Cancelled`] if the job
    /// task was torn down by its runtime.
    pub async fn wait(self) -> Result<JobOutcome, MirrorError> {
        match self.task.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            Err(_) => Err(MirrorError::Cancelled),
        }
    }
}
