//! Mirror job setup, shared state and outcome types.
//!
//! [`MirrorJob`] validates the parameters, reserves the buffer pool and the
//! dirty bitmap, blocks the nodes involved and spawns the driver task. All
//! setup failures are returned from [`MirrorJob::start`] before anything
//! runs. The returned [`JobHandle`] talks to the running driver through
//! [`JobShared`].

mod driver;
mod handle;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use block::{BlockDevice, BlockOp, BlockerId, NodeGraph};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::{MirrorConfig, SyncMode};
use crate::error::MirrorError;
use crate::inflight::InFlightTracker;
use crate::trace;

pub use self::handle::JobHandle;
use self::driver::{Driver, Setup};

/// Callback receiving the final status of a job, exactly once.
pub type CompletionCallback = Box<dyn FnOnce(&Result<JobOutcome, MirrorError>) + Send + 'static>;

/// Progress snapshot published by a running job.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct JobStatus {
    /// Bytes copied so far.
    pub offset: u64,
    /// Current estimate of the total: copied, dirty and in-flight bytes.
    pub len: u64,
    /// Source and target are currently converged.
    pub synced: bool,
    /// The job has signalled readiness at least once.
    pub ready: bool,
    /// The job is paused.
    pub paused: bool,
    /// Outstanding work units.
    pub in_flight: usize,
    /// The driver is running rather than sleeping.
    pub busy: bool,
    /// Speed limit in bytes per second; zero is unlimited.
    pub speed: u64,
    /// The job has delivered its final status.
    pub finished: bool,
}

/// How a successful job ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobEnd {
    /// The target took the place of the named node.
    Pivoted {
        /// Name of the replaced node.
        replaced: String,
    },
    /// The job was cancelled after convergence. The target is a consistent
    /// copy but nothing was replaced.
    InSync,
    /// The job was cancelled before convergence. The target may be
    /// inconsistent.
    Cancelled,
}

/// Counters collected over the life of a job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MirrorStats {
    /// Bytes of completed work units.
    pub bytes_copied: u64,
    /// Chunks covered by completed work units.
    pub chunks_copied: u64,
    /// Completed work units.
    pub units: u64,
    /// Units copied by reading the source.
    pub reads: u64,
    /// Units written as zeroes.
    pub zero_writes: u64,
    /// Units discarded on the target.
    pub discards: u64,
    /// Highest number of concurrently outstanding units.
    pub peak_in_flight_ops: usize,
    /// Highest number of chunk buffers in use at once.
    pub peak_chunks_in_use: usize,
    /// Times the dirty cursor wrapped around.
    pub passes: u64,
}

/// Final result of a job that did not fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobOutcome {
    /// How the job ended.
    pub end: JobEnd,
    /// Job counters.
    pub stats: MirrorStats,
}

/// Why the run loop stopped without an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Exit {
    /// Nothing dirty, nothing in flight, completion or cancel requested
    /// after convergence.
    Converged,
    /// Cancelled before convergence.
    Cancelled,
}

/// Node held for replacement by a completion request.
#[derive(Debug)]
pub(crate) struct Replacement {
    pub(crate) node: Arc<dyn BlockDevice>,
    pub(crate) blocker: BlockerId,
}

/// Completion state guarded by one lock, so a completion request racing
/// with teardown either lands before `finish` takes it or is rejected.
#[derive(Debug, Default)]
pub(crate) struct Handoff {
    pub(crate) replacement: Option<Replacement>,
    pub(crate) finished: bool,
}

/// State shared between the driver task and [`JobHandle`].
pub(crate) struct JobShared {
    pub(crate) id: String,
    pub(crate) source: Arc<dyn BlockDevice>,
    pub(crate) target: Arc<dyn BlockDevice>,
    pub(crate) graph: Arc<dyn NodeGraph>,
    pub(crate) replaces: Option<String>,
    pub(crate) source_blocker: BlockerId,
    pub(crate) target_blocker: BlockerId,
    pub(crate) cancel: CancellationToken,
    pub(crate) should_complete: AtomicBool,
    pub(crate) synced: AtomicBool,
    pub(crate) paused: AtomicBool,
    pub(crate) speed: AtomicU64,
    pub(crate) wake: Notify,
    pub(crate) handoff: Mutex<Handoff>,
    pub(crate) status: watch::Sender<JobStatus>,
}

impl JobShared {
    pub(crate) fn handoff(&self) -> MutexGuard<'_, Handoff> {
        self.handoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for JobShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobShared")
            .field("id", &self.id)
            .field("source", &self.source.node_name())
            .field("target", &self.target.node_name())
            .field("replaces", &self.replaces)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for a mirror job.
///
/// ```ignore
/// let handle = MirrorJob::new(source, target, graph)
///     .config(MirrorConfig::default().with_speed(64 << 20))
///     .start()?;
/// handle.ready().await;
/// handle.complete().await?;
/// let outcome = handle.wait().await?;
/// ```
pub struct MirrorJob {
    id: Option<String>,
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    graph: Arc<dyn NodeGraph>,
    config: MirrorConfig,
    base: Option<Arc<dyn BlockDevice>>,
    callback: Option<CompletionCallback>,
}

impl fmt::Debug for MirrorJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorJob")
            .field("id", &self.id)
            .field("source", &self.source.node_name())
            .field("target", &self.target.node_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MirrorJob {
    /// Prepares a job copying `source` to `target`. `graph` resolves the
    /// node replaced on completion.
    #[must_use]
    pub fn new(source: Arc<dyn BlockDevice>, target: Arc<dyn BlockDevice>, graph: Arc<dyn NodeGraph>) -> Self {
        Self {
            id: None,
            source,
            target,
            graph,
            config: MirrorConfig::default(),
            base: None,
            callback: None,
        }
    }

    /// Sets the job identifier. Defaults to the source node name.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the job parameters.
    #[must_use]
    pub fn config(mut self, config: MirrorConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a callback invoked with the final status after teardown.
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(&Result<JobOutcome, MirrorError>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Restricts the initial scan to data above `base`, overriding the
    /// sync mode's choice.
    pub(crate) fn base(mut self, base: Arc<dyn BlockDevice>) -> Self {
        self.base = Some(base);
        self
    }

    /// Validates the parameters and spawns the job on the current Tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(self) -> Result<JobHandle, MirrorError> {
        let Self {
            id,
            source,
            target,
            graph,
            config,
            base,
            callback,
        } = self;
        let id = id.unwrap_or_else(|| source.node_name().to_owned());

        let resolved = config.resolve(target.as_ref())?;
        let base = base.or_else(|| match config.sync_mode {
            SyncMode::Top => source.backing(),
            _ => None,
        });

        if config.on_source_error.may_stop() && !source.io_status_enabled() {
            return Err(MirrorError::invalid(
                "on-source-error",
                format!("'{}' needs I/O status on the source", config.on_source_error),
            ));
        }

        let replaced = match config.replaces.as_deref() {
            Some(name) => {
                let node = graph
                    .lookup(name)
                    .ok_or_else(|| MirrorError::NodeNotFound(name.to_owned()))?;
                if let Some(reason) = node.op_blockers().blocked_by(BlockOp::Replace) {
                    return Err(MirrorError::Busy {
                        node: name.to_owned(),
                        reason,
                    });
                }
                node
            }
            None => Arc::clone(&source),
        };
        if replaced.has_frontend() && target.has_frontend() {
            return Err(MirrorError::TwoBackends);
        }

        for (node, op) in [(&source, BlockOp::MirrorSource), (&target, BlockOp::MirrorTarget)] {
            if let Some(reason) = node.op_blockers().blocked_by(op) {
                return Err(MirrorError::Busy {
                    node: node.node_name().to_owned(),
                    reason,
                });
            }
        }

        let granularity = resolved.granularity;
        let length = source.length();
        let cow_cluster = if target.backing().is_none() {
            target.info().cluster_size.filter(|&cluster| cluster > granularity)
        } else {
            None
        };
        let mut buf_size = resolved.buf_size;
        if let Some(cluster) = cow_cluster {
            buf_size = buf_size.max(cluster.next_multiple_of(granularity));
        }

        let max_iov = source.max_iov().min(target.max_iov());
        let unit_chunks = cow_cluster.map_or(1, |cluster| cluster.div_ceil(granularity));
        if max_iov == 0 || u64::try_from(max_iov).unwrap_or(u64::MAX) < unit_chunks {
            return Err(MirrorError::invalid(
                "granularity",
                format!("{unit_chunks} chunks per copy exceed the device limit of {max_iov} fragments"),
            ));
        }

        let pool = BufferPool::new(buf_size, granularity)?;
        let in_flight = InFlightTracker::new(granularity, length, cow_cluster);
        let dirty = source
            .create_dirty_bitmap(granularity)
            .map_err(|error| MirrorError::io("create-bitmap", error))?;

        let source_blocker = source
            .op_blockers()
            .block_all(format!("block device is in use by block job '{id}'"));
        let target_blocker = target
            .op_blockers()
            .block_all(format!("block device is in use by mirror job '{id}'"));

        let (status, _) = watch::channel(JobStatus {
            len: length,
            busy: true,
            speed: config.speed,
            ..JobStatus::default()
        });
        let shared = Arc::new(JobShared {
            id,
            source,
            target,
            graph,
            replaces: config.replaces.clone(),
            source_blocker,
            target_blocker,
            cancel: CancellationToken::new(),
            should_complete: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            speed: AtomicU64::new(config.speed),
            wake: Notify::new(),
            handoff: Mutex::new(Handoff::default()),
            status,
        });

        trace::trace_job_start(&shared.id, length, granularity, buf_size);
        let driver = Driver::new(
            Arc::clone(&shared),
            &config,
            Setup {
                slice_time: resolved.slice_time,
                base,
                length,
                dirty,
                pool,
                in_flight,
                max_iov,
            },
        );
        let task = tokio::spawn(driver.run(callback));
        Ok(JobHandle::new(shared, task))
    }
}
