//! The job task.
//!
//! One task owns every piece of mutable copy state: the dirty cursor, the
//! in-flight bitmap, the buffer pool, the counters and the rate limit. I/O
//! tasks report completions over a channel and the driver applies them
//! whenever it suspends, so no lock guards the copy state.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bandwidth::RateLimit;
use block::{BlockDevice, BlockError, DirtyBitmap, ErrorAction, OnErrorPolicy};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use super::{CompletionCallback, Exit, JobOutcome, JobShared, JobStatus, MirrorStats};
use crate::buffer_pool::BufferPool;
use crate::completion;
use crate::config::{MirrorConfig, SyncMode};
use crate::dispatch::{self, Completion, CopyMethod, Side};
use crate::error::MirrorError;
use crate::inflight::InFlightTracker;
use crate::planner::{Plan, PlanContext, Planner};
use crate::trace;

/// Resources reserved by job setup.
pub(crate) struct Setup {
    pub(crate) slice_time: Duration,
    pub(crate) base: Option<Arc<dyn BlockDevice>>,
    pub(crate) length: u64,
    pub(crate) dirty: DirtyBitmap,
    pub(crate) pool: BufferPool,
    pub(crate) in_flight: InFlightTracker,
    pub(crate) max_iov: usize,
}

pub(crate) struct Driver {
    shared: Arc<JobShared>,
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    base: Option<Arc<dyn BlockDevice>>,
    sync_mode: SyncMode,
    on_source_error: OnErrorPolicy,
    on_target_error: OnErrorPolicy,
    unmap: bool,
    max_in_flight: usize,
    max_iov: usize,
    slice_time: Duration,
    length: u64,
    dirty: DirtyBitmap,
    planner: Planner,
    in_flight: InFlightTracker,
    pool: BufferPool,
    limit: RateLimit,
    tx: UnboundedSender<Completion>,
    rx: UnboundedReceiver<Completion>,
    /// Bytes copied so far.
    offset: u64,
    /// First error the policy reported.
    ret: Option<MirrorError>,
    ready: bool,
    busy: bool,
    stats: MirrorStats,
    last_pause: Instant,
}

enum Wake {
    Completion(Completion),
    Done,
}

impl Driver {
    pub(crate) fn new(shared: Arc<JobShared>, config: &MirrorConfig, setup: Setup) -> Self {
        let Setup {
            slice_time,
            base,
            length,
            dirty,
            pool,
            in_flight,
            max_iov,
        } = setup;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut limit = RateLimit::unlimited();
        limit.set_speed(config.speed, slice_time);

        Self {
            source: Arc::clone(&shared.source),
            target: Arc::clone(&shared.target),
            planner: Planner::new(shared.id.clone(), &dirty),
            shared,
            base,
            sync_mode: config.sync_mode,
            on_source_error: config.on_source_error,
            on_target_error: config.on_target_error,
            unmap: config.unmap,
            max_in_flight: config.max_in_flight,
            max_iov,
            slice_time,
            length,
            dirty,
            in_flight,
            pool,
            limit,
            tx,
            rx,
            offset: 0,
            ret: None,
            ready: false,
            busy: true,
            stats: MirrorStats::default(),
            last_pause: Instant::now(),
        }
    }

    /// Runs the job to its end, tears it down and delivers the final status.
    pub(crate) async fn run(mut self, callback: Option<CompletionCallback>) -> Result<JobOutcome, MirrorError> {
        let exit = self.run_loop().await;

        // Buffers and bitmaps must outlive every request that uses them.
        self.drain_in_flight().await;

        let Self {
            shared,
            source,
            dirty,
            planner,
            in_flight,
            pool,
            mut stats,
            offset,
            ..
        } = self;
        stats.peak_in_flight_ops = in_flight.peak_ops();
        stats.peak_chunks_in_use = pool.peak_checked_out();
        stats.passes = planner.restarts();
        drop(pool);
        drop(in_flight);
        source.release_dirty_bitmap(&dirty);
        drop(planner);

        let result = completion::finish(&shared, exit, stats).await;
        trace::trace_job_end(&shared.id, &outcome_label(&result));
        if let Some(callback) = callback {
            callback(&result);
        }
        shared.status.send_modify(|status| {
            status.offset = offset;
            status.in_flight = 0;
            status.busy = false;
            status.finished = true;
        });
        result
    }

    async fn run_loop(&mut self) -> Result<Exit, MirrorError> {
        if self.is_cancelled() {
            return Ok(Exit::Cancelled);
        }

        if self.length == 0 {
            self.set_ready();
            while !self.is_cancelled() && !self.shared.should_complete.load(Ordering::Acquire) {
                self.set_busy(false);
                tokio::select! {
                    () = self.shared.cancel.cancelled() => {}
                    () = self.shared.wake.notified() => {}
                }
            }
            return Ok(Exit::Converged);
        }

        if self.sync_mode != SyncMode::None
            && let Some(exit) = self.initial_scan().await?
        {
            return Ok(exit);
        }

        loop {
            if let Some(error) = self.ret.take() {
                return Err(error);
            }
            if !self.is_synced() && self.is_cancelled() {
                return Ok(Exit::Cancelled);
            }
            self.apply_speed();
            self.set_busy(true);

            let mut delay = Duration::ZERO;
            let mut dirty = self.dirty.count();
            self.publish(dirty);

            let paused = self.shared.paused.load(Ordering::Acquire);
            if self.last_pause.elapsed() < self.slice_time && !paused {
                let ops = self.in_flight.ops();
                if ops >= self.max_in_flight || self.pool.free_count() == 0 || (dirty == 0 && ops > 0) {
                    self.wait_for_io().await;
                    continue;
                } else if dirty != 0 {
                    delay = self.iteration().await;
                }
            }

            let mut should_complete = false;
            if self.in_flight.ops() == 0 && dirty == 0 {
                trace::trace_before_flush(&self.shared.id);
                match self.target.flush().await {
                    Err(error) => {
                        if self.error_action(Side::Target, "flush", &error) == ErrorAction::Report {
                            return Err(MirrorError::io("flush", error));
                        }
                    }
                    Ok(()) => {
                        if !self.is_synced() {
                            self.set_ready();
                        }
                        should_complete = self.shared.should_complete.load(Ordering::Acquire) || self.is_cancelled();
                        dirty = self.dirty.count();
                    }
                }
            }

            if dirty == 0 && should_complete {
                // Writes racing with the last check must land in the bitmap
                // before the job can declare convergence.
                trace::trace_before_drain(&self.shared.id, dirty);
                self.source.drain().await;
                dirty = self.dirty.count();
            }

            trace::trace_before_sleep(&self.shared.id, dirty, self.is_synced(), delay);
            if !self.is_synced() {
                self.sleep(delay).await;
                if self.is_cancelled() {
                    return Ok(Exit::Cancelled);
                }
            } else if !should_complete {
                let idle = self.in_flight.ops() == 0 && dirty == 0;
                self.sleep(if idle { self.slice_time } else { Duration::ZERO }).await;
            } else if dirty == 0 {
                return Ok(Exit::Converged);
            }
            self.last_pause = Instant::now();
        }
    }

    /// Marks everything the target is missing as dirty.
    ///
    /// Returns `Some` when the job was cancelled during the scan.
    async fn initial_scan(&mut self) -> Result<Option<Exit>, MirrorError> {
        let base = self.base.as_ref().map(|base| base.node_name().to_owned());
        let mark_all = base.is_none() && !self.target.has_zero_init();

        let mut offset = 0;
        while offset < self.length {
            if self.last_pause.elapsed() > self.slice_time {
                self.last_pause = Instant::now();
                self.sleep(Duration::ZERO).await;
            }
            if self.is_cancelled() {
                return Ok(Some(Exit::Cancelled));
            }

            let remaining = self.length - offset;
            let (allocated, run) = self
                .source
                .is_allocated_above(base.as_deref(), offset, remaining)
                .await
                .map_err(|error| MirrorError::io("block-status", error))?;
            let run = run.clamp(1, remaining);
            if allocated || mark_all {
                self.dirty.set(offset, run);
            }
            offset += run;
        }
        Ok(None)
    }

    /// Plans and dispatches one work unit, waiting for completions while the
    /// planner is blocked. Returns the pacing delay.
    async fn iteration(&mut self) -> Duration {
        loop {
            let limit = if self.is_synced() || self.limit.is_unlimited() {
                None
            } else {
                Some((&mut self.limit, Instant::now().into_std()))
            };
            let plan = self.planner.plan(PlanContext {
                dirty: &self.dirty,
                in_flight: &mut self.in_flight,
                pool: &mut self.pool,
                limit,
                max_iov: self.max_iov,
                length: self.length,
            });

            match plan {
                Plan::Dispatch { unit, delay } => {
                    let method = dispatch::choose_method(self.source.as_ref(), unit.offset, unit.len).await;
                    trace::trace_one_iteration(&self.shared.id, unit.offset, unit.len, method.as_str());
                    dispatch::spawn_unit(
                        Arc::clone(&self.source),
                        Arc::clone(&self.target),
                        unit,
                        method,
                        self.unmap,
                        self.tx.clone(),
                    );
                    return delay;
                }
                Plan::WaitInFlight | Plan::WaitBuffers => {
                    if !self.wait_for_io().await {
                        return Duration::ZERO;
                    }
                }
                Plan::Idle => return Duration::ZERO,
            }
        }
    }

    /// Waits for one completion and applies it. Returns `false` when nothing
    /// was applied: no I/O outstanding, or a cancellation before
    /// convergence cut the wait short.
    async fn wait_for_io(&mut self) -> bool {
        if self.in_flight.ops() == 0 {
            tokio::task::yield_now().await;
            return false;
        }

        let completion = if self.is_synced() {
            self.rx.recv().await
        } else {
            tokio::select! {
                biased;
                completion = self.rx.recv() => completion,
                () = self.shared.cancel.cancelled() => None,
            }
        };
        match completion {
            Some(completion) => {
                self.handle_completion(completion);
                true
            }
            None => false,
        }
    }

    /// Interruptible pacing sleep followed by a pause point. Completions that
    /// arrive meanwhile are applied without ending the sleep.
    async fn sleep(&mut self, delay: Duration) {
        if !self.is_cancelled() {
            self.set_busy(false);
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                let deadline = Instant::now() + delay;
                loop {
                    let wake = tokio::select! {
                        biased;
                        () = self.shared.cancel.cancelled() => Wake::Done,
                        () = self.shared.wake.notified() => Wake::Done,
                        Some(completion) = self.rx.recv() => Wake::Completion(completion),
                        () = tokio::time::sleep_until(deadline) => Wake::Done,
                    };
                    match wake {
                        Wake::Completion(completion) => self.handle_completion(completion),
                        Wake::Done => break,
                    }
                }
            }
        }
        self.pause_point().await;
        self.set_busy(true);
    }

    async fn pause_point(&mut self) {
        while self.shared.paused.load(Ordering::Acquire) && !self.is_cancelled() {
            self.set_busy(false);
            let wake = tokio::select! {
                biased;
                () = self.shared.cancel.cancelled() => Wake::Done,
                () = self.shared.wake.notified() => Wake::Done,
                Some(completion) = self.rx.recv() => Wake::Completion(completion),
            };
            if let Wake::Completion(completion) = wake {
                self.handle_completion(completion);
            }
        }
    }

    async fn drain_in_flight(&mut self) {
        while self.in_flight.ops() > 0 {
            match self.rx.recv().await {
                Some(completion) => self.handle_completion(completion),
                None => break,
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { unit, method, result } = completion;
        let copied = result.is_ok();
        if let Err(failure) = result {
            self.dirty.set(unit.offset, unit.len);
            let action = self.error_action(failure.side, failure.op, &failure.error);
            if action == ErrorAction::Report && self.ret.is_none() {
                self.ret = Some(MirrorError::io(failure.op, failure.error));
            }
        }
        trace::trace_iteration_done(&self.shared.id, unit.offset, unit.len, copied);

        self.in_flight.finish(unit.offset, unit.len, copied);
        if copied {
            self.offset += unit.len;
            self.stats.bytes_copied += unit.len;
            self.stats.chunks_copied += unit.len.div_ceil(self.in_flight.granularity());
            self.stats.units += 1;
            match method {
                CopyMethod::Copy => self.stats.reads += 1,
                CopyMethod::Zero => self.stats.zero_writes += 1,
                CopyMethod::Discard => self.stats.discards += 1,
            }
        }
        self.pool.release(unit.buffers);
    }

    /// Classifies an I/O failure. Any failure ends convergence; a stop
    /// verdict pauses the job.
    fn error_action(&mut self, side: Side, op: &'static str, error: &BlockError) -> ErrorAction {
        self.shared.synced.store(false, Ordering::Release);
        let policy = match side {
            Side::Source => self.on_source_error,
            Side::Target => self.on_target_error,
        };
        let action = policy.action(error);
        if action == ErrorAction::Stop {
            self.shared.paused.store(true, Ordering::Release);
        }
        trace::trace_io_error(&self.shared.id, op, error, action_label(action));
        self.shared.status.send_modify(|status| {
            status.synced = false;
            status.paused = self.shared.paused.load(Ordering::Acquire);
        });
        action
    }

    fn apply_speed(&mut self) {
        let speed = self.shared.speed.load(Ordering::Acquire);
        if speed != self.limit.speed() {
            self.limit.set_speed(speed, self.slice_time);
        }
    }

    fn set_ready(&mut self) {
        self.shared.synced.store(true, Ordering::Release);
        self.ready = true;
        trace::trace_ready(&self.shared.id, self.offset);
        self.shared.status.send_modify(|status| {
            status.synced = true;
            status.ready = true;
        });
    }

    fn set_busy(&mut self, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            self.shared.status.send_modify(|status| status.busy = busy);
        }
    }

    fn publish(&self, dirty: u64) {
        let status = JobStatus {
            offset: self.offset,
            len: self.offset + dirty + self.in_flight.bytes(),
            synced: self.is_synced(),
            ready: self.ready,
            paused: self.shared.paused.load(Ordering::Acquire),
            in_flight: self.in_flight.ops(),
            busy: self.busy,
            speed: self.limit.speed(),
            finished: false,
        };
        self.shared.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }
}

const fn action_label(action: ErrorAction) -> &'static str {
    match action {
        ErrorAction::Report => "report",
        ErrorAction::Ignore => "ignore",
        ErrorAction::Stop => "stop",
    }
}

fn outcome_label(result: &Result<JobOutcome, MirrorError>) -> String {
    match result {
        Ok(outcome) => format!("{:?}", outcome.end),
        Err(error) => error.to_string(),
    }
}
