//! Structured trace points for the mirror copy loop.
//!
//! Every hook is compiled only with the `tracing` feature and collapses to an
//! inline no-op otherwise, so the driver calls them unconditionally.

use std::time::Duration;

/// Target name for mirror events.
#[cfg(feature = "tracing")]
const MIRROR_TARGET: &str = "blkmirror::mirror";

/// Traces the start of a job.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_job_start(job: &str, length: u64, granularity: u64, buf_size: u64) {
    tracing::info!(
        target: MIRROR_TARGET,
        job = %job,
        length = length,
        granularity = granularity,
        buf_size = buf_size,
        "mirror: starting"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_job_start(_job: &str, _length: u64, _granularity: u64, _buf_size: u64) {}

/// Traces the dirty cursor wrapping around to the first chunk.
///
/// # Arguments
///
/// * `dirty` - Dirty bytes remaining when the pass restarted
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_restart_iter(job: &str, dirty: u64) {
    tracing::debug!(target: MIRROR_TARGET, job = %job, dirty = dirty, "mirror: restart iter");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_restart_iter(_job: &str, _dirty: u64) {}

/// Traces the planner waiting for a chunk that is still being copied.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_yield_in_flight(job: &str, offset: u64, in_flight: usize) {
    tracing::trace!(
        target: MIRROR_TARGET,
        job = %job,
        offset = offset,
        in_flight = in_flight,
        "mirror: yield on in-flight chunk"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_yield_in_flight(_job: &str, _offset: u64, _in_flight: usize) {}

/// Traces buffer starvation.
///
/// `waiting` is `true` when the planner has nothing accumulated and blocks
/// for buffers, `false` when it stops growing a unit.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_buf_starved(job: &str, free: usize, in_flight: usize, waiting: bool) {
    if waiting {
        tracing::trace!(
            target: MIRROR_TARGET,
            job = %job,
            free = free,
            in_flight = in_flight,
            "mirror: yield on buffers"
        );
    } else {
        tracing::trace!(
            target: MIRROR_TARGET,
            job = %job,
            free = free,
            in_flight = in_flight,
            "mirror: break on buffers"
        );
    }
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_buf_starved(_job: &str, _free: usize, _in_flight: usize, _waiting: bool) {}

/// Traces a unit cut short by the device fragment limit.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_break_iov(job: &str, fragments: usize, max_iov: usize) {
    tracing::trace!(
        target: MIRROR_TARGET,
        job = %job,
        fragments = fragments,
        max_iov = max_iov,
        "mirror: break on iov limit"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_break_iov(_job: &str, _fragments: usize, _max_iov: usize) {}

/// Traces a dispatched work unit.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_one_iteration(job: &str, offset: u64, len: u64, method: &'static str) {
    tracing::debug!(
        target: MIRROR_TARGET,
        job = %job,
        offset = offset,
        len = len,
        method = method,
        "mirror: one iteration"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_one_iteration(_job: &str, _offset: u64, _len: u64, _method: &'static str) {}

/// Traces a finished work unit.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_iteration_done(job: &str, offset: u64, len: u64, ok: bool) {
    tracing::debug!(
        target: MIRROR_TARGET,
        job = %job,
        offset = offset,
        len = len,
        ok = ok,
        "mirror: iteration done"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_iteration_done(_job: &str, _offset: u64, _len: u64, _ok: bool) {}

/// Traces an I/O failure and the verdict the error policy returned.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_io_error(job: &str, op: &'static str, error: &block::BlockError, verdict: &'static str) {
    tracing::warn!(
        target: MIRROR_TARGET,
        job = %job,
        op = op,
        error = %error,
        verdict = verdict,
        "mirror: I/O error"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_io_error(_job: &str, _op: &'static str, _error: &block::BlockError, _verdict: &'static str) {}

/// Traces the target flush attempted once nothing is dirty or in flight.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_before_flush(job: &str) {
    tracing::debug!(target: MIRROR_TARGET, job = %job, "mirror: before flush");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_before_flush(_job: &str) {}

/// Traces the final source drain.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_before_drain(job: &str, dirty: u64) {
    tracing::debug!(target: MIRROR_TARGET, job = %job, dirty = dirty, "mirror: before drain");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_before_drain(_job: &str, _dirty: u64) {}

/// Traces a pacing sleep.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_before_sleep(job: &str, dirty: u64, synced: bool, delay: Duration) {
    tracing::trace!(
        target: MIRROR_TARGET,
        job = %job,
        dirty = dirty,
        synced = synced,
        delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX),
        "mirror: before sleep"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_before_sleep(_job: &str, _dirty: u64, _synced: bool, _delay: Duration) {}

/// Traces the job becoming ready for completion.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_ready(job: &str, offset: u64) {
    tracing::info!(target: MIRROR_TARGET, job = %job, offset = offset, "mirror: ready");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_ready(_job: &str, _offset: u64) {}

/// Traces the final status.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_job_end(job: &str, outcome: &str) {
    tracing::info!(target: MIRROR_TARGET, job = %job, outcome = %outcome, "mirror: finished");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_job_end(_job: &str, _outcome: &str) {}

/// Reports a broken planner invariant. Always logged at error level.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_invariant_violation(job: &str, what: &'static str, chunk: u64) {
    tracing::error!(target: MIRROR_TARGET, job = %job, chunk = chunk, "mirror: invariant violated: {what}");
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_invariant_violation(_job: &str, _what: &'static str, _chunk: u64) {}

/// Reports a node whose original flags could not be restored after a failed
/// setup.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_restore_failed(node: &str, error: &block::BlockError) {
    tracing::error!(
        target: MIRROR_TARGET,
        node = %node,
        error = %error,
        "mirror: failed to restore node flags"
    );
}

/// No-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_restore_failed(_node: &str, _error: &block::BlockError) {}
