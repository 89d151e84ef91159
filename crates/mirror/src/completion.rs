//! Completion requests and the final handoff.
//!
//! A completion request is only accepted once the job has converged. When
//! the loop then exits cleanly, [`finish`] reopens the target with the flags
//! of the node it replaces and swaps it into the graph. Whatever happens, the
//! blockers the job installed are released before the status is delivered.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use block::BlockDevice;

use crate::error::MirrorError;
use crate::job::{Exit, JobEnd, JobOutcome, JobShared, MirrorStats, Replacement};

/// Accepts a completion request for a converged job.
pub(crate) async fn request_complete(shared: &JobShared) -> Result<(), MirrorError> {
    if shared.handoff().finished {
        return Err(MirrorError::Finished { job: shared.id.clone() });
    }
    shared
        .target
        .open_backing_file()
        .await
        .map_err(|error| MirrorError::io("open-backing", error))?;

    let mut handoff = shared.handoff();
    if handoff.finished {
        return Err(MirrorError::Finished { job: shared.id.clone() });
    }
    if !shared.synced.load(Ordering::Acquire) {
        return Err(MirrorError::NotReady { job: shared.id.clone() });
    }
    if shared.should_complete.load(Ordering::Acquire) {
        return Ok(());
    }

    if let Some(name) = shared.replaces.as_deref() {
        let node = shared
            .graph
            .lookup(name)
            .ok_or_else(|| MirrorError::NodeNotFound(name.to_owned()))?;
        let blocker = node
            .op_blockers()
            .block_all("block device is in use by block-job-complete");
        handoff.replacement = Some(Replacement { node, blocker });
    }
    shared.should_complete.store(true, Ordering::Release);
    drop(handoff);
    shared.wake.notify_one();
    Ok(())
}

/// Performs the handoff for a clean exit and releases the job's blockers.
pub(crate) async fn finish(
    shared: &JobShared,
    exit: Result<Exit, MirrorError>,
    stats: MirrorStats,
) -> Result<JobOutcome, MirrorError> {
    let replacement = {
        let mut handoff = shared.handoff();
        handoff.finished = true;
        handoff.replacement.take()
    };

    let end = match exit {
        Ok(Exit::Converged) if shared.should_complete.load(Ordering::Acquire) => {
            pivot(shared, replacement.as_ref()).await.map(|replaced| JobEnd::Pivoted { replaced })
        }
        Ok(Exit::Converged) => Ok(JobEnd::InSync),
        Ok(Exit::Cancelled) => Ok(JobEnd::Cancelled),
        Err(error) => Err(error),
    };

    if let Some(Replacement { node, blocker }) = replacement {
        node.op_blockers().unblock(blocker);
    }
    shared.target.op_blockers().unblock(shared.target_blocker);
    shared.source.op_blockers().unblock(shared.source_blocker);

    end.map(|end| JobOutcome { end, stats })
}

async fn pivot(shared: &JobShared, replacement: Option<&Replacement>) -> Result<String, MirrorError> {
    let to_replace: Arc<dyn BlockDevice> =
        replacement.map_or_else(|| Arc::clone(&shared.source), |replacement| Arc::clone(&replacement.node));

    // A frontend may have been attached to either node since the job
    // started.
    if to_replace.has_frontend() && shared.target.has_frontend() {
        return Err(MirrorError::TwoBackends);
    }

    let flags = to_replace.flags();
    if shared.target.flags() != flags {
        shared
            .target
            .reopen(flags)
            .await
            .map_err(|source| MirrorError::Reopen {
                node: shared.target.node_name().to_owned(),
                source,
            })?;
    }

    shared
        .graph
        .replace(to_replace.node_name(), Arc::clone(&shared.target))
        .map_err(|error| MirrorError::io("replace", error))?;
    Ok(to_replace.node_name().to_owned())
}
