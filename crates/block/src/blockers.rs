//! Operation blockers.
//!
//! A long running job marks the nodes it depends on so that conflicting
//! management operations (a resize, a second mirror, an active commit) are
//! refused while it runs. Blockers only gate management operations; guest
//! I/O is never affected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Management operations that can be blocked on a node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BlockOp {
    /// Changing the device length.
    Resize,
    /// Using the node as the source of a mirror job.
    MirrorSource,
    /// Using the node as the destination of a mirror job.
    MirrorTarget,
    /// Committing an overlay into this node.
    Commit,
    /// Substituting another node in place of this one.
    Replace,
}

/// Handle returned by [`OpBlockers::block_all`] and friends.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockerId(u64);

#[derive(Debug)]
struct Blocker {
    id: BlockerId,
    reason: String,
    ops: Option<Vec<BlockOp>>,
}

impl Blocker {
    fn blocks(&self, op: BlockOp) -> bool {
        self.ops.as_ref().is_none_or(|ops| ops.contains(&op))
    }
}

/// Set of blockers installed on one node.
#[derive(Debug, Default)]
pub struct OpBlockers {
    blockers: Mutex<Vec<Blocker>>,
    next_id: AtomicU64,
}

impl OpBlockers {
    /// Creates an empty blocker set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks every operation until [`OpBlockers::unblock`] is called with the
    /// returned id.
    pub fn block_all(&self, reason: impl Into<String>) -> BlockerId {
        self.install(reason.into(), None)
    }

    /// Blocks only the listed operations.
    pub fn block(&self, ops: &[BlockOp], reason: impl Into<String>) -> BlockerId {
        self.install(reason.into(), Some(ops.to_vec()))
    }

    /// Removes a blocker. Unknown ids are ignored.
    pub fn unblock(&self, id: BlockerId) {
        self.lock().retain(|blocker| blocker.id != id);
    }

    /// Returns the reason of the first blocker covering `op`.
    #[must_use]
    pub fn blocked_by(&self, op: BlockOp) -> Option<String> {
        self.lock()
            .iter()
            .find(|blocker| blocker.blocks(op))
            .map(|blocker| blocker.reason.clone())
    }

    /// Returns `true` when `op` is currently refused.
    #[must_use]
    pub fn is_blocked(&self, op: BlockOp) -> bool {
        self.blocked_by(op).is_some()
    }

    /// Returns `true` when no blocker is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn install(&self, reason: String, ops: Option<Vec<BlockOp>>) -> BlockerId {
        let id = BlockerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Blocker { id, reason, ops });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Blocker>> {
        self.blockers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
