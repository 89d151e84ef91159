//! Active commit: merging an overlay into one of its backing nodes while the
//! overlay stays live.
//!
//! This is a mirror whose target is the base itself. Only data allocated
//! above the base is copied, and on completion the base replaces the top of
//! the chain.

use std::sync::Arc;

use block::{BlockDevice, BlockOp, NodeGraph, OnErrorPolicy};

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::job::{JobHandle, MirrorJob};
use crate::trace;

/// Parameters of an active commit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitConfig {
    /// Speed limit in bytes per second; zero is unlimited.
    pub speed: u64,
    /// Policy applied to failures on either node.
    pub on_error: OnErrorPolicy,
    /// Job identifier; defaults to the top node name.
    pub id: Option<String>,
}

impl CommitConfig {
    /// Sets the speed limit.
    #[must_use]
    pub const fn with_speed(mut self, speed: u64) -> Self {
        self.speed = speed;
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub const fn with_on_error(mut self, on_error: OnErrorPolicy) -> Self {
        self.on_error = on_error;
        self
    }

    /// Sets the job identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Starts committing `top` into `base`, one of its backing nodes.
///
/// `base` is reopened with the flags of `top` so it can take writes, and
/// grown when it is shorter than `top`. If the job cannot be started the
/// original flags of `base` are restored.
///
/// # Errors
///
/// [`MirrorError::Busy`] when a commit is blocked on `top`,
/// [`MirrorError::InvalidParameter`] when `base` is not below `top`,
/// [`MirrorError::Reopen`] or [`MirrorError::Io`] when `base` cannot be
/// prepared, and every error of [`MirrorJob::start`].
pub async fn commit_active_start(
    top: Arc<dyn BlockDevice>,
    base: Arc<dyn BlockDevice>,
    graph: Arc<dyn NodeGraph>,
    config: CommitConfig,
) -> Result<JobHandle, MirrorError> {
    if let Some(reason) = top.op_blockers().blocked_by(BlockOp::Commit) {
        return Err(MirrorError::Busy {
            node: top.node_name().to_owned(),
            reason,
        });
    }
    if !in_backing_chain(top.as_ref(), base.node_name()) {
        return Err(MirrorError::invalid(
            "base",
            format!("'{}' is not in the backing chain of '{}'", base.node_name(), top.node_name()),
        ));
    }

    let original = base.flags();
    let wanted = top.flags();
    if original != wanted {
        base.reopen(wanted).await.map_err(|source| MirrorError::Reopen {
            node: base.node_name().to_owned(),
            source,
        })?;
    }

    match start(top, Arc::clone(&base), graph, config).await {
        Ok(handle) => Ok(handle),
        Err(error) => {
            if original != wanted {
                // The setup error is what the caller needs to see.
                if let Err(restore) = base.reopen(original).await {
                    trace::trace_restore_failed(base.node_name(), &restore);
                }
            }
            Err(error)
        }
    }
}

async fn start(
    top: Arc<dyn BlockDevice>,
    base: Arc<dyn BlockDevice>,
    graph: Arc<dyn NodeGraph>,
    config: CommitConfig,
) -> Result<JobHandle, MirrorError> {
    let length = top.length();
    if base.length() < length {
        base.truncate(length)
            .await
            .map_err(|error| MirrorError::io("truncate", error))?;
    }

    let mirror = MirrorConfig::default()
        .with_speed(config.speed)
        .with_on_source_error(config.on_error)
        .with_on_target_error(config.on_error)
        .with_unmap(false);
    let mut job = MirrorJob::new(top, Arc::clone(&base), graph)
        .config(mirror)
        .base(base);
    if let Some(id) = config.id {
        job = job.id(id);
    }
    job.start()
}

fn in_backing_chain(top: &dyn BlockDevice, name: &str) -> bool {
    let mut layer = top.backing();
    while let Some(node) = layer {
        if node.node_name() == name {
            return true;
        }
        layer = node.backing();
    }
    false
}
