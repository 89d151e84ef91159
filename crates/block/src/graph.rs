use std::fmt;
use std::sync::Arc;

use crate::device::BlockDevice;
use crate::error::BlockError;

/// Name resolution over the block graph.
///
/// [`NodeGraph::replace`] is the only structural change a mirror job performs:
/// once it returns, every lookup of `old` resolves to `new`. Implementations
/// must make the swap atomic so there is no moment where `old` resolves to
/// nothing.
pub trait NodeGraph: Send + Sync + fmt::Debug {
    /// Resolves a node by name.
    fn lookup(&self, name: &str) -> Option<Arc<dyn BlockDevice>>;

    /// Substitutes `new` for the node currently registered as `old`.
    fn replace(&self, old: &str, new: Arc<dyn BlockDevice>) -> Result<(), BlockError>;
}
