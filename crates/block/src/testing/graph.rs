use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::BlockDevice;
use crate::error::BlockError;
use crate::graph::NodeGraph;

/// Name table guarded by a single lock, so replacement is one swap.
#[derive(Debug, Default)]
pub struct MemGraph {
    nodes: RwLock<HashMap<String, Arc<dyn BlockDevice>>>,
    replacements: RwLock<Vec<(String, String)>>,
}

impl MemGraph {
    /// Creates a graph holding `nodes` under their own names.
    #[must_use]
    pub fn with_nodes(nodes: impl IntoIterator<Item = Arc<dyn BlockDevice>>) -> Arc<Self> {
        let graph = Self::default();
        for node in nodes {
            graph.insert(node);
        }
        Arc::new(graph)
    }

    /// Registers `node` under its node name.
    pub fn insert(&self, node: Arc<dyn BlockDevice>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.node_name().to_owned(), node);
    }

    /// Name of the node `name` currently resolves to.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.lookup(name).map(|node| node.node_name().to_owned())
    }

    /// `(replaced, replacement)` pairs in the order they happened.
    #[must_use]
    pub fn replacements(&self) -> Vec<(String, String)> {
        self.replacements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NodeGraph for MemGraph {
    fn lookup(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn replace(&self, old: &str, new: Arc<dyn BlockDevice>) -> Result<(), BlockError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = nodes.get_mut(old) else {
            return Err(BlockError::io(
                io::ErrorKind::NotFound,
                format!("no node named '{old}'"),
            ));
        };
        let replacement = new.node_name().to_owned();
        *slot = new;
        drop(nodes);

        self.replacements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((old.to_owned(), replacement));
        Ok(())
    }
}
