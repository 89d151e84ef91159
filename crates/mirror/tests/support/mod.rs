//! Shared fixtures for the mirror job tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use block::BlockDevice;
use block::testing::{MemDisk, MemGraph};
use mirror::{MirrorConfig, MirrorJob};

pub const K: u64 = 1024;
pub const M: u64 = 1024 * 1024;

/// Graph holding every disk under its own name.
pub fn graph_of(disks: &[&Arc<MemDisk>]) -> Arc<MemGraph> {
    MemGraph::with_nodes(disks.iter().map(|disk| Arc::clone(*disk) as Arc<dyn BlockDevice>))
}

/// Mirror job from `source` to `target` in a graph holding both.
pub fn mirror(source: &Arc<MemDisk>, target: &Arc<MemDisk>, config: MirrorConfig) -> (MirrorJob, Arc<MemGraph>) {
    let graph = graph_of(&[source, target]);
    let job = MirrorJob::new(source.clone(), target.clone(), graph.clone()).config(config);
    (job, graph)
}

/// Polls `condition` on the (usually paused) test clock.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Asserts both disks read back the same bytes.
pub async fn assert_same_content(left: &MemDisk, right: &MemDisk) {
    let left = left.read_all().await.unwrap();
    let right = right.read_all().await.unwrap();
    assert_eq!(left.len(), right.len());
    let first_difference = left.iter().zip(&right).position(|(a, b)| a != b);
    assert_eq!(first_difference, None, "contents differ");
}
