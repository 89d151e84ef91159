//! I/O failures during a mirror job and how each error policy treats them.
//!
//! # Coverage Areas
//!
//! - `report`: first failure becomes the final status
//! - `ignore`: failed regions stay dirty and are retried
//! - `stop` and `enospc`: the job pauses until resumed
//! - Flush failures at the convergence point

mod support;

use std::io;

use block::testing::{Fault, IoKind, MemDisk};
use block::{BlockDevice, BlockError, OnErrorPolicy};
use mirror::{JobEnd, MirrorConfig, MirrorError};

use support::{K, M, assert_same_content, mirror, wait_until};

fn media_error() -> BlockError {
    BlockError::io(io::ErrorKind::Other, "media error")
}

// ============================================================================
// Report
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reported_write_failure_is_the_final_status() {
    let source = MemDisk::builder("src", 2 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 2 * M);
    target.inject(Fault::new(IoKind::Write, media_error()).within(M..M + 64 * K).times(1));

    let config = MirrorConfig::default().with_granularity(64 * K).with_buf_size(256 * K);
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    match handle.wait().await {
        Err(MirrorError::Io { op, source: error }) => {
            assert_eq!(op, "write");
            assert_eq!(error, media_error());
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(graph.replacements().is_empty());
    assert!(source.op_blockers().is_empty());
    assert!(target.op_blockers().is_empty());
    assert_eq!(target.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn failure_stays_final_when_later_units_succeed() {
    // One chunk per unit so several units are in flight when the first fails.
    let source = MemDisk::builder("src", 2 * M).fully_allocated().max_iov(1).build();
    let target = MemDisk::new("dst", 2 * M);
    source.inject(Fault::new(IoKind::Read, media_error()).within(0..64 * K).times(1));

    let config = MirrorConfig::default().with_granularity(64 * K).with_buf_size(256 * K);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    match handle.wait().await {
        Err(MirrorError::Io { op, source: error }) => {
            assert_eq!(op, "read");
            assert_eq!(error, media_error());
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(target.count(IoKind::Write) >= 1);
    assert_eq!(target.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn reported_flush_failure_fails_the_job() {
    let source = MemDisk::builder("src", 256 * K).fully_allocated().build();
    let target = MemDisk::new("dst", 256 * K);
    target.inject(Fault::new(IoKind::Flush, media_error()));

    let (job, _graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();
    assert!(!handle.ready().await);
    assert!(matches!(
        handle.wait().await.unwrap_err(),
        MirrorError::Io { op: "flush", .. }
    ));
}

// ============================================================================
// Ignore
// ============================================================================

#[tokio::test(start_paused = true)]
async fn ignored_failures_are_retried() {
    let source = MemDisk::new("src", 2 * M);
    source.fill_pattern(0, 2 * M, 5).await.unwrap();
    let target = MemDisk::new("dst", 2 * M);
    target.inject(Fault::new(IoKind::Write, media_error()).times(2));
    source.inject(Fault::new(IoKind::Read, media_error()).within(M..2 * M).times(1));

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_buf_size(512 * K)
        .with_on_source_error(OnErrorPolicy::Ignore)
        .with_on_target_error(OnErrorPolicy::Ignore);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    let outcome = handle.wait().await.unwrap();
    assert!(matches!(outcome.end, JobEnd::Pivoted { .. }));

    let failed_writes = target
        .io_log()
        .iter()
        .filter(|record| record.kind == IoKind::Write && !record.ok)
        .count();
    assert_eq!(failed_writes, 2);
    assert_eq!(outcome.stats.bytes_copied, 2 * M);
    assert_same_content(&source, &target).await;
}

// ============================================================================
// Stop and Enospc
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stop_policy_pauses_until_resumed() {
    let source = MemDisk::builder("src", M).fully_allocated().io_status(true).build();
    let target = MemDisk::new("dst", M);
    source.inject(Fault::new(IoKind::Read, media_error()).times(1));

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_on_source_error(OnErrorPolicy::Stop);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    wait_until(|| handle.status().paused).await;
    let writes = target.count(IoKind::Write);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(handle.status().paused);
    assert!(!handle.status().ready);
    assert_eq!(target.count(IoKind::Write), writes);

    handle.iostatus_reset();
    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    assert!(matches!(handle.wait().await.unwrap().end, JobEnd::Pivoted { .. }));
    assert_same_content(&source, &target).await;
}

#[tokio::test]
async fn stop_policy_on_the_source_needs_io_status() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let config = MirrorConfig::default().with_on_source_error(OnErrorPolicy::Enospc);
    let (job, _graph) = mirror(&source, &target, config);
    assert!(matches!(
        job.start().unwrap_err(),
        MirrorError::InvalidParameter { name: "on-source-error", .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn enospc_pauses_on_out_of_space() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let target = MemDisk::new("dst", M);
    target.inject(Fault::new(IoKind::Write, BlockError::NoSpace).times(1));

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_on_target_error(OnErrorPolicy::Enospc);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    wait_until(|| handle.status().paused).await;
    handle.resume();
    assert!(handle.ready().await);
    handle.cancel();
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert_same_content(&source, &target).await;
}

#[tokio::test(start_paused = true)]
async fn enospc_reports_other_failures() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let target = MemDisk::new("dst", M);
    target.inject(Fault::new(IoKind::Write, media_error()).times(1));

    let config = MirrorConfig::default().with_on_target_error(OnErrorPolicy::Enospc);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    assert!(matches!(
        handle.wait().await.unwrap_err(),
        MirrorError::Io { op: "write", .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn manual_pause_holds_new_dispatches() {
    let source = MemDisk::builder("src", 4 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 4 * M);

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_buf_size(64 * K)
        .with_speed(M);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    wait_until(|| target.count(IoKind::Write) >= 1).await;

    handle.pause();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let writes = target.count(IoKind::Write);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert_eq!(target.count(IoKind::Write), writes);
    assert!(handle.status().paused);

    handle.resume();
    handle.set_speed(0);
    assert!(handle.ready().await);
    handle.cancel();
    handle.wait().await.unwrap();
}
