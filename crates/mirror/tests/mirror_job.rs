//! End-to-end tests for mirror jobs over in-memory disks.
//!
//! # Coverage Areas
//!
//! - Full, top and none sync modes
//! - Bounded buffers and in-flight units
//! - Cluster widening on targets without a backing node
//! - Completion, cancellation before and after convergence
//! - Cancellation during the initial scan and pacing sleeps
//! - Zero-write and discard shortcuts
//! - Rate limiting on the paused clock
//! - Convergence while the guest keeps writing
//! - Setup failures and graph handoff

mod support;

use std::time::Duration;

use block::testing::{IoKind, MemDisk};
use block::{BlockDevice, BlockError, BlockOp, OpenFlags};
use mirror::{JobEnd, MirrorConfig, MirrorError, MirrorJob, SyncMode};
use tokio::time::Instant;

use support::{K, M, assert_same_content, graph_of, mirror, wait_until};

// ============================================================================
// Copy Loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fully_dirty_device_is_copied_once_in_bounded_units() {
    let source = MemDisk::new("src", 10 * M);
    source.fill_pattern(0, 10 * M, 1).await.unwrap();
    let target = MemDisk::new("dst", 10 * M);

    let config = MirrorConfig::default().with_granularity(64 * K).with_buf_size(M);
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    let status = handle.subscribe();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.end, JobEnd::Pivoted { replaced: "src".to_owned() });
    assert_eq!(outcome.stats.chunks_copied, 160);
    assert_eq!(outcome.stats.bytes_copied, 10 * M);
    assert_eq!(outcome.stats.reads, outcome.stats.units);
    assert!(outcome.stats.peak_chunks_in_use <= 16);
    assert!(outcome.stats.peak_in_flight_ops <= 16);
    assert_eq!(target.overlap_violations(), 0);
    assert_eq!(graph.resolve("src").as_deref(), Some("dst"));

    let last = status.borrow().clone();
    assert!(last.finished);
    assert_eq!(last.offset, 10 * M);

    assert_same_content(&source, &target).await;
}

#[tokio::test(start_paused = true)]
async fn first_write_into_a_cluster_copies_the_whole_cluster() {
    let source = MemDisk::new("src", 4 * M);
    let target = MemDisk::builder("dst", 4 * M).cluster_size(M).build();

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_sync_mode(SyncMode::None);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    source.fill(M + 3 * 64 * K, 64 * K, 0xaa).await.unwrap();
    wait_until(|| target.count(IoKind::Write) >= 1).await;
    let writes: Vec<_> = target
        .io_log()
        .into_iter()
        .filter(|record| record.kind == IoKind::Write)
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!((writes[0].offset, writes[0].len), (M, M));

    // The cluster is now initialised on the target, so a later write only
    // copies its own chunk.
    source.fill(M + 4 * 64 * K, 64 * K, 0xbb).await.unwrap();
    wait_until(|| target.count(IoKind::Write) >= 2).await;
    let last = target
        .io_log()
        .into_iter()
        .rev()
        .find(|record| record.kind == IoKind::Write)
        .unwrap();
    assert_eq!((last.offset, last.len), (M + 4 * 64 * K, 64 * K));

    assert!(handle.ready().await);
    handle.cancel();
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert_same_content(&source, &target).await;
}

#[tokio::test(start_paused = true)]
async fn guest_writes_during_the_copy_are_converged() {
    let source = MemDisk::new("src", 8 * M);
    source.fill_pattern(0, 8 * M, 3).await.unwrap();
    let target = MemDisk::new("dst", 8 * M);

    let config = MirrorConfig::default().with_granularity(64 * K).with_buf_size(512 * K);
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    let writer = {
        let source = source.clone();
        tokio::spawn(async move {
            for round in 0..64u64 {
                let offset = (round * 7919 * 4 * K) % (8 * M - 128 * K);
                source.fill(offset, 64 * K + 512, round as u8).await.unwrap();
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        })
    };
    writer.await.unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    let outcome = handle.wait().await.unwrap();

    assert!(matches!(outcome.end, JobEnd::Pivoted { .. }));
    assert!(outcome.stats.chunks_copied >= 128);
    assert_eq!(target.overlap_violations(), 0);
    assert_eq!(graph.resolve("src").as_deref(), Some("dst"));
    assert_same_content(&source, &target).await;
}

#[tokio::test(start_paused = true)]
async fn completion_callback_runs_once_after_teardown() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let target = MemDisk::new("dst", M);
    let (job, _graph) = mirror(&source, &target, MirrorConfig::default());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let probe = source.clone();
    let handle = job
        .on_complete(move |result| {
            let released = probe.op_blockers().is_empty() && probe.dirty_bitmaps().is_empty();
            let _ = tx.send((result.clone(), released));
        })
        .start()
        .unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    let result = handle.wait().await;
    let (reported, released) = rx.await.unwrap();
    assert_eq!(reported, result);
    assert!(released);
}

// ============================================================================
// Sync Modes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn top_mode_copies_only_the_overlay() {
    let base = MemDisk::new("base", 2 * M);
    base.fill_pattern(0, 2 * M, 9).await.unwrap();
    let source = MemDisk::builder("src", 2 * M).backing(base.clone()).build();
    source.fill(256 * K, 128 * K, 0x5a).await.unwrap();
    let target = MemDisk::builder("dst", 2 * M).backing(base.clone()).build();

    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_sync_mode(SyncMode::Top);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    assert!(handle.ready().await);

    let writes: Vec<_> = target
        .io_log()
        .into_iter()
        .filter(|record| record.kind == IoKind::Write)
        .collect();
    assert!(!writes.is_empty());
    assert!(
        writes
            .iter()
            .all(|record| record.offset >= 256 * K && record.offset + record.len <= 384 * K)
    );
    assert_eq!(writes.iter().map(|record| record.len).sum::<u64>(), 128 * K);

    handle.cancel();
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert_same_content(&source, &target).await;
}

#[tokio::test(start_paused = true)]
async fn none_mode_skips_existing_data() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let target = MemDisk::new("dst", M);

    let config = MirrorConfig::default().with_sync_mode(SyncMode::None);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    assert!(handle.ready().await);
    assert_eq!(target.count(IoKind::Write), 0);

    handle.cancel();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.end, JobEnd::InSync);
    assert_eq!(outcome.stats.units, 0);
}

#[tokio::test(start_paused = true)]
async fn zero_length_source_is_ready_at_once() {
    let source = MemDisk::new("src", 0);
    let target = MemDisk::new("dst", 0);
    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    assert_eq!(
        handle.wait().await.unwrap().end,
        JobEnd::Pivoted { replaced: "src".to_owned() }
    );
    assert_eq!(graph.resolve("src").as_deref(), Some("dst"));
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_zero_length_job_ends_in_sync() {
    let source = MemDisk::new("src", 0);
    let target = MemDisk::new("dst", 0);
    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    handle.cancel();
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert!(graph.replacements().is_empty());
}

// ============================================================================
// Copy Shortcuts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn zero_regions_are_written_as_zeroes_without_reading() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::builder("dst", M).zero_init(false).build();
    target.fill(0, M, 0xff).await.unwrap();

    let config = MirrorConfig::default().with_granularity(64 * K);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    assert!(handle.ready().await);
    handle.cancel();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(source.count(IoKind::Read), 0);
    assert!(target.count(IoKind::WriteZeroes) >= 1);
    assert_eq!(outcome.stats.reads, 0);
    assert_eq!(outcome.stats.zero_writes, outcome.stats.units);
    assert!(target.read_all().await.unwrap().iter().all(|&byte| byte == 0));
}

#[tokio::test(start_paused = true)]
async fn unknown_unallocated_regions_are_discarded() {
    let source = MemDisk::builder("src", M).unallocated_reads_zero(false).build();
    let target = MemDisk::builder("dst", M).zero_init(false).build();

    let config = MirrorConfig::default().with_granularity(64 * K);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    assert!(handle.ready().await);
    handle.cancel();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(source.count(IoKind::Read), 0);
    assert_eq!(target.count(IoKind::Write), 0);
    assert!(target.count(IoKind::Discard) >= 1);
    assert_eq!(outcome.stats.discards, outcome.stats.units);
}

// ============================================================================
// Pacing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn speed_limit_paces_the_initial_copy() {
    let source = MemDisk::builder("src", 4 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 4 * M);

    let config = MirrorConfig::default().with_granularity(64 * K).with_speed(M);
    let (job, _graph) = mirror(&source, &target, config);
    let started = Instant::now();
    let handle = job.start().unwrap();
    assert!(handle.ready().await);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "converged after {elapsed:?}");

    handle.cancel();
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
}

#[tokio::test(start_paused = true)]
async fn lifting_the_speed_limit_speeds_up_the_copy() {
    let source = MemDisk::builder("src", 16 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 16 * M);

    let config = MirrorConfig::default().with_granularity(64 * K).with_speed(1);
    let (job, _graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.status().ready);
    assert!(handle.status().offset < 16 * M);

    handle.set_speed(0);
    assert_eq!(handle.status().speed, 0);
    assert!(
        tokio::time::timeout(Duration::from_secs(5), handle.ready())
            .await
            .unwrap()
    );
    handle.cancel();
    handle.wait().await.unwrap();
}

// ============================================================================
// Cancellation and Completion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancel_before_convergence_drains_outstanding_io() {
    let source = MemDisk::builder("src", 4 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 4 * M);
    target.hold_io();

    let config = MirrorConfig::default().with_granularity(64 * K);
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    wait_until(|| target.pending() > 0).await;

    handle.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    assert!(target.pending() > 0);

    target.release_io();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.end, JobEnd::Cancelled);
    assert_eq!(target.pending(), 0);
    assert!(graph.replacements().is_empty());
    assert!(source.op_blockers().is_empty());
    assert!(target.op_blockers().is_empty());
    assert!(source.dirty_bitmaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_the_pacing_sleep() {
    let source = MemDisk::builder("src", 4 * M).fully_allocated().build();
    let target = MemDisk::new("dst", 4 * M);

    // Every unit past the first in a slice overflows the quota and sleeps
    // until the slice ends.
    let config = MirrorConfig::default()
        .with_granularity(64 * K)
        .with_buf_size(64 * K)
        .with_speed(1)
        .with_slice_time(Duration::from_secs(10));
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    wait_until(|| target.count(IoKind::Write) >= 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(target.count(IoKind::Write), 2);

    let cancelled_at = Instant::now();
    handle.cancel();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.end, JobEnd::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_millis(100));
    assert!(graph.replacements().is_empty());
    assert!(source.op_blockers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_the_initial_scan_stops_it() {
    let source = MemDisk::builder("src", 4 * M)
        .status_latency(Duration::from_secs(1))
        .build();
    for extent in 0..8 {
        source.fill(extent * 512 * K, 256 * K, 0x5a).await.unwrap();
    }
    let target = MemDisk::new("dst", 4 * M);

    let config = MirrorConfig::default().with_granularity(64 * K);
    let (job, graph) = mirror(&source, &target, config);
    let handle = job.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(target.count(IoKind::Write), 0);
    assert!(!handle.status().ready);

    let cancelled_at = Instant::now();
    handle.cancel();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.end, JobEnd::Cancelled);
    // At most the status query already under way finishes.
    assert!(cancelled_at.elapsed() <= Duration::from_secs(1));
    assert_eq!(target.count(IoKind::Write), 0);
    assert!(graph.replacements().is_empty());
    assert!(source.op_blockers().is_empty());
    assert!(source.dirty_bitmaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn completion_before_convergence_is_rejected() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let target = MemDisk::new("dst", M);
    source.hold_io();

    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();
    wait_until(|| source.pending() > 0).await;

    let error = handle.complete().await.unwrap_err();
    assert_eq!(error, MirrorError::NotReady { job: "src".to_owned() });
    assert!(!handle.status().ready);

    source.release_io();
    assert!(handle.ready().await);
    handle.cancel();
    // The rejected request left nothing behind, so the job ends without a
    // handoff.
    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert!(graph.replacements().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_completion_requests_are_accepted() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let (job, _graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    handle.complete().await.unwrap();
    assert!(matches!(handle.wait().await.unwrap().end, JobEnd::Pivoted { .. }));
}

#[tokio::test(start_paused = true)]
async fn named_replacement_node_is_swapped_out() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let filter = MemDisk::new("filter", M);
    let target = MemDisk::new("dst", M);
    let graph = graph_of(&[&source, &filter, &target]);

    let config = MirrorConfig::default().with_replaces("filter");
    let handle = MirrorJob::new(source.clone(), target.clone(), graph.clone())
        .id("job0")
        .config(config)
        .start()
        .unwrap();
    assert_eq!(handle.id(), "job0");

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    assert!(filter.op_blockers().is_blocked(BlockOp::Replace));

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.end, JobEnd::Pivoted { replaced: "filter".to_owned() });
    assert_eq!(graph.resolve("filter").as_deref(), Some("dst"));
    assert_eq!(graph.resolve("src").as_deref(), Some("src"));
    assert!(filter.op_blockers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn completion_after_the_job_ended_is_refused() {
    let source = MemDisk::builder("src", M).fully_allocated().build();
    let filter = MemDisk::new("filter", M);
    let target = MemDisk::new("dst", M);
    let graph = graph_of(&[&source, &filter, &target]);

    let config = MirrorConfig::default().with_replaces("filter");
    let handle = MirrorJob::new(source.clone(), target.clone(), graph.clone())
        .config(config)
        .start()
        .unwrap();
    assert!(handle.ready().await);
    handle.cancel();
    wait_until(|| handle.status().finished).await;

    let error = handle.complete().await.unwrap_err();
    assert_eq!(error, MirrorError::Finished { job: "src".to_owned() });
    assert!(filter.op_blockers().is_empty());

    assert_eq!(handle.wait().await.unwrap().end, JobEnd::InSync);
    assert!(graph.replacements().is_empty());
    assert!(filter.op_blockers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn target_takes_the_flags_of_the_replaced_node() {
    let flags = OpenFlags {
        read_only: false,
        direct: true,
    };
    let source = MemDisk::builder("src", M).fully_allocated().flags(flags).build();
    let target = MemDisk::new("dst", M);
    let (job, _graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    handle.complete().await.unwrap();
    handle.wait().await.unwrap();
    assert_eq!(target.flags(), flags);
    assert_eq!(target.count(IoKind::Reopen), 1);
}

#[tokio::test(start_paused = true)]
async fn reopen_failure_fails_the_job_and_releases_blockers() {
    let source = MemDisk::builder("src", M)
        .fully_allocated()
        .flags(OpenFlags {
            read_only: false,
            direct: true,
        })
        .build();
    let target = MemDisk::new("dst", M);
    target.inject(block::testing::Fault::new(IoKind::Reopen, BlockError::NotSupported("direct")));

    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();
    assert!(handle.ready().await);
    handle.complete().await.unwrap();

    match handle.wait().await {
        Err(MirrorError::Reopen { node, source: error }) => {
            assert_eq!(node, "dst");
            assert_eq!(error, BlockError::NotSupported("direct"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(graph.replacements().is_empty());
    assert!(source.op_blockers().is_empty());
    assert!(target.op_blockers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn frontend_attached_late_blocks_the_handoff() {
    let source = MemDisk::builder("src", M).frontend(true).build();
    let target = MemDisk::new("dst", M);
    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    assert!(handle.ready().await);
    target.set_frontend(true);
    handle.complete().await.unwrap();
    assert_eq!(handle.wait().await.unwrap_err(), MirrorError::TwoBackends);
    assert!(graph.replacements().is_empty());
}

// ============================================================================
// Setup Failures
// ============================================================================

#[tokio::test]
async fn second_mirror_of_a_busy_node_is_refused() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let other = MemDisk::new("other", M);
    let (job, graph) = mirror(&source, &target, MirrorConfig::default());
    let handle = job.start().unwrap();

    let error = MirrorJob::new(source.clone(), other.clone(), graph.clone())
        .start()
        .unwrap_err();
    assert!(matches!(error, MirrorError::Busy { ref node, .. } if node == "src"));

    let error = MirrorJob::new(other.clone(), target.clone(), graph).start().unwrap_err();
    assert!(matches!(error, MirrorError::Busy { ref node, .. } if node == "dst"));
    assert!(other.op_blockers().is_empty());
    assert!(other.dirty_bitmaps().is_empty());

    handle.cancel();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn two_frontends_are_refused_at_start() {
    let source = MemDisk::builder("src", M).frontend(true).build();
    let target = MemDisk::builder("dst", M).frontend(true).build();
    let (job, _graph) = mirror(&source, &target, MirrorConfig::default());
    assert_eq!(job.start().unwrap_err(), MirrorError::TwoBackends);
    assert!(source.op_blockers().is_empty());
}

#[tokio::test]
async fn incremental_sync_is_unsupported() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let config = MirrorConfig::default().with_sync_mode(SyncMode::Incremental);
    let (job, _graph) = mirror(&source, &target, config);
    assert_eq!(
        job.start().unwrap_err(),
        MirrorError::UnsupportedSyncMode(SyncMode::Incremental)
    );
}

#[tokio::test]
async fn bad_granularity_is_refused() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let config = MirrorConfig::default().with_granularity(3000);
    let (job, _graph) = mirror(&source, &target, config);
    assert!(matches!(
        job.start().unwrap_err(),
        MirrorError::InvalidParameter { name: "granularity", .. }
    ));
    assert!(source.dirty_bitmaps().is_empty());
}

#[tokio::test]
async fn missing_replacement_node_is_refused() {
    let source = MemDisk::new("src", M);
    let target = MemDisk::new("dst", M);
    let config = MirrorConfig::default().with_replaces("nope");
    let (job, _graph) = mirror(&source, &target, config);
    assert_eq!(job.start().unwrap_err(), MirrorError::NodeNotFound("nope".to_owned()));
}

#[tokio::test]
async fn blocked_replacement_node_is_refused() {
    let source = MemDisk::new("src", M);
    let filter = MemDisk::new("filter", M);
    let target = MemDisk::new("dst", M);
    let graph = graph_of(&[&source, &filter, &target]);
    let blocker = filter.op_blockers().block(&[BlockOp::Replace], "exported");

    let error = MirrorJob::new(source.clone(), target.clone(), graph)
        .config(MirrorConfig::default().with_replaces("filter"))
        .start()
        .unwrap_err();
    assert!(matches!(error, MirrorError::Busy { ref reason, .. } if reason == "exported"));
    filter.op_blockers().unblock(blocker);
}

#[tokio::test]
async fn too_few_fragments_for_a_cluster_are_refused() {
    let source = MemDisk::new("src", 4 * M);
    let target = MemDisk::builder("dst", 4 * M).cluster_size(M).max_iov(4).build();
    let config = MirrorConfig::default().with_granularity(64 * K);
    let (job, _graph) = mirror(&source, &target, config);
    assert!(matches!(
        job.start().unwrap_err(),
        MirrorError::InvalidParameter { name: "granularity", .. }
    ));
}
