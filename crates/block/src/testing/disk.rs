//! In-memory block device with a backing chain, fault injection and an I/O
//! log.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use crate::blockers::{BlockOp, OpBlockers};
use crate::device::{BlockDevice, BlockStatus, DEFAULT_MAX_IOV, DeviceInfo, OpenFlags};
use crate::dirty::DirtyRegistry;
use crate::error::BlockError;

/// Allocation tracking unit of [`MemDisk`].
pub const SECTOR: u64 = 512;

/// Operation classes recorded and matched by faults.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IoKind {
    /// `readv`.
    Read,
    /// `writev`.
    Write,
    /// `write_zeroes`.
    WriteZeroes,
    /// `discard`.
    Discard,
    /// `flush`.
    Flush,
    /// `reopen`.
    Reopen,
}

/// One completed request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoRecord {
    /// Operation class.
    pub kind: IoKind,
    /// Start offset; zero for flush and reopen.
    pub offset: u64,
    /// Length in bytes; zero for flush and reopen.
    pub len: u64,
    /// Whether the request succeeded.
    pub ok: bool,
}

/// An injected failure.
#[derive(Clone, Debug)]
pub struct Fault {
    kind: IoKind,
    range: Option<Range<u64>>,
    error: BlockError,
    remaining: Option<u32>,
    skip: u32,
}

impl Fault {
    /// Fails every request of `kind` with `error` until cleared.
    #[must_use]
    pub fn new(kind: IoKind, error: BlockError) -> Self {
        Self {
            kind,
            range: None,
            error,
            remaining: None,
            skip: 0,
        }
    }

    /// Lets the first `count` matching requests through before failing.
    #[must_use]
    pub fn after(mut self, count: u32) -> Self {
        self.skip = count;
        self
    }

    /// Limits the fault to the first `count` matching requests.
    #[must_use]
    pub fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }

    /// Limits the fault to requests overlapping `range`.
    #[must_use]
    pub fn within(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    fn matches(&self, kind: IoKind, offset: u64, len: u64) -> bool {
        if self.kind != kind || self.remaining == Some(0) {
            return false;
        }
        self.range.as_ref().is_none_or(|range| {
            let end = offset.saturating_add(len.max(1));
            offset < range.end && range.start < end
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Alloc {
    Unallocated,
    Data,
    Zero,
}

#[derive(Debug)]
struct Layer {
    data: Vec<u8>,
    alloc: Vec<Alloc>,
}

impl Layer {
    fn new(length: u64, state: Alloc) -> Self {
        Self {
            data: vec![0; length as usize],
            alloc: vec![state; length.div_ceil(SECTOR) as usize],
        }
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn sectors(offset: u64, len: u64) -> Range<usize> {
        (offset / SECTOR) as usize..offset.saturating_add(len).div_ceil(SECTOR) as usize
    }

    /// Sectors fully covered by the byte range.
    fn covered(offset: u64, len: u64) -> Range<usize> {
        let start = offset.div_ceil(SECTOR) as usize;
        let end = (offset.saturating_add(len) / SECTOR) as usize;
        start..end.max(start)
    }
}

/// Builder for [`MemDisk`].
#[derive(Debug)]
pub struct MemDiskBuilder {
    name: String,
    length: u64,
    cluster_size: Option<u64>,
    backing: Option<Arc<dyn BlockDevice>>,
    deferred_backing: Option<Arc<dyn BlockDevice>>,
    backing_file_name: Option<String>,
    zero_init: bool,
    unallocated_reads_zero: bool,
    allocated: bool,
    max_iov: usize,
    latency: Option<Duration>,
    status_latency: Option<Duration>,
    frontend: bool,
    io_status: bool,
    flags: OpenFlags,
}

impl MemDiskBuilder {
    /// Sets the format cluster size.
    #[must_use]
    pub fn cluster_size(mut self, size: u64) -> Self {
        self.cluster_size = Some(size);
        self
    }

    /// Attaches an open backing node.
    #[must_use]
    pub fn backing(mut self, backing: Arc<dyn BlockDevice>) -> Self {
        self.backing_file_name = Some(backing.node_name().to_owned());
        self.backing = Some(backing);
        self
    }

    /// Records a backing file name whose node is only attached once
    /// [`BlockDevice::open_backing_file`] runs.
    #[must_use]
    pub fn unopened_backing(
        mut self,
        name: impl Into<String>,
        node: Option<Arc<dyn BlockDevice>>,
    ) -> Self {
        self.backing_file_name = Some(name.into());
        self.deferred_backing = node;
        self
    }

    /// Declares that a fresh node reads as zeroes.
    #[must_use]
    pub fn zero_init(mut self, zero_init: bool) -> Self {
        self.zero_init = zero_init;
        self
    }

    /// Declares whether unallocated runs at the bottom of the chain read as
    /// zeroes in status queries.
    #[must_use]
    pub fn unallocated_reads_zero(mut self, value: bool) -> Self {
        self.unallocated_reads_zero = value;
        self
    }

    /// Starts with every sector allocated as data.
    #[must_use]
    pub fn fully_allocated(mut self) -> Self {
        self.allocated = true;
        self
    }

    /// Limits fragments per vectored request.
    #[must_use]
    pub fn max_iov(mut self, max_iov: usize) -> Self {
        self.max_iov = max_iov;
        self
    }

    /// Delays every data request by `latency`.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delays every allocation status query by `latency`.
    #[must_use]
    pub fn status_latency(mut self, latency: Duration) -> Self {
        self.status_latency = Some(latency);
        self
    }

    /// Marks a guest-facing backend as attached.
    #[must_use]
    pub fn frontend(mut self, frontend: bool) -> Self {
        self.frontend = frontend;
        self
    }

    /// Enables I/O status tracking.
    #[must_use]
    pub fn io_status(mut self, enabled: bool) -> Self {
        self.io_status = enabled;
        self
    }

    /// Sets the initial open flags.
    #[must_use]
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builds the disk.
    #[must_use]
    pub fn build(self) -> Arc<MemDisk> {
        let state = if self.allocated {
            Alloc::Data
        } else {
            Alloc::Unallocated
        };
        let (gate, _) = watch::channel(true);

        Arc::new(MemDisk {
            name: self.name,
            cluster_size: self.cluster_size,
            backing: Mutex::new(self.backing),
            deferred_backing: Mutex::new(self.deferred_backing),
            backing_file_name: self.backing_file_name,
            zero_init: self.zero_init,
            unallocated_reads_zero: self.unallocated_reads_zero,
            max_iov: self.max_iov,
            latency: self.latency,
            status_latency: self.status_latency,
            frontend: AtomicBool::new(self.frontend),
            io_status: self.io_status,
            flags: Mutex::new(self.flags),
            layer: Mutex::new(Layer::new(self.length, state)),
            blockers: OpBlockers::new(),
            bitmaps: DirtyRegistry::new(),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            gate,
            pending: AtomicUsize::new(0),
            peak_pending: AtomicUsize::new(0),
            idle: Notify::new(),
            active_writes: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
        })
    }
}

/// Sparse in-memory disk.
///
/// Allocation is tracked per [`SECTOR`]. Reads of unallocated sectors fall
/// through to the backing node or return zeroes. Every write marks the
/// attached dirty bitmaps, so it can stand in for a live guest disk.
#[derive(Debug)]
pub struct MemDisk {
    name: String,
    cluster_size: Option<u64>,
    backing: Mutex<Option<Arc<dyn BlockDevice>>>,
    deferred_backing: Mutex<Option<Arc<dyn BlockDevice>>>,
    backing_file_name: Option<String>,
    zero_init: bool,
    unallocated_reads_zero: bool,
    max_iov: usize,
    latency: Option<Duration>,
    status_latency: Option<Duration>,
    frontend: AtomicBool,
    io_status: bool,
    flags: Mutex<OpenFlags>,
    layer: Mutex<Layer>,
    blockers: OpBlockers,
    bitmaps: DirtyRegistry,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<IoRecord>>,
    gate: watch::Sender<bool>,
    pending: AtomicUsize,
    peak_pending: AtomicUsize,
    idle: Notify,
    active_writes: Mutex<Vec<Range<u64>>>,
    overlaps: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlight<'a> {
    disk: &'a MemDisk,
    write_range: Option<Range<u64>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(range) = self.write_range.take() {
            let mut active = lock(&self.disk.active_writes);
            if let Some(position) = active.iter().position(|candidate| *candidate == range) {
                active.swap_remove(position);
            }
        }
        if self.disk.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.disk.idle.notify_waiters();
        }
    }
}

impl MemDisk {
    /// Starts building a disk of `length` bytes.
    #[must_use]
    pub fn builder(name: impl Into<String>, length: u64) -> MemDiskBuilder {
        MemDiskBuilder {
            name: name.into(),
            length,
            cluster_size: None,
            backing: None,
            deferred_backing: None,
            backing_file_name: None,
            zero_init: true,
            unallocated_reads_zero: true,
            allocated: false,
            max_iov: DEFAULT_MAX_IOV,
            latency: None,
            status_latency: None,
            frontend: false,
            io_status: false,
            flags: OpenFlags::READ_WRITE,
        }
    }

    /// Shorthand for an empty zero-initialised disk.
    #[must_use]
    pub fn new(name: impl Into<String>, length: u64) -> Arc<Self> {
        Self::builder(name, length).build()
    }

    /// Writes `byte` over `len` bytes at `offset`, as a guest would.
    pub async fn fill(&self, offset: u64, len: u64, byte: u8) -> Result<(), BlockError> {
        let data = vec![byte; len as usize];
        self.writev(offset, &[&data]).await
    }

    /// Writes a position dependent pattern over `len` bytes at `offset`.
    pub async fn fill_pattern(&self, offset: u64, len: u64, seed: u8) -> Result<(), BlockError> {
        let data: Vec<u8> = (offset..offset + len)
            .map(|position| (position / SECTOR) as u8 ^ (position as u8).wrapping_mul(31) ^ seed)
            .collect();
        self.writev(offset, &[&data]).await
    }

    /// Reads the whole device through the backing chain.
    pub async fn read_all(&self) -> Result<Vec<u8>, BlockError> {
        let mut buffer = vec![0; self.length() as usize];
        self.readv(0, &mut [&mut buffer]).await?;
        Ok(buffer)
    }

    /// Installs a fault.
    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    /// Removes every installed fault.
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Holds every subsequent data request until [`MemDisk::release_io`].
    pub fn hold_io(&self) {
        self.gate.send_replace(false);
    }

    /// Lets held requests proceed.
    pub fn release_io(&self) {
        self.gate.send_replace(true);
    }

    /// Requests currently executing or held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Highest number of concurrently executing requests seen.
    #[must_use]
    pub fn peak_pending(&self) -> usize {
        self.peak_pending.load(Ordering::Acquire)
    }

    /// Number of times two modifying requests overlapped in time and range.
    #[must_use]
    pub fn overlap_violations(&self) -> usize {
        self.overlaps.load(Ordering::Acquire)
    }

    /// Snapshot of the request log.
    #[must_use]
    pub fn io_log(&self) -> Vec<IoRecord> {
        lock(&self.log).clone()
    }

    /// Number of logged requests of `kind`.
    #[must_use]
    pub fn count(&self, kind: IoKind) -> usize {
        lock(&self.log).iter().filter(|record| record.kind == kind).count()
    }

    /// Clears the request log.
    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    /// Attaches or detaches a guest-facing backend.
    pub fn set_frontend(&self, attached: bool) {
        self.frontend.store(attached, Ordering::Release);
    }

    /// Returns `true` if every sector in the range is allocated in this
    /// layer.
    #[must_use]
    pub fn is_allocated(&self, offset: u64, len: u64) -> bool {
        let layer = lock(&self.layer);
        layer.alloc[Layer::sectors(offset, len)]
            .iter()
            .all(|state| *state != Alloc::Unallocated)
    }

    fn check_fault(&self, kind: IoKind, offset: u64, len: u64) -> Result<(), BlockError> {
        let mut faults = lock(&self.faults);
        let Some(fault) = faults.iter_mut().find(|fault| fault.matches(kind, offset, len)) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(fault.error.clone())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), BlockError> {
        let length = self.length();
        if offset.checked_add(len).is_none_or(|end| end > length) {
            return Err(BlockError::OutOfRange { offset, len, length });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), BlockError> {
        if lock(&self.flags).read_only {
            return Err(BlockError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    fn record(&self, kind: IoKind, offset: u64, len: u64, ok: bool) {
        lock(&self.log).push(IoRecord { kind, offset, len, ok });
    }

    async fn enter(&self, write_range: Option<Range<u64>>) -> InFlight<'_> {
        let now = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_pending.fetch_max(now, Ordering::AcqRel);

        if let Some(range) = write_range.as_ref() {
            let mut active = lock(&self.active_writes);
            if active
                .iter()
                .any(|other| other.start < range.end && range.start < other.end)
            {
                self.overlaps.fetch_add(1, Ordering::AcqRel);
            }
            active.push(range.clone());
        }
        let guard = InFlight {
            disk: self,
            write_range,
        };

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    /// Copies the backing content of partially overwritten unallocated
    /// sectors into this layer so the write does not expose stale zeroes.
    async fn copy_on_write(&self, offset: u64, len: u64) -> Result<(), BlockError> {
        let Some(backing) = self.backing() else {
            return Ok(());
        };

        let end = offset + len;
        let edges = [offset / SECTOR, (end - 1) / SECTOR];
        for (position, sector) in edges.into_iter().enumerate() {
            if position == 1 && edges[0] == edges[1] {
                break;
            }
            let sector_start = sector * SECTOR;
            let sector_end = (sector_start + SECTOR).min(self.length());
            let fully_covered = offset <= sector_start && end >= sector_end;
            let unallocated = lock(&self.layer).alloc[sector as usize] == Alloc::Unallocated;
            if fully_covered || !unallocated {
                continue;
            }

            let mut buffer = vec![0; (sector_end - sector_start) as usize];
            backing.readv(sector_start, &mut [&mut buffer]).await?;
            let mut layer = lock(&self.layer);
            if layer.alloc[sector as usize] == Alloc::Unallocated {
                layer.data[sector_start as usize..sector_end as usize].copy_from_slice(&buffer);
                layer.alloc[sector as usize] = Alloc::Data;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for MemDisk {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        lock(&self.layer).length()
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            cluster_size: self.cluster_size,
        }
    }

    fn backing(&self) -> Option<Arc<dyn BlockDevice>> {
        lock(&self.backing).clone()
    }

    fn backing_file_name(&self) -> Option<String> {
        self.backing_file_name.clone()
    }

    fn has_zero_init(&self) -> bool {
        self.zero_init
    }

    fn unallocated_reads_zero(&self) -> bool {
        self.unallocated_reads_zero
    }

    fn max_iov(&self) -> usize {
        self.max_iov
    }

    fn flags(&self) -> OpenFlags {
        *lock(&self.flags)
    }

    fn has_frontend(&self) -> bool {
        self.frontend.load(Ordering::Acquire)
    }

    fn io_status_enabled(&self) -> bool {
        self.io_status
    }

    fn op_blockers(&self) -> &OpBlockers {
        &self.blockers
    }

    fn dirty_bitmaps(&self) -> &DirtyRegistry {
        &self.bitmaps
    }

    async fn readv(&self, offset: u64, bufs: &mut [&mut [u8]]) -> Result<(), BlockError> {
        let len: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        self.check_range(offset, len)?;
        let _guard = self.enter(None).await;
        if let Err(error) = self.check_fault(IoKind::Read, offset, len) {
            self.record(IoKind::Read, offset, len, false);
            return Err(error);
        }

        let mut out = vec![0u8; len as usize];
        let mut holes: Vec<Range<u64>> = Vec::new();
        {
            let layer = lock(&self.layer);
            let base = offset as usize;
            out.copy_from_slice(&layer.data[base..base + len as usize]);
            for sector in Layer::sectors(offset, len) {
                if layer.alloc[sector] == Alloc::Unallocated {
                    let start = (sector as u64 * SECTOR).max(offset);
                    let end = ((sector as u64 + 1) * SECTOR).min(offset + len);
                    match holes.last_mut() {
                        Some(hole) if hole.end == start => hole.end = end,
                        _ => holes.push(start..end),
                    }
                }
            }
        }

        let backing = self.backing();
        for hole in holes {
            let window = &mut out[(hole.start - offset) as usize..(hole.end - offset) as usize];
            match backing.as_ref() {
                Some(backing) => backing.readv(hole.start, &mut [window]).await?,
                None => window.fill(0),
            }
        }

        let mut cursor = 0;
        for buf in bufs.iter_mut() {
            buf.copy_from_slice(&out[cursor..cursor + buf.len()]);
            cursor += buf.len();
        }
        self.record(IoKind::Read, offset, len, true);
        Ok(())
    }

    async fn writev(&self, offset: u64, bufs: &[&[u8]]) -> Result<(), BlockError> {
        let len: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        self.check_range(offset, len)?;
        self.check_writable()?;
        if len == 0 {
            return Ok(());
        }
        let _guard = self.enter(Some(offset..offset + len)).await;
        if let Err(error) = self.check_fault(IoKind::Write, offset, len) {
            self.record(IoKind::Write, offset, len, false);
            return Err(error);
        }

        self.copy_on_write(offset, len).await?;
        {
            let mut layer = lock(&self.layer);
            let mut cursor = offset as usize;
            for buf in bufs {
                layer.data[cursor..cursor + buf.len()].copy_from_slice(buf);
                cursor += buf.len();
            }
            for sector in Layer::sectors(offset, len) {
                layer.alloc[sector] = Alloc::Data;
            }
        }
        self.bitmaps.mark(offset, len);
        self.record(IoKind::Write, offset, len, true);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, len: u64, may_unmap: bool) -> Result<(), BlockError> {
        self.check_range(offset, len)?;
        self.check_writable()?;
        if len == 0 {
            return Ok(());
        }
        let _guard = self.enter(Some(offset..offset + len)).await;
        if let Err(error) = self.check_fault(IoKind::WriteZeroes, offset, len) {
            self.record(IoKind::WriteZeroes, offset, len, false);
            return Err(error);
        }

        self.copy_on_write(offset, len).await?;
        let unmap = may_unmap && self.backing().is_none() && self.unallocated_reads_zero;
        {
            let mut layer = lock(&self.layer);
            layer.data[offset as usize..(offset + len) as usize].fill(0);
            for sector in Layer::sectors(offset, len) {
                if layer.alloc[sector] == Alloc::Unallocated {
                    layer.alloc[sector] = Alloc::Data;
                }
            }
            let state = if unmap { Alloc::Unallocated } else { Alloc::Zero };
            for sector in Layer::covered(offset, len) {
                layer.alloc[sector] = state;
            }
        }
        self.bitmaps.mark(offset, len);
        self.record(IoKind::WriteZeroes, offset, len, true);
        Ok(())
    }

    async fn discard(&self, offset: u64, len: u64) -> Result<(), BlockError> {
        self.check_range(offset, len)?;
        self.check_writable()?;
        if len == 0 {
            return Ok(());
        }
        let _guard = self.enter(Some(offset..offset + len)).await;
        if let Err(error) = self.check_fault(IoKind::Discard, offset, len) {
            self.record(IoKind::Discard, offset, len, false);
            return Err(error);
        }

        {
            let mut layer = lock(&self.layer);
            for sector in Layer::covered(offset, len) {
                layer.alloc[sector] = Alloc::Unallocated;
                let start = sector * SECTOR as usize;
                let end = (start + SECTOR as usize).min(layer.data.len());
                layer.data[start..end].fill(0);
            }
        }
        self.bitmaps.mark(offset, len);
        self.record(IoKind::Discard, offset, len, true);
        Ok(())
    }

    async fn flush(&self) -> Result<(), BlockError> {
        let _guard = self.enter(None).await;
        let result = self.check_fault(IoKind::Flush, 0, 0);
        self.record(IoKind::Flush, 0, 0, result.is_ok());
        result
    }

    async fn block_status(&self, offset: u64, len: u64) -> Result<BlockStatus, BlockError> {
        let length = self.length();
        if offset >= length || len == 0 {
            return Err(BlockError::OutOfRange { offset, len, length });
        }
        let end = offset.saturating_add(len).min(length);
        if let Some(latency) = self.status_latency {
            tokio::time::sleep(latency).await;
        }

        let layer = lock(&self.layer);
        let first = (offset / SECTOR) as usize;
        let state = layer.alloc[first];
        let mut sector = first + 1;
        while (sector as u64) * SECTOR < end && layer.alloc[sector] == state {
            sector += 1;
        }
        let extent = ((sector as u64) * SECTOR).min(end) - offset;

        Ok(match state {
            Alloc::Data => BlockStatus::data(extent),
            Alloc::Zero => BlockStatus::zero(extent),
            Alloc::Unallocated => BlockStatus::unallocated(extent),
        })
    }

    async fn open_backing_file(&self) -> Result<(), BlockError> {
        let deferred = lock(&self.deferred_backing).take();
        if let Some(node) = deferred {
            *lock(&self.backing) = Some(node);
        }
        Ok(())
    }

    async fn reopen(&self, flags: OpenFlags) -> Result<(), BlockError> {
        if let Err(error) = self.check_fault(IoKind::Reopen, 0, 0) {
            self.record(IoKind::Reopen, 0, 0, false);
            return Err(error);
        }
        *lock(&self.flags) = flags;
        self.record(IoKind::Reopen, 0, 0, true);
        Ok(())
    }

    async fn truncate(&self, length: u64) -> Result<(), BlockError> {
        if let Some(reason) = self.blockers.blocked_by(BlockOp::Resize) {
            return Err(BlockError::Busy {
                node: self.name.clone(),
                reason,
            });
        }
        self.check_writable()?;

        let mut layer = lock(&self.layer);
        layer.data.resize(length as usize, 0);
        layer
            .alloc
            .resize(length.div_ceil(SECTOR) as usize, Alloc::Unallocated);
        Ok(())
    }

    async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}
