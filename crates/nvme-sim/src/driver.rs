//! Host-side driver for [`NvmeController`]: one I/O queue pair, PRP construction from a
//! scatter-gather cursor, request splitting at MDTS and completion reaping.

use std::collections::HashMap;

use nvme_sgl::{
    CompletionCallback, DmaHandle, IoCompletion, IoDevice, NamespaceInfo, SgCursor, SubmitError,
};

use crate::controller::{
    mdts_to_bytes, CqEntry, NvmeCommand, CQE_SIZE, MAX_QUEUE_ENTRIES, OPC_READ, OPC_WRITE,
    SQE_SIZE,
};
use crate::{collect_prp_entries, MemoryBus, NvmeController, NvmeStatus, SharedArena, PAGE_SIZE};

const IO_QID: u16 = 1;
const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;
/// Per-command cap used when the controller reports no usable MDTS limit.
const UNLIMITED_MAX_TRANSFER: u64 = 4 * 1024 * 1024;

/// One controller command carved out of a vectored request.
struct ChildCommand {
    slba: u64,
    blocks: u32,
    prp1: u64,
    prp2: u64,
    prp_lists: Vec<DmaHandle>,
}

struct Inflight {
    parent: u64,
    prp_lists: Vec<DmaHandle>,
}

/// A vectored request; completes once every child command has completed.
struct ParentRequest {
    remaining: usize,
    status: IoCompletion,
    callback: CompletionCallback,
}

/// Driver instance bound to one simulated controller.
pub struct SimDevice {
    name: String,
    ctrl: NvmeController,
    mem: SharedArena,
    namespace: Option<NamespaceInfo>,
    max_transfer: u64,

    sq_mem: DmaHandle,
    cq_mem: DmaHandle,
    queue_size: u16,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,

    next_cid: u16,
    next_parent: u64,
    inflight: HashMap<u16, Inflight>,
    parents: HashMap<u64, ParentRequest>,
    detached: bool,
}

impl SimDevice {
    /// Reads identify data, allocates the I/O queue pair in `mem` and creates it on the
    /// controller.
    pub(crate) fn attach(
        name: String,
        mut ctrl: NvmeController,
        mem: SharedArena,
        queue_size: u16,
    ) -> Result<SimDevice, crate::AttachError> {
        let queue_size = queue_size.clamp(2, MAX_QUEUE_ENTRIES);
        let page = PAGE_SIZE as u32;

        let sq_len = u32::from(queue_size) * SQE_SIZE as u32;
        let cq_len = u32::from(queue_size) * CQE_SIZE as u32;
        let sq_mem = mem.with_mut(|arena| arena.alloc_zeroed(sq_len, page))?;
        let cq_mem = match mem.with_mut(|arena| arena.alloc_zeroed(cq_len, page)) {
            Ok(cq_mem) => cq_mem,
            Err(err) => {
                mem.with_mut(|arena| arena.free(sq_mem))?;
                return Err(err.into());
            }
        };

        let (sq_phys, cq_phys) = mem.with(|arena| (arena.phys_addr(sq_mem), arena.phys_addr(cq_mem)));
        let mut status = ctrl.create_io_cq(IO_QID, cq_phys, queue_size);
        if status.is_success() {
            status = ctrl.create_io_sq(IO_QID, sq_phys, queue_size, IO_QID);
        }
        if !status.is_success() {
            mem.with_mut(|arena| {
                arena.free(sq_mem)?;
                arena.free(cq_mem)
            })?;
            return Err(crate::AttachError::QueueCreation(status));
        }

        let namespace = parse_namespace(&ctrl.identify_namespace(1));
        let max_transfer =
            mdts_to_bytes(ctrl.identify_controller()[77]).unwrap_or(UNLIMITED_MAX_TRANSFER);

        tracing::debug!(
            device = %name,
            ?namespace,
            max_transfer,
            queue_size,
            "nvme controller attached"
        );

        Ok(SimDevice {
            name,
            ctrl,
            mem,
            namespace,
            max_transfer,
            sq_mem,
            cq_mem,
            queue_size,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true,
            next_cid: 0,
            next_parent: 0,
            inflight: HashMap::new(),
            parents: HashMap::new(),
            detached: false,
        })
    }

    /// Per-command byte limit the driver splits requests at.
    pub fn max_transfer_bytes(&self) -> u64 {
        self.max_transfer
    }

    /// Commands submitted but not yet reaped.
    pub fn outstanding_commands(&self) -> usize {
        self.inflight.len()
    }

    fn free_slots(&self) -> usize {
        usize::from(self.queue_size) - 1 - self.inflight.len()
    }

    fn alloc_cid(&mut self) -> u16 {
        loop {
            let cid = self.next_cid;
            self.next_cid = self.next_cid.wrapping_add(1);
            if !self.inflight.contains_key(&cid) {
                return cid;
            }
        }
    }

    fn free_handles(&self, handles: &[DmaHandle]) {
        self.mem.with_mut(|arena| {
            for &handle in handles {
                if let Err(err) = arena.free(handle) {
                    tracing::warn!(device = %self.name, "failed to free PRP list: {err}");
                }
            }
        });
    }

    /// Writes PRP entries 1.. into freshly allocated list pages (chained when they do not fit in
    /// one page) and returns PRP2 plus the pages to release on completion.
    fn build_prp2(&self, entries: &[u64]) -> Result<(u64, Vec<DmaHandle>), SubmitError> {
        match entries.len() {
            0 | 1 => return Ok((0, Vec::new())),
            2 => return Ok((entries[1], Vec::new())),
            _ => {}
        }

        let rest = &entries[1..];
        let mut chunks = Vec::new();
        let mut cursor = rest;
        while cursor.len() > PRP_ENTRIES_PER_PAGE {
            let (head, tail) = cursor.split_at(PRP_ENTRIES_PER_PAGE - 1);
            chunks.push(head);
            cursor = tail;
        }
        chunks.push(cursor);

        let page = PAGE_SIZE as u32;
        let mut lists = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            match self.mem.with_mut(|arena| arena.alloc_zeroed(page, page)) {
                Ok(handle) => lists.push(handle),
                Err(_) => {
                    self.free_handles(&lists);
                    return Err(SubmitError::OutOfDescriptorMemory);
                }
            }
        }

        let written = self.mem.with_mut(|arena| {
            let phys: Vec<u64> = lists.iter().map(|&h| arena.phys_addr(h)).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                for (j, &entry) in chunk.iter().enumerate() {
                    arena.write_u64(phys[i] + j as u64 * 8, entry)?;
                }
                if let Some(&next) = phys.get(i + 1) {
                    arena.write_u64(phys[i] + (PRP_ENTRIES_PER_PAGE as u64 - 1) * 8, next)?;
                }
            }
            Ok::<_, crate::MemoryError>(phys[0])
        });

        match written {
            Ok(prp2) => Ok((prp2, lists)),
            Err(_) => {
                self.free_handles(&lists);
                Err(SubmitError::OutOfDescriptorMemory)
            }
        }
    }

    fn submit(
        &mut self,
        opc: u8,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError> {
        if self.detached {
            return Err(SubmitError::Detached);
        }
        if self.ctrl.is_fatal() {
            return Err(SubmitError::ControllerFatal);
        }
        let ns = self
            .namespace
            .filter(|ns| ns.id == nsid)
            .ok_or(SubmitError::InvalidNamespace(nsid))?;
        if lba_count == 0 {
            return Err(SubmitError::ZeroLength);
        }

        let sector = u64::from(ns.sector_size);
        let total_bytes = u64::from(lba_count) * sector;
        if total_bytes > u64::from(u32::MAX) {
            return Err(SubmitError::InvalidSgl {
                offset: 0,
                reason: "transfer does not fit a 32-bit SGL offset",
            });
        }

        let blocks_per_cmd = (self.max_transfer / sector).clamp(1, 0x1_0000);
        let total_blocks = u64::from(lba_count);
        let children = total_blocks.div_ceil(blocks_per_cmd) as usize;
        let free = self.free_slots();
        if children > free {
            return Err(SubmitError::QueueFull {
                free,
                needed: children,
            });
        }

        // Build every child before queueing anything so a rejected SGL leaves the queue untouched.
        let mut built: Vec<ChildCommand> = Vec::with_capacity(children);
        for i in 0..children as u64 {
            let first = i * blocks_per_cmd;
            let blocks = blocks_per_cmd.min(total_blocks - first);
            let offset = first * sector;

            cursor.reset(offset as u32);
            let prepared = collect_prp_entries(cursor, blocks * sector, offset)
                .and_then(|entries| Ok((entries[0], self.build_prp2(&entries)?)));
            match prepared {
                Ok((prp1, (prp2, prp_lists))) => built.push(ChildCommand {
                    slba: lba + first,
                    blocks: blocks as u32,
                    prp1,
                    prp2,
                    prp_lists,
                }),
                Err(err) => {
                    for child in &built {
                        self.free_handles(&child.prp_lists);
                    }
                    tracing::debug!(device = %self.name, "rejecting submission: {err}");
                    return Err(err);
                }
            }
        }

        let parent = self.next_parent;
        self.next_parent += 1;
        self.parents.insert(
            parent,
            ParentRequest {
                remaining: children,
                status: IoCompletion::SUCCESS,
                callback,
            },
        );

        let start_tail = self.sq_tail;
        let sq_phys = self.mem.with(|arena| arena.phys_addr(self.sq_mem));
        let mut queued = Vec::with_capacity(children);
        let mut pending = built.into_iter();
        while let Some(child) = pending.next() {
            let cid = self.alloc_cid();
            let cmd = NvmeCommand::rw(
                opc,
                cid,
                nsid,
                child.slba,
                child.blocks,
                child.prp1,
                child.prp2,
            );
            let slot = sq_phys + u64::from(self.sq_tail) * SQE_SIZE;
            if let Err(err) = self
                .mem
                .with_mut(|arena| arena.write_physical(slot, &cmd.to_bytes()))
            {
                tracing::error!(device = %self.name, "submission queue write failed: {err}");
                // Nothing has been announced to the controller yet: drop the whole request.
                for cid in queued {
                    if let Some(inflight) = self.inflight.remove(&cid) {
                        self.free_handles(&inflight.prp_lists);
                    }
                }
                self.free_handles(&child.prp_lists);
                for rest in pending.by_ref() {
                    self.free_handles(&rest.prp_lists);
                }
                self.parents.remove(&parent);
                self.sq_tail = start_tail;
                return Err(SubmitError::QueueWrite);
            }
            tracing::trace!(
                device = %self.name,
                cid,
                slba = child.slba,
                blocks = child.blocks,
                prp1 = format_args!("{:#x}", child.prp1),
                prp2 = format_args!("{:#x}", child.prp2),
                "queued command"
            );
            self.inflight.insert(
                cid,
                Inflight {
                    parent,
                    prp_lists: child.prp_lists,
                },
            );
            queued.push(cid);
            self.sq_tail = (self.sq_tail + 1) % self.queue_size;
        }

        let ctrl = &mut self.ctrl;
        let tail = self.sq_tail;
        self.mem
            .with_mut(|arena| ctrl.ring_sq_doorbell(IO_QID, tail, arena));
        Ok(())
    }

    fn next_completion(&self) -> Option<CqEntry> {
        let mut bytes = [0u8; 16];
        let addr = self.mem.with(|arena| arena.phys_addr(self.cq_mem))
            + u64::from(self.cq_head) * CQE_SIZE;
        self.mem
            .with(|arena| arena.read_physical(addr, &mut bytes))
            .ok()?;
        let entry = CqEntry::from_bytes(&bytes);
        (entry.phase() == self.cq_phase).then_some(entry)
    }
}

impl IoDevice for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_namespace(&self) -> Option<NamespaceInfo> {
        self.namespace
    }

    fn submit_writev(
        &mut self,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError> {
        self.submit(OPC_WRITE, nsid, lba, lba_count, callback, cursor)
    }

    fn submit_readv(
        &mut self,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError> {
        self.submit(OPC_READ, nsid, lba, lba_count, callback, cursor)
    }

    fn process_completions(&mut self, max_completions: u32) -> usize {
        if self.detached {
            return 0;
        }

        let mut reaped = 0usize;
        let mut finished = Vec::new();
        while max_completions == 0 || reaped < max_completions as usize {
            let Some(entry) = self.next_completion() else {
                break;
            };
            self.cq_head = (self.cq_head + 1) % self.queue_size;
            if self.cq_head == 0 {
                self.cq_phase = !self.cq_phase;
            }
            reaped += 1;

            let Some(inflight) = self.inflight.remove(&entry.cid) else {
                tracing::warn!(device = %self.name, cid = entry.cid, "completion for unknown command");
                continue;
            };
            self.free_handles(&inflight.prp_lists);

            let status = NvmeStatus::decode(entry.status);
            let Some(parent) = self.parents.get_mut(&inflight.parent) else {
                continue;
            };
            if !status.is_success() && !parent.status.is_error() {
                parent.status = IoCompletion {
                    sct: status.sct,
                    sc: status.sc,
                };
            }
            parent.remaining -= 1;
            if parent.remaining == 0 {
                if let Some(done) = self.parents.remove(&inflight.parent) {
                    finished.push(done);
                }
            }
        }

        if reaped > 0 {
            self.ctrl.ring_cq_doorbell(IO_QID, self.cq_head);
        }
        for done in finished {
            (done.callback)(&done.status);
        }
        reaped
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.ctrl.delete_io_queues();

        let lists: Vec<DmaHandle> = self
            .inflight
            .drain()
            .flat_map(|(_, inflight)| inflight.prp_lists)
            .collect();
        self.free_handles(&lists);
        self.free_handles(&[self.sq_mem, self.cq_mem]);
        self.parents.clear();

        tracing::debug!(device = %self.name, "nvme controller detached");
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.detach();
    }
}

fn parse_namespace(data: &[u8]) -> Option<NamespaceInfo> {
    let mut nsze = [0u8; 8];
    nsze.copy_from_slice(data.get(0..8)?);
    let size_blocks = u64::from_le_bytes(nsze);

    let format = usize::from(data.get(26)? & 0xf);
    let lbads = *data.get(128 + format * 4 + 2)?;
    if size_blocks == 0 || !(9..=16).contains(&lbads) {
        return None;
    }

    Some(NamespaceInfo {
        id: 1,
        sector_size: 1 << lbads,
        size_blocks,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use nvme_sgl::{DmaAllocator, Segment, SegmentCursor, SegmentList};

    use super::*;
    use crate::{DeviceConfig, SimBus, ARENA_VIRT_BASE};

    fn attach(config: DeviceConfig) -> (SharedArena, SimDevice) {
        let mut bus = SimBus::new(SharedArena::new(4 * 1024 * 1024));
        bus.add_device(config);
        let arena = bus.arena();
        let (_, device) = bus.attach_all().pop().unwrap();
        (arena, device.unwrap())
    }

    fn buffer(arena: &mut SharedArena, len: u32) -> SegmentList {
        let handle = arena.alloc_zeroed(len, 0x1000).unwrap();
        let mut list = SegmentList::new();
        list.push(Segment::new(handle.vaddr, len)).unwrap();
        list
    }

    #[test]
    fn oversized_mdts_falls_back_to_the_default_cap() {
        let (_arena, device) = attach(DeviceConfig {
            mdts: u8::MAX,
            ..DeviceConfig::default()
        });
        assert_eq!(device.max_transfer_bytes(), UNLIMITED_MAX_TRANSFER);
    }

    #[test]
    fn failed_queue_write_unwinds_the_request() {
        let (mut arena, mut device) = attach(DeviceConfig::default());
        // Three pages: PRP2 needs a list page.
        let list = buffer(&mut arena, 0x3000);
        let before = arena.live_allocations();

        let real_sq = device.sq_mem;
        device.sq_mem = DmaHandle {
            vaddr: ARENA_VIRT_BASE + (1 << 40),
            len: real_sq.len,
        };
        let called = Rc::new(Cell::new(false));
        let flag = called.clone();
        let err = device.submit_writev(
            1,
            0,
            24,
            Box::new(move |_: &IoCompletion| flag.set(true)),
            &mut SegmentCursor::new(&list, &arena),
        );
        assert_eq!(err, Err(SubmitError::QueueWrite));
        assert_eq!(device.outstanding_commands(), 0);
        assert!(device.parents.is_empty());
        assert_eq!(device.sq_tail, 0);
        assert_eq!(arena.live_allocations(), before);

        // The queue is still usable once the memory is back.
        device.sq_mem = real_sq;
        let done = Rc::new(Cell::new(None));
        let sink = done.clone();
        device
            .submit_writev(
                1,
                0,
                24,
                Box::new(move |cpl: &IoCompletion| sink.set(Some(*cpl))),
                &mut SegmentCursor::new(&list, &arena),
            )
            .unwrap();
        assert_eq!(device.process_completions(0), 1);
        assert_eq!(done.get(), Some(IoCompletion::SUCCESS));
        assert!(!called.get());
    }

    #[test]
    fn fatal_controller_refuses_further_submissions() {
        let (mut arena, mut device) = attach(DeviceConfig::default());
        let list = buffer(&mut arena, 0x1000);

        // Re-create the submission queue over memory the controller cannot reach.
        let cq_phys = arena.with(|a| a.phys_addr(device.cq_mem));
        let size = device.queue_size;
        device.ctrl.delete_io_queues();
        assert!(device.ctrl.create_io_cq(IO_QID, cq_phys, size).is_success());
        assert!(device
            .ctrl
            .create_io_sq(IO_QID, 1 << 40, size, IO_QID)
            .is_success());

        device
            .submit_writev(
                1,
                0,
                8,
                Box::new(|_: &IoCompletion| {}),
                &mut SegmentCursor::new(&list, &arena),
            )
            .unwrap();
        assert!(device.ctrl.is_fatal());

        assert_eq!(
            device.submit_writev(
                1,
                0,
                8,
                Box::new(|_: &IoCompletion| {}),
                &mut SegmentCursor::new(&list, &arena),
            ),
            Err(SubmitError::ControllerFatal)
        );
    }
}
