//! NVMe device model: one namespace, I/O queue pairs living in DMA memory, PRP data pointers.
//!
//! Supported:
//! - I/O submission/completion queues (created directly by the host driver; there is no admin
//!   queue, the driver reads identify data through [`NvmeController::identify_controller`] and
//!   [`NvmeController::identify_namespace`])
//! - NVM commands: READ, WRITE, FLUSH
//! - PRP1/PRP2 and chained PRP lists. SGL descriptors are rejected (PSDT != 0).
//!
//! Commands execute synchronously when the submission doorbell is written; the completion entry is
//! posted to the completion queue and stays there until the host reaps it.

use std::collections::HashMap;

use crate::{DiskBackend, MemoryBus, MemoryError, PAGE_SIZE};

pub(crate) const OPC_FLUSH: u8 = 0x00;
pub(crate) const OPC_WRITE: u8 = 0x01;
pub(crate) const OPC_READ: u8 = 0x02;

pub(crate) const SQE_SIZE: u64 = 64;
pub(crate) const CQE_SIZE: u64 = 16;

/// CAP.MQES + 1.
pub(crate) const MAX_QUEUE_ENTRIES: u16 = 1024;

const IDENTIFY_LEN: usize = 4096;

/// Transfer limit encoded by an Identify MDTS value (a power of two in units of the minimum page
/// size). `None` for 0 (no limit) and for exponents a `u64` cannot hold.
pub(crate) fn mdts_to_bytes(mdts: u8) -> Option<u64> {
    if mdts == 0 {
        return None;
    }
    1u64.checked_shl(PAGE_SIZE.trailing_zeros() + u32::from(mdts))
}

/// Misbehaviour the controller can be told to exhibit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Complete every WRITE with a data transfer error.
    pub fail_writes: bool,
    /// Complete every READ with a data transfer error.
    pub fail_reads: bool,
    /// Flip the first byte of every READ payload but report success.
    pub corrupt_reads: bool,
    /// Execute commands but never post their completion entries.
    pub drop_completions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0,
        dnr: false,
    };

    pub const INVALID_OPCODE: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0x1,
        dnr: true,
    };

    pub const INVALID_FIELD: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0x2,
        dnr: true,
    };

    pub const DATA_TRANSFER_ERROR: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0x4,
        dnr: false,
    };

    pub const INVALID_NS: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0xb,
        dnr: true,
    };

    pub const INVALID_QID: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0x1c,
        dnr: true,
    };

    pub const LBA_OUT_OF_RANGE: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0x80,
        dnr: true,
    };

    pub fn is_success(&self) -> bool {
        self.sct == 0 && self.sc == 0
    }

    fn encode_without_phase(self) -> u16 {
        let mut val: u16 = 0;
        val |= (self.sc as u16) << 1;
        val |= ((self.sct & 0x7) as u16) << 9;
        if self.dnr {
            val |= 1 << 14;
        }
        val
    }

    /// Decodes the CQE status field (phase tag ignored).
    pub fn decode(raw: u16) -> NvmeStatus {
        NvmeStatus {
            sc: ((raw >> 1) & 0xff) as u8,
            sct: ((raw >> 9) & 0x7) as u8,
            dnr: raw & (1 << 14) != 0,
        }
    }
}

fn le_u32(bytes: &[u8], off: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NvmeCommand {
    pub opc: u8,
    pub psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
}

impl NvmeCommand {
    /// READ/WRITE with a zero-based block count in CDW12.
    pub fn rw(opc: u8, cid: u16, nsid: u32, slba: u64, blocks: u32, prp1: u64, prp2: u64) -> Self {
        NvmeCommand {
            opc,
            psdt: 0,
            cid,
            nsid,
            prp1,
            prp2,
            cdw10: slba as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: (blocks - 1) & 0xffff,
        }
    }

    pub fn parse(bytes: &[u8; 64]) -> NvmeCommand {
        let dw0 = le_u32(bytes, 0);
        NvmeCommand {
            opc: (dw0 & 0xff) as u8,
            psdt: ((dw0 >> 14) & 0x3) as u8,
            cid: (dw0 >> 16) as u16,
            nsid: le_u32(bytes, 4),
            prp1: le_u64(bytes, 24),
            prp2: le_u64(bytes, 32),
            cdw10: le_u32(bytes, 40),
            cdw11: le_u32(bytes, 44),
            cdw12: le_u32(bytes, 48),
        }
    }

    pub fn to_bytes(self) -> [u8; 64] {
        let mut out = [0u8; 64];
        let dw0 = self.opc as u32 | ((self.psdt as u32 & 0x3) << 14) | (self.cid as u32) << 16;
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        out[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        out[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        out[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        out
    }

    fn slba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    fn blocks(&self) -> u64 {
        (self.cdw12 & 0xffff) as u64 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CqEntry {
    pub dw0: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
}

impl CqEntry {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        let dw2 = (self.sqid as u32) << 16 | self.sqhd as u32;
        out[8..12].copy_from_slice(&dw2.to_le_bytes());
        let dw3 = (self.status as u32) << 16 | self.cid as u32;
        out[12..16].copy_from_slice(&dw3.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> CqEntry {
        let dw2 = le_u32(bytes, 8);
        let dw3 = le_u32(bytes, 12);
        CqEntry {
            dw0: le_u32(bytes, 0),
            sqhd: (dw2 & 0xffff) as u16,
            sqid: (dw2 >> 16) as u16,
            cid: (dw3 & 0xffff) as u16,
            status: (dw3 >> 16) as u16,
        }
    }

    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }
}

#[derive(Debug)]
struct CompletionQueue {
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    phase: bool,
}

#[derive(Debug, Clone, Copy)]
struct SubmissionQueue {
    id: u16,
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    cqid: u16,
}

/// NVMe controller state machine.
pub struct NvmeController {
    disk: Box<dyn DiskBackend>,
    /// Identify MDTS: max transfer = 2^mdts pages, 0 = unlimited.
    mdts: u8,
    faults: FaultPlan,
    io_sqs: HashMap<u16, SubmissionQueue>,
    io_cqs: HashMap<u16, CompletionQueue>,
    fatal: bool,
}

impl NvmeController {
    pub fn new(disk: Box<dyn DiskBackend>, mdts: u8) -> Self {
        NvmeController {
            disk,
            mdts,
            faults: FaultPlan::default(),
            io_sqs: HashMap::new(),
            io_cqs: HashMap::new(),
            fatal: false,
        }
    }

    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
    }

    /// Set once a queue access hits unmapped memory (CSTS.CFS on real hardware).
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn max_transfer_bytes(&self) -> Option<u64> {
        mdts_to_bytes(self.mdts)
    }

    pub fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_LEN];

        // VID (u16) / SSVID (u16)
        data[0..2].copy_from_slice(&0x1d1du16.to_le_bytes());
        data[2..4].copy_from_slice(&0x1d1du16.to_le_bytes());

        write_ascii_padded(&mut data[4..24], "SGL00000000000000001");
        write_ascii_padded(&mut data[24..64], "Simulated NVMe Controller");
        write_ascii_padded(&mut data[64..72], "0.1");

        // MDTS at offset 77 (0x4d).
        data[77] = self.mdts;
        // NN (Number of Namespaces) at offset 516 (0x204).
        data[516..520].copy_from_slice(&1u32.to_le_bytes());

        data
    }

    pub fn identify_namespace(&self, nsid: u32) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_LEN];
        if nsid != 1 {
            return data;
        }

        let nsze = self.disk.capacity();
        data[0..8].copy_from_slice(&nsze.to_le_bytes()); // NSZE
        data[8..16].copy_from_slice(&nsze.to_le_bytes()); // NCAP
        data[16..24].copy_from_slice(&nsze.to_le_bytes()); // NUSE

        // FLBAS at offset 26 (0x1a): format 0, no metadata.
        data[26] = 0;
        // LBAF0 at offset 128 (0x80): MS=0, LBADS at byte 2.
        data[128 + 2] = self.disk.sector_size().trailing_zeros() as u8;

        data
    }

    pub fn create_io_cq(&mut self, qid: u16, base: u64, size: u16) -> NvmeStatus {
        if qid == 0 || size < 2 || size > MAX_QUEUE_ENTRIES {
            return NvmeStatus::INVALID_FIELD;
        }
        if base == 0 || base & (PAGE_SIZE as u64 - 1) != 0 {
            return NvmeStatus::INVALID_FIELD;
        }

        self.io_cqs.insert(
            qid,
            CompletionQueue {
                size,
                base,
                head: 0,
                tail: 0,
                phase: true,
            },
        );
        NvmeStatus::SUCCESS
    }

    pub fn create_io_sq(&mut self, qid: u16, base: u64, size: u16, cqid: u16) -> NvmeStatus {
        if qid == 0 || size < 2 || size > MAX_QUEUE_ENTRIES {
            return NvmeStatus::INVALID_FIELD;
        }
        if base == 0 || base & (PAGE_SIZE as u64 - 1) != 0 {
            return NvmeStatus::INVALID_FIELD;
        }
        if !self.io_cqs.contains_key(&cqid) {
            return NvmeStatus::INVALID_QID;
        }

        self.io_sqs.insert(
            qid,
            SubmissionQueue {
                id: qid,
                size,
                base,
                head: 0,
                tail: 0,
                cqid,
            },
        );
        NvmeStatus::SUCCESS
    }

    pub fn delete_io_queues(&mut self) {
        self.io_sqs.clear();
        self.io_cqs.clear();
    }

    pub fn ring_sq_doorbell(&mut self, qid: u16, tail: u16, memory: &mut dyn MemoryBus) {
        if self.fatal {
            return;
        }
        match self.io_sqs.get_mut(&qid) {
            Some(sq) if tail < sq.size => sq.tail = tail,
            _ => {
                tracing::warn!(qid, tail, "ignoring invalid submission doorbell write");
                return;
            }
        }
        if let Err(err) = self.process_queue_pair_io(qid, memory) {
            tracing::error!(qid, "controller fatal: {err}");
            self.fatal = true;
        }
    }

    pub fn ring_cq_doorbell(&mut self, qid: u16, head: u16) {
        match self.io_cqs.get_mut(&qid) {
            Some(cq) if head < cq.size => cq.head = head,
            _ => tracing::warn!(qid, head, "ignoring invalid completion doorbell write"),
        }
    }

    fn process_queue_pair_io(
        &mut self,
        qid: u16,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        loop {
            let Some(sq) = self.io_sqs.get(&qid).copied() else {
                return Ok(());
            };
            if sq.head == sq.tail {
                return Ok(());
            }

            let cmd = read_command(sq.base, sq.head, memory)?;
            let status = self.execute_io(cmd, memory);

            let sq = match self.io_sqs.get_mut(&qid) {
                Some(sq) => {
                    sq.head = sq.head.wrapping_add(1) % sq.size;
                    *sq
                }
                None => return Ok(()),
            };

            if self.faults.drop_completions {
                continue;
            }
            let Some(cq) = self.io_cqs.get_mut(&sq.cqid) else {
                return Ok(());
            };
            post_completion(cq, &sq, cmd.cid, status, memory)?;
        }
    }

    fn execute_io(&mut self, cmd: NvmeCommand, memory: &mut dyn MemoryBus) -> NvmeStatus {
        if cmd.psdt != 0 {
            return NvmeStatus::INVALID_FIELD;
        }

        tracing::trace!(
            opc = cmd.opc,
            cid = cmd.cid,
            slba = cmd.slba(),
            blocks = cmd.blocks(),
            "nvme io command"
        );

        match cmd.opc {
            OPC_FLUSH => self.cmd_flush(),
            OPC_WRITE => self.cmd_write(cmd, memory),
            OPC_READ => self.cmd_read(cmd, memory),
            _ => NvmeStatus::INVALID_OPCODE,
        }
    }

    /// Validates namespace, transfer size and LBA range; returns the byte length on success.
    fn check_rw(&self, cmd: &NvmeCommand) -> Result<usize, NvmeStatus> {
        if cmd.nsid != 1 {
            return Err(NvmeStatus::INVALID_NS);
        }
        let len = cmd.blocks() * self.disk.sector_size() as u64;
        if matches!(self.max_transfer_bytes(), Some(max) if len > max) {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        match cmd.slba().checked_add(cmd.blocks()) {
            Some(end) if end <= self.disk.capacity() => Ok(len as usize),
            _ => Err(NvmeStatus::LBA_OUT_OF_RANGE),
        }
    }

    fn cmd_read(&mut self, cmd: NvmeCommand, memory: &mut dyn MemoryBus) -> NvmeStatus {
        let len = match self.check_rw(&cmd) {
            Ok(len) => len,
            Err(status) => return status,
        };
        if self.faults.fail_reads {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }

        let mut data = vec![0u8; len];
        if self.disk.read_sectors(cmd.slba(), &mut data).is_err() {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }
        if self.faults.corrupt_reads {
            data[0] ^= 0xff;
        }

        dma_write_prp(memory, cmd.prp1, cmd.prp2, &data)
    }

    fn cmd_write(&mut self, cmd: NvmeCommand, memory: &mut dyn MemoryBus) -> NvmeStatus {
        let len = match self.check_rw(&cmd) {
            Ok(len) => len,
            Err(status) => return status,
        };
        if self.faults.fail_writes {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }

        let mut data = vec![0u8; len];
        let status = dma_read_prp(memory, cmd.prp1, cmd.prp2, &mut data);
        if !status.is_success() {
            return status;
        }

        match self.disk.write_sectors(cmd.slba(), &data) {
            Ok(()) => NvmeStatus::SUCCESS,
            Err(_) => NvmeStatus::DATA_TRANSFER_ERROR,
        }
    }

    fn cmd_flush(&mut self) -> NvmeStatus {
        match self.disk.flush() {
            Ok(()) => NvmeStatus::SUCCESS,
            Err(_) => NvmeStatus::DATA_TRANSFER_ERROR,
        }
    }
}

fn dma_write_prp(memory: &mut dyn MemoryBus, prp1: u64, prp2: u64, data: &[u8]) -> NvmeStatus {
    let segs = match prp_segments(memory, prp1, prp2, data.len()) {
        Ok(segs) => segs,
        Err(status) => return status,
    };
    let mut offset = 0usize;
    for (addr, len) in segs {
        if memory
            .write_physical(addr, &data[offset..offset + len])
            .is_err()
        {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }
        offset += len;
    }
    NvmeStatus::SUCCESS
}

fn dma_read_prp(memory: &dyn MemoryBus, prp1: u64, prp2: u64, data: &mut [u8]) -> NvmeStatus {
    let segs = match prp_segments(memory, prp1, prp2, data.len()) {
        Ok(segs) => segs,
        Err(status) => return status,
    };
    let mut offset = 0usize;
    for (addr, len) in segs {
        if memory
            .read_physical(addr, &mut data[offset..offset + len])
            .is_err()
        {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }
        offset += len;
    }
    NvmeStatus::SUCCESS
}

fn read_command(
    sq_base: u64,
    head: u16,
    memory: &dyn MemoryBus,
) -> Result<NvmeCommand, MemoryError> {
    let mut bytes = [0u8; 64];
    memory.read_physical(sq_base + head as u64 * SQE_SIZE, &mut bytes)?;
    Ok(NvmeCommand::parse(&bytes))
}

fn post_completion(
    cq: &mut CompletionQueue,
    sq: &SubmissionQueue,
    cid: u16,
    status: NvmeStatus,
    memory: &mut dyn MemoryBus,
) -> Result<(), MemoryError> {
    let next_tail = cq.tail.wrapping_add(1) % cq.size;
    if next_tail == cq.head {
        // The host sizes its queues so this cannot happen.
        tracing::warn!(cid, "completion queue full, dropping completion");
        return Ok(());
    }

    let entry = CqEntry {
        dw0: 0,
        sqhd: sq.head,
        sqid: sq.id,
        cid,
        status: status.encode_without_phase() | cq.phase as u16,
    };
    memory.write_physical(cq.base + cq.tail as u64 * CQE_SIZE, &entry.to_bytes())?;

    cq.tail = next_tail;
    if cq.tail == 0 {
        cq.phase = !cq.phase;
    }
    Ok(())
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

/// Walks PRP1/PRP2 (and PRP lists) into `(addr, len)` runs covering `len` bytes.
pub(crate) fn prp_segments(
    memory: &dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<Vec<(u64, usize)>, NvmeStatus> {
    if len == 0 {
        return Ok(Vec::new());
    }

    // PRP entries must be dword aligned.
    if prp1 == 0 || prp1 & 0x3 != 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }

    let page_mask = PAGE_SIZE as u64 - 1;
    let first_offset = (prp1 & page_mask) as usize;
    let first_len = (PAGE_SIZE - first_offset).min(len);

    let mut segs = vec![(prp1, first_len)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Ok(segs);
    }

    if prp2 == 0 || prp2 & page_mask != 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }

    if remaining <= PAGE_SIZE {
        segs.push((prp2, remaining));
        return Ok(segs);
    }

    let entries_per_list = PAGE_SIZE / 8;
    let mut list_addr = prp2;
    while remaining > 0 {
        let pages_needed = remaining.div_ceil(PAGE_SIZE);
        let max_pages_this_list = if pages_needed > entries_per_list {
            // Chained PRP list: last entry is a pointer to the next list.
            entries_per_list - 1
        } else {
            pages_needed
        };

        for entry_index in 0..max_pages_this_list {
            let page = memory
                .read_u64(list_addr + entry_index as u64 * 8)
                .map_err(|_| NvmeStatus::INVALID_FIELD)?;
            if page == 0 || page & page_mask != 0 {
                return Err(NvmeStatus::INVALID_FIELD);
            }

            let chunk = remaining.min(PAGE_SIZE);
            segs.push((page, chunk));
            remaining -= chunk;
        }

        if remaining == 0 {
            break;
        }

        let chain_ptr_addr = list_addr + (entries_per_list as u64 - 1) * 8;
        list_addr = match memory.read_u64(chain_ptr_addr) {
            Ok(next) if next != 0 && next & page_mask == 0 => next,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };
    }

    Ok(segs)
}
