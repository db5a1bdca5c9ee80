use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use nvme_sgl::{AddressTranslator, AllocError, DmaAllocator, DmaHandle, OffsetTranslator};
use thiserror::Error;

/// Bus address of the first arena byte.
pub const ARENA_PHYS_BASE: u64 = 0x10_0000;
/// Virtual address of the first arena byte.
///
/// Both bases are aligned well beyond any alignment the allocator accepts, so an address has the
/// same alignment in both spaces.
pub const ARENA_VIRT_BASE: u64 = 0x7f00_0000_0000;

const MAX_ALIGN: u32 = 1 << 20;

/// Errors returned when a DMA access falls outside the arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("physical access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Physical memory access used by the controller for DMA.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&mut self, paddr: u64, val: u64) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }
}

/// Fixed-size DMA memory with a first-fit allocator.
///
/// Free space is tracked as coalesced `offset -> len` ranges so repeated alloc/free cycles of the
/// same shapes land on the same addresses.
#[derive(Debug)]
pub struct DmaArena {
    bytes: Vec<u8>,
    free: BTreeMap<u64, u64>,
    live: HashMap<u64, u32>,
}

impl DmaArena {
    pub fn new(size: usize) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size as u64);
        }
        DmaArena {
            bytes: vec![0u8; size],
            free,
            live: HashMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn translator() -> OffsetTranslator {
        OffsetTranslator {
            virt_base: ARENA_VIRT_BASE,
            phys_base: ARENA_PHYS_BASE,
        }
    }

    /// Number of buffers currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn alloc_zeroed(&mut self, len: u32, align: u32) -> Result<DmaHandle, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }
        let align = align.max(1);
        if !align.is_power_of_two() || align > MAX_ALIGN {
            return Err(AllocError::InvalidAlignment(align));
        }

        let want = u64::from(len);
        let mask = u64::from(align) - 1;
        let slot = self.free.iter().find_map(|(&start, &free_len)| {
            let aligned = (start + mask) & !mask;
            let pad = aligned - start;
            (pad + want <= free_len).then_some((start, free_len, aligned))
        });
        let (start, free_len, aligned) = slot.ok_or(AllocError::OutOfMemory { len, align })?;

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let end = aligned + want;
        if start + free_len > end {
            self.free.insert(end, start + free_len - end);
        }
        self.live.insert(aligned, len);
        self.bytes[aligned as usize..end as usize].fill(0);

        Ok(DmaHandle {
            vaddr: ARENA_VIRT_BASE + aligned,
            len,
        })
    }

    pub fn free(&mut self, handle: DmaHandle) -> Result<(), AllocError> {
        let offset = self.live_offset(handle)?;
        self.live.remove(&offset);

        let mut start = offset;
        let mut len = u64::from(handle.len);
        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
        Ok(())
    }

    pub fn fill(&mut self, handle: DmaHandle, byte: u8) -> Result<(), AllocError> {
        let offset = self.live_offset(handle)? as usize;
        self.bytes[offset..offset + handle.len as usize].fill(byte);
        Ok(())
    }

    pub fn read(&self, handle: DmaHandle, out: &mut [u8]) -> Result<(), AllocError> {
        let offset = self.live_offset(handle)? as usize;
        if out.len() > handle.len as usize {
            return Err(AllocError::OutOfBounds {
                vaddr: handle.vaddr,
                len: handle.len,
            });
        }
        out.copy_from_slice(&self.bytes[offset..offset + out.len()]);
        Ok(())
    }

    pub fn phys_addr(&self, handle: DmaHandle) -> u64 {
        Self::translator().virt_to_phys(handle.vaddr)
    }

    fn live_offset(&self, handle: DmaHandle) -> Result<u64, AllocError> {
        let offset = handle.vaddr.wrapping_sub(ARENA_VIRT_BASE);
        match self.live.get(&offset) {
            Some(&len) if len == handle.len => Ok(offset),
            _ => Err(AllocError::UnknownBuffer {
                vaddr: handle.vaddr,
            }),
        }
    }

    fn phys_range(&self, paddr: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let oob = MemoryError::OutOfBounds { addr: paddr, len };
        let start = paddr.checked_sub(ARENA_PHYS_BASE).ok_or(oob.clone())?;
        let end = start.checked_add(len as u64).ok_or(oob.clone())?;
        if end > self.size() {
            return Err(oob);
        }
        Ok(start as usize..end as usize)
    }
}

impl MemoryBus for DmaArena {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.phys_range(paddr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let range = self.phys_range(paddr, buf.len())?;
        self.bytes[range].copy_from_slice(buf);
        Ok(())
    }
}

/// Cloneable handle to one [`DmaArena`], shared by the harness (as its allocator) and every
/// [`crate::SimDevice`] (as DMA target).
#[derive(Debug, Clone)]
pub struct SharedArena {
    inner: Rc<RefCell<DmaArena>>,
}

impl SharedArena {
    pub fn new(size: usize) -> Self {
        SharedArena {
            inner: Rc::new(RefCell::new(DmaArena::new(size))),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.borrow().live_allocations()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&DmaArena) -> R) -> R {
        f(&self.inner.borrow())
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut DmaArena) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

impl AddressTranslator for SharedArena {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        DmaArena::translator().virt_to_phys(vaddr)
    }
}

impl DmaAllocator for SharedArena {
    fn alloc_zeroed(&mut self, len: u32, align: u32) -> Result<DmaHandle, AllocError> {
        self.with_mut(|arena| arena.alloc_zeroed(len, align))
    }

    fn free(&mut self, handle: DmaHandle) -> Result<(), AllocError> {
        self.with_mut(|arena| arena.free(handle))
    }

    fn fill(&mut self, handle: DmaHandle, byte: u8) -> Result<(), AllocError> {
        self.with_mut(|arena| arena.fill(handle, byte))
    }

    fn read(&self, handle: DmaHandle, out: &mut [u8]) -> Result<(), AllocError> {
        self.with(|arena| arena.read(handle, out))
    }
}
