use nvme_sgl::{AllocError, DmaAllocator, DmaHandle, Segment, SegmentCursor, SegmentList, SglError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Sgl(#[from] SglError),
}

/// First byte that differs from the expected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub segment: usize,
    pub offset: usize,
    pub found: u8,
}

/// Segment list of one request together with the DMA buffers backing it.
///
/// Owns every buffer it hands out (segments and scratch allocations alike) and returns them to the
/// allocator on drop, whichever way the round trip ends.
pub struct RequestBuffers<'a> {
    alloc: &'a mut dyn DmaAllocator,
    segments: SegmentList,
    handles: Vec<DmaHandle>,
    scratch: Vec<DmaHandle>,
}

impl<'a> RequestBuffers<'a> {
    pub fn new(alloc: &'a mut dyn DmaAllocator) -> Self {
        RequestBuffers {
            alloc,
            segments: SegmentList::new(),
            handles: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Allocates a zeroed buffer and appends it as the next segment.
    pub fn push_new(&mut self, len: u32, align: u32) -> Result<DmaHandle, ShapeError> {
        let handle = self.alloc.alloc_zeroed(len, align)?;
        self.push_handle(handle)?;
        Ok(handle)
    }

    /// Allocates a buffer that is not (yet) part of the request.
    pub fn alloc_scratch(&mut self, len: u32, align: u32) -> Result<DmaHandle, ShapeError> {
        let handle = self.alloc.alloc_zeroed(len, align)?;
        self.scratch.push(handle);
        Ok(handle)
    }

    /// Moves a scratch buffer into the request as the next segment.
    pub fn promote(&mut self, handle: DmaHandle) -> Result<(), ShapeError> {
        let Some(pos) = self.scratch.iter().position(|&h| h == handle) else {
            return Err(AllocError::UnknownBuffer {
                vaddr: handle.vaddr,
            }
            .into());
        };
        self.scratch.swap_remove(pos);
        self.push_handle(handle)
    }

    /// Frees every scratch buffer still held.
    pub fn release_scratch(&mut self) {
        for handle in std::mem::take(&mut self.scratch) {
            self.free_quietly(handle);
        }
    }

    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    pub fn total_len(&self) -> u32 {
        self.segments.total_len()
    }

    /// A cursor over the segments, translating through the allocator.
    pub fn cursor(&self) -> SegmentCursor<'_, dyn DmaAllocator + 'a> {
        SegmentCursor::new(&self.segments, &*self.alloc)
    }

    pub fn fill(&mut self, byte: u8) -> Result<(), AllocError> {
        for &handle in &self.handles {
            self.alloc.fill(handle, byte)?;
        }
        Ok(())
    }

    pub fn find_mismatch(&self, expected: u8) -> Result<Option<Mismatch>, AllocError> {
        let mut buf = Vec::new();
        for (segment, &handle) in self.handles.iter().enumerate() {
            buf.resize(handle.len as usize, 0);
            self.alloc.read(handle, &mut buf)?;
            if let Some(offset) = buf.iter().position(|&b| b != expected) {
                return Ok(Some(Mismatch {
                    segment,
                    offset,
                    found: buf[offset],
                }));
            }
        }
        Ok(None)
    }

    fn push_handle(&mut self, handle: DmaHandle) -> Result<(), ShapeError> {
        if let Err(err) = self.segments.push(Segment::new(handle.vaddr, handle.len)) {
            self.free_quietly(handle);
            return Err(err.into());
        }
        self.handles.push(handle);
        Ok(())
    }

    fn free_quietly(&mut self, handle: DmaHandle) {
        if let Err(err) = self.alloc.free(handle) {
            tracing::warn!("failed to free request buffer: {err}");
        }
    }
}

impl Drop for RequestBuffers<'_> {
    fn drop(&mut self) {
        self.release_scratch();
        for handle in std::mem::take(&mut self.handles) {
            self.free_quietly(handle);
        }
    }
}
