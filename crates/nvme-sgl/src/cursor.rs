use crate::{AddressTranslator, SegmentList};

/// One physically-contiguous piece of a transfer, as consumed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysSpan {
    pub addr: u64,
    pub len: u32,
}

impl PhysSpan {
    /// Returned once the cursor has walked past the last segment.
    pub const END: PhysSpan = PhysSpan { addr: 0, len: 0 };

    pub fn is_end(&self) -> bool {
        self.len == 0
    }
}

/// Restartable scatter-gather iterator with seek.
///
/// The driver calls [`SgCursor::reset`] at the start of every command it builds (with the byte
/// offset of that command within the whole transfer) and then [`SgCursor::next_span`] once per
/// descriptor until it has covered the command's length.
pub trait SgCursor {
    fn reset(&mut self, offset: u32);
    fn next_span(&mut self) -> PhysSpan;
}

/// [`SgCursor`] over a borrowed [`SegmentList`].
///
/// After `reset(offset)`, `index` is the segment containing `offset` and `bytes_left` is the
/// distance from `offset` to that segment's end. The first `next_span` after a reset emits that
/// suffix, every later call emits a whole segment. A freshly constructed cursor behaves as if
/// `reset(0)` had been called.
#[derive(Debug)]
pub struct SegmentCursor<'a, T: ?Sized> {
    segments: &'a SegmentList,
    translator: &'a T,
    index: usize,
    bytes_left: u32,
}

impl<'a, T: AddressTranslator + ?Sized> SegmentCursor<'a, T> {
    pub fn new(segments: &'a SegmentList, translator: &'a T) -> Self {
        SegmentCursor {
            segments,
            translator,
            index: 0,
            bytes_left: 0,
        }
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn bytes_left(&self) -> u32 {
        self.bytes_left
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.segments.len()
    }
}

impl<T: AddressTranslator + ?Sized> SgCursor for SegmentCursor<'_, T> {
    fn reset(&mut self, offset: u32) {
        let mut end: u64 = 0;
        self.index = self.segments.len();
        self.bytes_left = 0;

        for (i, seg) in self.segments.iter().enumerate() {
            end += u64::from(seg.len);
            if end > u64::from(offset) {
                self.index = i;
                // end - offset <= seg.len, so it fits.
                self.bytes_left = (end - u64::from(offset)) as u32;
                break;
            }
        }

        tracing::trace!(
            offset,
            index = self.index,
            bytes_left = self.bytes_left,
            "sgl cursor reset"
        );
    }

    fn next_span(&mut self) -> PhysSpan {
        let Some(seg) = self.segments.get(self.index) else {
            return PhysSpan::END;
        };

        let span = if self.bytes_left != 0 {
            let skip = seg.len - self.bytes_left;
            let span = PhysSpan {
                addr: self.translator.virt_to_phys(seg.base + u64::from(skip)),
                len: self.bytes_left,
            };
            self.bytes_left = 0;
            span
        } else {
            PhysSpan {
                addr: self.translator.virt_to_phys(seg.base),
                len: seg.len,
            }
        };

        self.index += 1;
        span
    }
}
