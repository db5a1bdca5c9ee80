use crate::SglError;

/// Maximum number of segments a single vectored request may carry.
pub const MAX_SEGMENTS: usize = 128;

/// One contiguous memory region of a request.
///
/// `base` is the virtual handle returned by the allocator. It is translated to a bus address only
/// when the cursor hands the span to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub len: u32,
}

impl Segment {
    pub fn new(base: u64, len: u32) -> Self {
        Segment { base, len }
    }
}

/// Ordered segment list with a hard capacity of [`MAX_SEGMENTS`].
///
/// Pushing past capacity is an error; the list is never silently truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentList {
    segments: Vec<Segment>,
    total_len: u32,
}

impl SegmentList {
    pub fn new() -> Self {
        SegmentList {
            segments: Vec::with_capacity(MAX_SEGMENTS),
            total_len: 0,
        }
    }

    pub fn from_segments<I>(segments: I) -> Result<Self, SglError>
    where
        I: IntoIterator<Item = Segment>,
    {
        let mut list = SegmentList::new();
        for seg in segments {
            list.push(seg)?;
        }
        Ok(list)
    }

    pub fn push(&mut self, seg: Segment) -> Result<(), SglError> {
        if self.segments.len() >= MAX_SEGMENTS {
            return Err(SglError::CapacityExceeded {
                capacity: MAX_SEGMENTS,
            });
        }
        // A zero-length span is the cursor's end-of-list marker.
        if seg.len == 0 {
            return Err(SglError::EmptySegment {
                index: self.segments.len(),
            });
        }
        let total_len = self
            .total_len
            .checked_add(seg.len)
            .ok_or(SglError::LengthOverflow)?;

        self.segments.push(seg);
        self.total_len = total_len;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of all segment lengths in bytes.
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }
}

impl<'a> IntoIterator for &'a SegmentList {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_tracks_total_length() {
        let list = SegmentList::from_segments([
            Segment::new(0x1000, 0x800),
            Segment::new(0x4000, 0x1000),
            Segment::new(0x8000, 0x3000),
        ])
        .unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.total_len(), 0x4800);
    }

    #[test]
    fn push_past_capacity_is_rejected() {
        let mut list = SegmentList::new();
        for i in 0..MAX_SEGMENTS as u64 {
            list.push(Segment::new(i * 0x1000, 0x200)).unwrap();
        }
        let err = list.push(Segment::new(0xdead_0000, 0x200)).unwrap_err();
        assert_eq!(
            err,
            SglError::CapacityExceeded {
                capacity: MAX_SEGMENTS
            }
        );
        assert_eq!(list.len(), MAX_SEGMENTS);
        assert_eq!(list.total_len(), MAX_SEGMENTS as u32 * 0x200);
    }

    #[test]
    fn zero_length_segment_is_rejected() {
        let mut list = SegmentList::new();
        list.push(Segment::new(0x1000, 0x200)).unwrap();
        assert_eq!(
            list.push(Segment::new(0x2000, 0)),
            Err(SglError::EmptySegment { index: 1 })
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn total_length_overflow_is_rejected() {
        let mut list = SegmentList::new();
        list.push(Segment::new(0, u32::MAX)).unwrap();
        assert_eq!(
            list.push(Segment::new(0, 1)),
            Err(SglError::LengthOverflow)
        );
    }
}
