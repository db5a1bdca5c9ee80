use nvme_sgl::{SgCursor, SubmitError};

use crate::PAGE_SIZE;

/// Pulls spans out of `cursor` until `len` bytes are covered and returns one PRP entry per page.
///
/// The cursor must already be positioned (via `reset`) at `offset`, the command's byte offset
/// within the whole transfer; it is only used for error reporting. PRP rules for the spans:
/// the first may start anywhere dword-aligned, every later one must start on a page boundary and
/// every span but the last must end on one. A span longer than the remaining length is used only
/// up to that length.
pub fn collect_prp_entries(
    cursor: &mut dyn SgCursor,
    len: u64,
    offset: u64,
) -> Result<Vec<u64>, SubmitError> {
    let page_size = PAGE_SIZE as u64;
    let page_mask = page_size - 1;

    let mut entries = Vec::with_capacity(len.div_ceil(page_size) as usize + 1);
    let mut remaining = len;
    let mut consumed = 0u64;

    while remaining > 0 {
        let span = cursor.next_span();
        if span.is_end() {
            return Err(SubmitError::SglTooShort { missing: remaining });
        }

        let at = offset + consumed;
        if span.addr & 0x3 != 0 {
            return Err(SubmitError::InvalidSgl {
                offset: at,
                reason: "span address is not dword aligned",
            });
        }
        if consumed != 0 && span.addr & page_mask != 0 {
            return Err(SubmitError::InvalidSgl {
                offset: at,
                reason: "span after the first does not start on a page boundary",
            });
        }

        let used = u64::from(span.len).min(remaining);
        let end = span.addr + used;
        let mut addr = span.addr;
        while addr < end {
            entries.push(addr);
            addr = (addr & !page_mask) + page_size;
        }

        remaining -= used;
        consumed += used;
        if remaining > 0 && end & page_mask != 0 {
            return Err(SubmitError::InvalidSgl {
                offset: at,
                reason: "span before the last does not end on a page boundary",
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvme_sgl::{IdentityTranslator, Segment, SegmentCursor, SegmentList};

    fn list(segments: &[(u64, u32)]) -> SegmentList {
        SegmentList::from_segments(segments.iter().map(|&(base, len)| Segment::new(base, len)))
            .unwrap()
    }

    #[test]
    fn misaligned_first_segment_becomes_prp1_offset() {
        let sgl = list(&[(0x10_0800, 0x800), (0x20_0000, 0x1000), (0x30_0000, 0x3000)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0);

        let entries = collect_prp_entries(&mut cursor, 0x4800, 0).unwrap();
        assert_eq!(
            entries,
            vec![0x10_0800, 0x20_0000, 0x30_0000, 0x30_1000, 0x30_2000]
        );
    }

    #[test]
    fn resumed_command_starts_inside_a_segment() {
        // 4 KiB + 2 x 8 KiB; a command starting at 8 KiB lands in the middle of segment 1.
        let sgl = list(&[(0x1_0000, 0x1000), (0x2_0000, 0x2000), (0x3_0000, 0x2000)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0x2000);

        let entries = collect_prp_entries(&mut cursor, 0x3000, 0x2000).unwrap();
        assert_eq!(entries, vec![0x2_1000, 0x3_0000, 0x3_1000]);
    }

    #[test]
    fn command_shorter_than_span_stops_mid_span() {
        let sgl = list(&[(0x4_0000, 0x4_0000)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0);

        let entries = collect_prp_entries(&mut cursor, 0x2000, 0).unwrap();
        assert_eq!(entries, vec![0x4_0000, 0x4_1000]);
    }

    #[test]
    fn gap_inside_a_page_is_rejected() {
        // Second span starts mid-page.
        let sgl = list(&[(0x1_0000, 0x1000), (0x2_0200, 0x200)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0);
        assert_eq!(
            collect_prp_entries(&mut cursor, 0x1200, 0),
            Err(SubmitError::InvalidSgl {
                offset: 0x1000,
                reason: "span after the first does not start on a page boundary",
            })
        );

        // First span ends mid-page but more data follows.
        let sgl = list(&[(0x1_0000, 0x800), (0x2_0000, 0x1000)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0);
        assert!(matches!(
            collect_prp_entries(&mut cursor, 0x1800, 0),
            Err(SubmitError::InvalidSgl { offset: 0, .. })
        ));
    }

    #[test]
    fn short_list_is_reported() {
        let sgl = list(&[(0x1_0000, 0x1000)]);
        let mut cursor = SegmentCursor::new(&sgl, &IdentityTranslator);
        cursor.reset(0);
        assert_eq!(
            collect_prp_entries(&mut cursor, 0x3000, 0),
            Err(SubmitError::SglTooShort { missing: 0x2000 })
        );
    }
}
