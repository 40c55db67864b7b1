use aqueduct_utils::align;

use crate::frame::{self, FRAME_ALIGNMENT, HEADER_LENGTH};

/// Receiver-side insert of one datagram's frames at `term_offset`. The body
/// is copied first; the first frame's length word commits last so a rebuild
/// scan never walks into a half-copied packet.
pub fn insert_packet(term_ptr: *mut u8, term_offset: usize, packet: &[u8]) {
    if packet.len() < HEADER_LENGTH {
        return;
    }
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&packet[0..4]);
    let first_length = i32::from_le_bytes(length_bytes);

    unsafe {
        std::ptr::copy_nonoverlapping(
            packet.as_ptr().add(4),
            term_ptr.add(term_offset + 4),
            packet.len() - 4,
        );
    }
    frame::frame_length_ordered(term_ptr, term_offset, first_length);
}

/// Scans `[rebuild_offset, hwm_offset)` for the first gap of uncommitted
/// bytes. Returns `(gap_offset, gap_length)` if one exists.
pub fn scan_for_gap(
    term_ptr: *mut u8,
    rebuild_offset: usize,
    hwm_offset: usize,
) -> Option<(usize, usize)> {
    let mut offset = rebuild_offset;

    while offset < hwm_offset {
        let frame_length = frame::frame_length_volatile(term_ptr, offset);
        if frame_length > 0 {
            offset += align(frame_length as usize, FRAME_ALIGNMENT);
            continue;
        }

        let gap_offset = offset;
        while offset < hwm_offset && frame::frame_length_volatile(term_ptr, offset) <= 0 {
            offset += FRAME_ALIGNMENT;
        }
        return Some((gap_offset, offset - gap_offset));
    }

    None
}

/// Advances a rebuild offset over contiguous committed frames, returning the
/// new offset.
pub fn contiguous_offset(term_ptr: *mut u8, mut offset: usize, term_length: usize) -> usize {
    while offset < term_length {
        let frame_length = frame::frame_length_volatile(term_ptr, offset);
        if frame_length <= 0 {
            break;
        }
        offset += align(frame_length as usize, FRAME_ALIGNMENT);
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{HeaderWriter, frame_length_volatile};

    const TERM_LENGTH: usize = 4096;

    fn packet(session: i32, stream: i32, term_id: i32, term_offset: usize, body: &[u8]) -> Vec<u8> {
        let writer = HeaderWriter::new(session, stream);
        let mut scratch = vec![0u8; HEADER_LENGTH + body.len()];
        writer.write(scratch.as_mut_ptr(), 0, term_id);
        unsafe {
            (scratch.as_mut_ptr().add(frame::TERM_OFFSET_OFFSET) as *mut i32)
                .write_unaligned(term_offset as i32);
        }
        scratch[HEADER_LENGTH..].copy_from_slice(body);
        let len = (HEADER_LENGTH + body.len()) as i32;
        scratch[0..4].copy_from_slice(&len.to_le_bytes());
        scratch
    }

    #[test]
    fn insert_then_rebuild_contiguous() {
        let mut term = vec![0u8; TERM_LENGTH];
        let p = packet(1, 2, 0, 0, &[5u8; 24]);
        insert_packet(term.as_mut_ptr(), 0, &p);

        assert_eq!(frame_length_volatile(term.as_mut_ptr(), 0), (HEADER_LENGTH + 24) as i32);
        assert_eq!(contiguous_offset(term.as_mut_ptr(), 0, TERM_LENGTH), 64);
        assert_eq!(&term[HEADER_LENGTH..HEADER_LENGTH + 24], &[5u8; 24]);
    }

    #[test]
    fn gap_detection() {
        let mut term = vec![0u8; TERM_LENGTH];
        insert_packet(term.as_mut_ptr(), 0, &packet(1, 2, 0, 0, &[1u8; 24]));
        // drop the frame at 64, deliver the one at 128
        insert_packet(term.as_mut_ptr(), 128, &packet(1, 2, 0, 128, &[3u8; 24]));

        assert_eq!(contiguous_offset(term.as_mut_ptr(), 0, TERM_LENGTH), 64);
        let gap = scan_for_gap(term.as_mut_ptr(), 64, 192).unwrap();
        assert_eq!(gap, (64, 64));
    }

    #[test]
    fn no_gap_when_contiguous() {
        let mut term = vec![0u8; TERM_LENGTH];
        insert_packet(term.as_mut_ptr(), 0, &packet(1, 2, 0, 0, &[1u8; 24]));
        insert_packet(term.as_mut_ptr(), 64, &packet(1, 2, 0, 64, &[2u8; 24]));
        assert!(scan_for_gap(term.as_mut_ptr(), 0, 128).is_none());
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut term = vec![0u8; TERM_LENGTH];
        let p = packet(1, 2, 0, 0, &[7u8; 24]);
        insert_packet(term.as_mut_ptr(), 0, &p);
        insert_packet(term.as_mut_ptr(), 0, &p);
        assert_eq!(contiguous_offset(term.as_mut_ptr(), 0, TERM_LENGTH), 64);
    }
}
