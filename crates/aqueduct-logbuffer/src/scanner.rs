use aqueduct_utils::align;

use crate::frame::{self, FRAME_ALIGNMENT, HEADER_LENGTH};

/// Result of a send-path scan: `available` bytes of contiguous committed
/// frames to put on the wire (padding contributes only its header) and
/// `padding` bytes to additionally advance the sender position by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub available: usize,
    pub padding: usize,
}

/// Scans the term from `offset` for up to `max_length` bytes of contiguous
/// committed frames. Stops at the first uncommitted frame (zero length) and
/// after a padding frame, which terminates a datagram.
pub fn scan_for_availability(
    term_ptr: *mut u8,
    offset: usize,
    max_length: usize,
    term_length: usize,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    loop {
        let frame_offset = offset + outcome.available;
        if frame_offset >= term_length {
            break;
        }

        let frame_length = frame::frame_length_volatile(term_ptr, frame_offset);
        if frame_length <= 0 {
            break;
        }

        let mut aligned_length = align(frame_length as usize, FRAME_ALIGNMENT);
        if frame::is_padding_frame(term_ptr.cast_const(), frame_offset) {
            outcome.padding = aligned_length - HEADER_LENGTH;
            aligned_length = HEADER_LENGTH;
        }

        if outcome.available + aligned_length > max_length {
            outcome.padding = 0;
            break;
        }
        outcome.available += aligned_length;

        if outcome.padding != 0 || outcome.available >= max_length {
            break;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use super::*;
    use crate::{
        appender::TermAppender,
        frame::HeaderWriter,
    };

    const TERM_LENGTH: usize = 4096;

    fn filled_term(frames: &[usize]) -> (Vec<u8>, AtomicI64) {
        let mut term = vec![0u8; TERM_LENGTH];
        let raw_tail = AtomicI64::new(0);
        let header = HeaderWriter::new(1, 2);
        {
            let appender = TermAppender::new(term.as_mut_ptr(), TERM_LENGTH, &raw_tail);
            for len in frames {
                let r = appender.append_unfragmented(&header, &vec![9u8; *len], 0);
                assert!(r >= 0);
            }
        }
        (term, raw_tail)
    }

    #[test]
    fn scans_contiguous_frames() {
        let (mut term, _tail) = filled_term(&[10, 20, 30]);
        let outcome = scan_for_availability(term.as_mut_ptr(), 0, TERM_LENGTH, TERM_LENGTH);
        // 42 -> 64, 52 -> 64, 62 -> 64
        assert_eq!(outcome, ScanOutcome { available: 192, padding: 0 });
    }

    #[test]
    fn stops_at_uncommitted() {
        let (mut term, _tail) = filled_term(&[10]);
        let outcome = scan_for_availability(term.as_mut_ptr(), 0, TERM_LENGTH, TERM_LENGTH);
        assert_eq!(outcome.available, 64);
    }

    #[test]
    fn respects_max_length() {
        let (mut term, _tail) = filled_term(&[10, 20, 30]);
        let outcome = scan_for_availability(term.as_mut_ptr(), 0, 130, TERM_LENGTH);
        assert_eq!(outcome, ScanOutcome { available: 128, padding: 0 });
    }

    #[test]
    fn padding_sends_header_only() {
        let mut term = vec![0u8; TERM_LENGTH];
        let raw_tail = AtomicI64::new(TERM_LENGTH as i64 - 64);
        let header = HeaderWriter::new(1, 2);
        {
            let appender = TermAppender::new(term.as_mut_ptr(), TERM_LENGTH, &raw_tail);
            // trips and writes a 64 byte padding frame at the end
            assert!(appender.append_unfragmented(&header, &vec![0u8; 100], 0) < 0);
        }
        let offset = TERM_LENGTH - 64;
        let outcome = scan_for_availability(term.as_mut_ptr(), offset, TERM_LENGTH, TERM_LENGTH);
        assert_eq!(outcome, ScanOutcome { available: HEADER_LENGTH, padding: 64 - HEADER_LENGTH });
    }

    #[test]
    fn empty_term() {
        let mut term = vec![0u8; TERM_LENGTH];
        let outcome = scan_for_availability(term.as_mut_ptr(), 0, 1408, TERM_LENGTH);
        assert_eq!(outcome, ScanOutcome::default());
    }
}
