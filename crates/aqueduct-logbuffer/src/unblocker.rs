use crate::frame::{self, FRAME_ALIGNMENT, HeaderWriter};

/// Rewrites a stalled claim at `blocked_offset` as a committed padding frame
/// so the send path can advance past a producer that died mid-append.
///
/// Pads up to the next committed frame, or to `tail_offset` when nothing
/// beyond has committed. Idempotent: once the spot holds a committed frame,
/// further calls are no-ops.
pub fn unblock_term(
    term_ptr: *mut u8,
    header: &HeaderWriter,
    term_id: i32,
    blocked_offset: usize,
    tail_offset: usize,
) -> bool {
    if blocked_offset >= tail_offset {
        return false;
    }
    if frame::frame_length_volatile(term_ptr, blocked_offset) != 0 {
        return false;
    }

    let mut pad_to = blocked_offset + FRAME_ALIGNMENT;
    while pad_to < tail_offset {
        if frame::frame_length_volatile(term_ptr, pad_to) != 0 {
            break;
        }
        pad_to += FRAME_ALIGNMENT;
    }

    header.write_padding(term_ptr, blocked_offset, term_id);
    frame::frame_length_ordered(term_ptr, blocked_offset, (pad_to - blocked_offset) as i32);
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use super::*;
    use crate::{
        appender::TermAppender,
        frame::{frame_length_volatile, is_padding_frame},
        scanner::scan_for_availability,
    };

    const TERM_LENGTH: usize = 4096;

    #[test]
    fn unblocks_stalled_claim() {
        let mut term = vec![0u8; TERM_LENGTH];
        let raw_tail = AtomicI64::new(0);
        let header = HeaderWriter::new(1, 2);

        {
            let appender = TermAppender::new(term.as_mut_ptr(), TERM_LENGTH, &raw_tail);
            // producer claims 64 bytes and dies before committing
            let (_, claim) = appender.claim(&header, 32);
            std::mem::forget(claim.unwrap());
            // a later producer commits behind the stalled claim
            assert!(appender.append_unfragmented(&header, &[1u8; 24], 0) >= 0);
        }

        let ptr = term.as_mut_ptr();
        assert_eq!(scan_for_availability(ptr, 0, TERM_LENGTH, TERM_LENGTH).available, 0);

        assert!(unblock_term(ptr, &header, 0, 0, 128));
        assert!(is_padding_frame(ptr, 0));
        assert_eq!(frame_length_volatile(ptr, 0), 64);

        // applied twice to the same stalled position is a no-op
        assert!(!unblock_term(ptr, &header, 0, 0, 128));

        // the send path can now advance over padding and the committed frame
        let outcome = scan_for_availability(ptr, 0, TERM_LENGTH, TERM_LENGTH);
        assert_eq!(outcome.available + outcome.padding, 64);
    }

    #[test]
    fn pads_to_tail_when_nothing_committed_beyond() {
        let mut term = vec![0u8; TERM_LENGTH];
        let header = HeaderWriter::new(1, 2);
        assert!(unblock_term(term.as_mut_ptr(), &header, 5, 64, 256));
        assert_eq!(frame_length_volatile(term.as_mut_ptr(), 64), 192);
    }

    #[test]
    fn no_action_when_not_blocked() {
        let mut term = vec![0u8; TERM_LENGTH];
        let header = HeaderWriter::new(1, 2);
        assert!(!unblock_term(term.as_mut_ptr(), &header, 0, 64, 64));
    }
}
