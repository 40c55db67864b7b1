use std::sync::atomic::{AtomicI64, Ordering};

use aqueduct_utils::align;

use crate::frame::{self, FRAME_ALIGNMENT, HEADER_LENGTH, HeaderWriter};

/// Packed `(term_id, resulting_offset)` on success, or one of the sentinels.
pub type AppendResult = i64;

pub const TRIPPED: AppendResult = -1;
pub const FAILED: AppendResult = -2;

#[inline]
pub const fn pack_result(term_id: i32, resulting_offset: i64) -> AppendResult {
    ((term_id as i64) << 32) | resulting_offset
}

#[inline]
pub const fn result_term_offset(result: AppendResult) -> i64 {
    result & 0xffff_ffff
}

#[inline]
pub const fn result_term_id(result: AppendResult) -> i32 {
    (result >> 32) as i32
}

/// Zero-copy write reservation returned by [`TermAppender::claim`]. The
/// caller fills `data_mut` then commits; an abort turns the reservation into
/// committed padding so consumers skip it.
pub struct BufferClaim {
    frame_ptr: *mut u8,
    frame_length: usize,
}

impl BufferClaim {
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.frame_ptr.add(HEADER_LENGTH),
                self.frame_length - HEADER_LENGTH,
            )
        }
    }

    pub fn commit(self) {
        frame::frame_length_ordered(self.frame_ptr, 0, self.frame_length as i32);
    }

    pub fn abort(self) {
        unsafe {
            (self.frame_ptr.add(frame::TYPE_OFFSET) as *mut u16)
                .write_unaligned(frame::HDR_TYPE_PAD);
        }
        frame::frame_length_ordered(self.frame_ptr, 0, self.frame_length as i32);
    }
}

/// Producer-side framing engine over one term partition. Concurrent
/// producers serialize only through the fetch-and-add on the partition's raw
/// tail; frame visibility is published by the final release store of the
/// frame length.
pub struct TermAppender<'a> {
    term_ptr: *mut u8,
    term_length: usize,
    raw_tail: &'a AtomicI64,
}

unsafe impl Send for TermAppender<'_> {}
unsafe impl Sync for TermAppender<'_> {}

impl<'a> TermAppender<'a> {
    pub fn new(term_ptr: *mut u8, term_length: usize, raw_tail: &'a AtomicI64) -> Self {
        Self { term_ptr, term_length, raw_tail }
    }

    #[inline]
    fn get_and_add_raw_tail(&self, aligned_length: usize) -> i64 {
        self.raw_tail.fetch_add(aligned_length as i64, Ordering::AcqRel)
    }

    /// Appends `msg` behind a fully written header. Returns the packed
    /// `(term_id, resulting_offset)` or `TRIPPED`/`FAILED` at end of log.
    pub fn append_unfragmented(
        &self,
        header: &HeaderWriter,
        msg: &[u8],
        reserved_value: i64,
    ) -> AppendResult {
        let frame_length = msg.len() + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);

        let raw_tail = self.get_and_add_raw_tail(aligned_length);
        let term_id = (raw_tail >> 32) as i32;
        let term_offset = raw_tail & 0xffff_ffff;

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term_length as i64 {
            return self.handle_end_of_log(header, term_offset, term_id);
        }

        let offset = term_offset as usize;
        header.write(self.term_ptr, offset, term_id);
        unsafe {
            (self.term_ptr.add(offset + frame::RESERVED_VALUE_OFFSET) as *mut i64)
                .write_unaligned(reserved_value);
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.term_ptr.add(offset + HEADER_LENGTH),
                msg.len(),
            );
        }
        frame::frame_length_ordered(self.term_ptr, offset, frame_length as i32);

        pack_result(term_id, resulting_offset)
    }

    /// Reserves space for a zero-copy write. On success the result packs the
    /// resulting offset and `claim` holds the reservation.
    pub fn claim(
        &self,
        header: &HeaderWriter,
        length: usize,
    ) -> (AppendResult, Option<BufferClaim>) {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);

        let raw_tail = self.get_and_add_raw_tail(aligned_length);
        let term_id = (raw_tail >> 32) as i32;
        let term_offset = raw_tail & 0xffff_ffff;

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term_length as i64 {
            return (self.handle_end_of_log(header, term_offset, term_id), None);
        }

        let offset = term_offset as usize;
        header.write(self.term_ptr, offset, term_id);
        let claim =
            BufferClaim { frame_ptr: unsafe { self.term_ptr.add(offset) }, frame_length };

        (pack_result(term_id, resulting_offset), Some(claim))
    }

    fn handle_end_of_log(
        &self,
        header: &HeaderWriter,
        term_offset: i64,
        term_id: i32,
    ) -> AppendResult {
        if term_offset > self.term_length as i64 {
            // someone else already tripped this partition
            return FAILED;
        }

        if term_offset < self.term_length as i64 {
            let offset = term_offset as usize;
            let padding_length = self.term_length - offset;
            header.write_padding(self.term_ptr, offset, term_id);
            frame::frame_length_ordered(self.term_ptr, offset, padding_length as i32);
        }

        TRIPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{frame_length_volatile, is_padding_frame};

    const TERM_LENGTH: usize = 4096;

    struct Fixture {
        term: Vec<u8>,
        raw_tail: AtomicI64,
    }

    impl Fixture {
        fn new(term_id: i32) -> Self {
            Self { term: vec![0u8; TERM_LENGTH], raw_tail: AtomicI64::new((term_id as i64) << 32) }
        }

        fn appender(&mut self) -> TermAppender<'_> {
            TermAppender::new(self.term.as_mut_ptr(), TERM_LENGTH, &self.raw_tail)
        }
    }

    #[test]
    fn append_commits_frame() {
        let mut fx = Fixture::new(3);
        let header = HeaderWriter::new(1, 2);

        let result = fx.appender().append_unfragmented(&header, b"payload", 0);
        assert_eq!(result_term_id(result), 3);
        assert_eq!(result_term_offset(result), FRAME_ALIGNMENT as i64);

        let ptr = fx.term.as_mut_ptr();
        assert_eq!(frame_length_volatile(ptr, 0), (HEADER_LENGTH + 7) as i32);
        assert!(!is_padding_frame(ptr, 0));
        assert_eq!(&fx.term[HEADER_LENGTH..HEADER_LENGTH + 7], b"payload");
    }

    #[test]
    fn appends_are_contiguous() {
        let mut fx = Fixture::new(0);
        let header = HeaderWriter::new(1, 2);
        let appender = fx.appender();

        let a = appender.append_unfragmented(&header, &[1u8; 10], 0);
        let b = appender.append_unfragmented(&header, &[2u8; 40], 0);
        assert_eq!(result_term_offset(a), 64);
        assert_eq!(result_term_offset(b), 64 + 96);
    }

    #[test]
    fn trips_at_end_of_log_with_padding() {
        let mut fx = Fixture::new(9);
        fx.raw_tail = AtomicI64::new(((9i64) << 32) | (TERM_LENGTH as i64 - 64));
        let header = HeaderWriter::new(1, 2);

        let result = fx.appender().append_unfragmented(&header, &[0u8; 100], 0);
        assert_eq!(result, TRIPPED);

        let ptr = fx.term.as_mut_ptr();
        let pad_offset = TERM_LENGTH - 64;
        assert!(is_padding_frame(ptr, pad_offset));
        assert_eq!(frame_length_volatile(ptr, pad_offset), 64);
    }

    #[test]
    fn fails_after_trip() {
        let mut fx = Fixture::new(9);
        fx.raw_tail = AtomicI64::new(((9i64) << 32) | (TERM_LENGTH as i64 + 32));
        let header = HeaderWriter::new(1, 2);

        assert_eq!(fx.appender().append_unfragmented(&header, b"x", 0), FAILED);
    }

    #[test]
    fn exact_fill_trips_without_padding() {
        let mut fx = Fixture::new(9);
        fx.raw_tail = AtomicI64::new(((9i64) << 32) | TERM_LENGTH as i64);
        let header = HeaderWriter::new(1, 2);

        assert_eq!(fx.appender().append_unfragmented(&header, b"x", 0), TRIPPED);
        assert_eq!(frame_length_volatile(fx.term.as_mut_ptr(), 0), 0);
    }

    #[test]
    fn claim_commit_roundtrip() {
        let mut fx = Fixture::new(1);
        let header = HeaderWriter::new(1, 2);

        let (result, claim) = fx.appender().claim(&header, 16);
        assert_eq!(result_term_offset(result), 64);
        let mut claim = claim.unwrap();

        // not visible until committed
        assert_eq!(frame_length_volatile(fx.term.as_mut_ptr(), 0), 0);
        claim.data_mut().copy_from_slice(&[7u8; 16]);
        claim.commit();
        assert_eq!(frame_length_volatile(fx.term.as_mut_ptr(), 0), (HEADER_LENGTH + 16) as i32);
    }

    #[test]
    fn claim_abort_pads() {
        let mut fx = Fixture::new(1);
        let header = HeaderWriter::new(1, 2);

        let (_, claim) = fx.appender().claim(&header, 16);
        claim.unwrap().abort();
        let ptr = fx.term.as_mut_ptr();
        assert!(is_padding_frame(ptr, 0));
        assert_eq!(frame_length_volatile(ptr, 0), (HEADER_LENGTH + 16) as i32);
    }

    #[test]
    fn concurrent_appends_disjoint_and_contiguous() {
        let mut fx = Fixture::new(0);
        let header = HeaderWriter::new(1, 2);
        let term_ptr = fx.term.as_mut_ptr() as usize;
        let raw_tail = &fx.raw_tail;

        std::thread::scope(|s| {
            for t in 0..4u8 {
                s.spawn(move || {
                    let appender =
                        TermAppender::new(term_ptr as *mut u8, TERM_LENGTH, raw_tail);
                    let msg = [t; 24];
                    for _ in 0..16 {
                        let r = appender.append_unfragmented(&header, &msg, 0);
                        assert!(r >= 0);
                    }
                });
            }
        });

        // once all are committed the term is a prefix-contiguous run of
        // disjoint frames
        let ptr = fx.term.as_mut_ptr();
        let mut offset = 0usize;
        let mut frames = 0;
        while offset < TERM_LENGTH {
            let length = frame_length_volatile(ptr, offset);
            if length == 0 {
                break;
            }
            assert_eq!(length as usize, HEADER_LENGTH + 24);
            frames += 1;
            offset += align(length as usize, FRAME_ALIGNMENT);
        }
        assert_eq!(frames, 64);
    }
}
