use std::{
    path::Path,
    sync::atomic::{AtomicI32, AtomicI64, Ordering},
};

use aqueduct_concurrent::MappedRegion;
use aqueduct_utils::CACHE_LINE_LENGTH;

use crate::{
    error::LogBufferError,
    frame::{HEADER_LENGTH, HeaderWriter},
};

pub const PARTITION_COUNT: usize = 3;
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Metadata trailer, one page. Raw tails and the active index live on the
/// producer-facing lines; the sender- and conductor-mutated words each get
/// their own pair of cache lines so neither agent bounces the other's.
pub const LOG_META_DATA_LENGTH: usize = 4096;

const TERM_TAIL_COUNTERS_OFFSET: usize = 0; // 3 * i64
const ACTIVE_PARTITION_INDEX_OFFSET: usize = PARTITION_COUNT * 8;
const TIME_OF_LAST_SM_OFFSET: usize = 2 * CACHE_LINE_LENGTH;
const END_OF_STREAM_POSITION_OFFSET: usize = 4 * CACHE_LINE_LENGTH;
const IS_CONNECTED_OFFSET: usize = 6 * CACHE_LINE_LENGTH;
const INITIAL_TERM_ID_OFFSET: usize = 8 * CACHE_LINE_LENGTH;
const MTU_LENGTH_OFFSET: usize = INITIAL_TERM_ID_OFFSET + 4;
const TERM_LENGTH_OFFSET: usize = INITIAL_TERM_ID_OFFSET + 8;
const SESSION_ID_OFFSET: usize = INITIAL_TERM_ID_OFFSET + 12;
const STREAM_ID_OFFSET: usize = INITIAL_TERM_ID_OFFSET + 16;
const CORRELATION_ID_OFFSET: usize = INITIAL_TERM_ID_OFFSET + 24;
const DEFAULT_FRAME_HEADER_OFFSET: usize = 10 * CACHE_LINE_LENGTH;

#[inline]
pub const fn compute_log_length(term_length: usize) -> usize {
    PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH
}

#[inline]
pub fn check_term_length(term_length: usize) -> Result<(), LogBufferError> {
    if !term_length.is_power_of_two() ||
        term_length < TERM_MIN_LENGTH ||
        term_length > TERM_MAX_LENGTH
    {
        return Err(LogBufferError::InvalidTermLength(
            term_length,
            TERM_MIN_LENGTH,
            TERM_MAX_LENGTH,
        ));
    }
    Ok(())
}

#[inline]
pub const fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

/// Absolute stream position for a `(term_id, term_offset)` pair.
#[inline]
pub const fn compute_position(
    term_id: i32,
    term_offset: usize,
    bits: u32,
    initial_term_id: i32,
) -> i64 {
    (((term_id as i64) - (initial_term_id as i64)) << bits) + term_offset as i64
}

#[inline]
pub const fn compute_term_begin_position(term_id: i32, bits: u32, initial_term_id: i32) -> i64 {
    ((term_id as i64) - (initial_term_id as i64)) << bits
}

#[inline]
pub const fn compute_term_id_from_position(position: i64, bits: u32, initial_term_id: i32) -> i32 {
    ((position >> bits) + initial_term_id as i64) as i32
}

#[inline]
pub const fn compute_term_offset_from_position(position: i64, bits: u32) -> usize {
    (position & ((1i64 << bits) - 1)) as usize
}

#[inline]
pub const fn index_by_term(initial_term_id: i32, term_id: i32) -> usize {
    ((term_id as i64 - initial_term_id as i64) % PARTITION_COUNT as i64) as usize
}

#[inline]
pub const fn next_partition_index(index: usize) -> usize {
    (index + 1) % PARTITION_COUNT
}

#[inline]
pub const fn pack_raw_tail(term_id: i32, term_offset: usize) -> i64 {
    ((term_id as i64) << 32) | term_offset as i64
}

#[inline]
pub const fn raw_tail_term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

#[inline]
pub fn raw_tail_offset(raw_tail: i64, term_length: usize) -> usize {
    std::cmp::min((raw_tail & 0xffff_ffff) as usize, term_length)
}

/// A mapped term log: three equal partitions followed by the metadata page.
/// Created by the driver, opened read/write by publishers and subscribers.
pub struct LogBuffers {
    region: MappedRegion,
    term_length: usize,
}

unsafe impl Send for LogBuffers {}
unsafe impl Sync for LogBuffers {}

impl LogBuffers {
    pub fn create<P: AsRef<Path>>(path: P, term_length: usize) -> Result<Self, LogBufferError> {
        check_term_length(term_length)?;
        let region = MappedRegion::create(path, compute_log_length(term_length))?;
        Ok(Self { region, term_length })
    }

    pub fn open<P: AsRef<Path>>(path: P, term_length: usize) -> Result<Self, LogBufferError> {
        check_term_length(term_length)?;
        let region = MappedRegion::open(path)?;
        let needed = compute_log_length(term_length);
        if region.len() < needed {
            return Err(LogBufferError::Truncated(region.len(), needed));
        }
        Ok(Self { region, term_length })
    }

    /// Stamps the immutable stream parameters and the default frame header.
    /// Called once by the conductor before the log is handed to anyone else.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &self,
        initial_term_id: i32,
        active_term_id: i32,
        mtu_length: usize,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
    ) {
        let meta = self.metadata_ptr();
        unsafe {
            (meta.add(INITIAL_TERM_ID_OFFSET) as *mut i32).write(initial_term_id);
            (meta.add(MTU_LENGTH_OFFSET) as *mut i32).write(mtu_length as i32);
            (meta.add(TERM_LENGTH_OFFSET) as *mut i32).write(self.term_length as i32);
            (meta.add(SESSION_ID_OFFSET) as *mut i32).write(session_id);
            (meta.add(STREAM_ID_OFFSET) as *mut i32).write(stream_id);
            (meta.add(CORRELATION_ID_OFFSET) as *mut i64).write(correlation_id);
        }

        let header = HeaderWriter::new(session_id, stream_id).default_header();
        unsafe {
            std::ptr::copy_nonoverlapping(
                header.as_ptr(),
                meta.add(DEFAULT_FRAME_HEADER_OFFSET),
                HEADER_LENGTH,
            );
        }

        self.set_end_of_stream_position(i64::MAX);
        let index = index_by_term(initial_term_id, active_term_id);
        self.raw_tail_atomic(index).store(pack_raw_tail(active_term_id, 0), Ordering::Release);
        self.set_active_partition_index(index);
    }

    #[inline]
    fn metadata_ptr(&self) -> *mut u8 {
        unsafe { self.region.ptr().add(PARTITION_COUNT * self.term_length) }
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn term_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < PARTITION_COUNT);
        unsafe { self.region.ptr().add(index * self.term_length) }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn unlink(&self) {
        self.region.unlink();
    }

    #[inline]
    pub fn raw_tail_atomic(&self, index: usize) -> &AtomicI64 {
        debug_assert!(index < PARTITION_COUNT);
        unsafe {
            &*(self.metadata_ptr().add(TERM_TAIL_COUNTERS_OFFSET + index * 8) as *const AtomicI64)
        }
    }

    #[inline]
    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.raw_tail_atomic(index).load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_partition_index(&self) -> usize {
        unsafe {
            (*(self.metadata_ptr().add(ACTIVE_PARTITION_INDEX_OFFSET) as *const AtomicI32))
                .load(Ordering::Acquire) as usize
        }
    }

    #[inline]
    pub fn set_active_partition_index(&self, index: usize) {
        unsafe {
            (*(self.metadata_ptr().add(ACTIVE_PARTITION_INDEX_OFFSET) as *const AtomicI32))
                .store(index as i32, Ordering::Release);
        }
    }

    /// Prepares the next partition and advances the active index. Safe to
    /// race: every producer that trips computes the same expected tail, so
    /// the CAS makes rotation idempotent.
    pub fn rotate(&self, current_index: usize, current_term_id: i32) {
        let next_index = next_partition_index(current_index);
        let next_term_id = current_term_id + 1;
        let expected_term_id = next_term_id - PARTITION_COUNT as i32;
        let tail = self.raw_tail_atomic(next_index);

        loop {
            let raw = tail.load(Ordering::Acquire);
            // rotate a partition holding the term from one lap ago, or a
            // still-zeroed one on a fresh log
            if raw_tail_term_id(raw) != expected_term_id && raw != 0 {
                break;
            }
            if tail
                .compare_exchange(
                    raw,
                    pack_raw_tail(next_term_id, 0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.set_active_partition_index(next_index);
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        unsafe { (self.metadata_ptr().add(INITIAL_TERM_ID_OFFSET) as *const i32).read() }
    }

    #[inline]
    pub fn mtu_length(&self) -> usize {
        unsafe { (self.metadata_ptr().add(MTU_LENGTH_OFFSET) as *const i32).read() as usize }
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        unsafe { (self.metadata_ptr().add(SESSION_ID_OFFSET) as *const i32).read() }
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        unsafe { (self.metadata_ptr().add(STREAM_ID_OFFSET) as *const i32).read() }
    }

    #[inline]
    pub fn correlation_id(&self) -> i64 {
        unsafe { (self.metadata_ptr().add(CORRELATION_ID_OFFSET) as *const i64).read() }
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        unsafe {
            (*(self.metadata_ptr().add(END_OF_STREAM_POSITION_OFFSET) as *const AtomicI64))
                .load(Ordering::Acquire)
        }
    }

    #[inline]
    pub fn set_end_of_stream_position(&self, position: i64) {
        unsafe {
            (*(self.metadata_ptr().add(END_OF_STREAM_POSITION_OFFSET) as *const AtomicI64))
                .store(position, Ordering::Release);
        }
    }

    #[inline]
    pub fn time_of_last_status_message(&self) -> i64 {
        unsafe {
            (*(self.metadata_ptr().add(TIME_OF_LAST_SM_OFFSET) as *const AtomicI64))
                .load(Ordering::Acquire)
        }
    }

    #[inline]
    pub fn set_time_of_last_status_message(&self, time_ns: i64) {
        unsafe {
            (*(self.metadata_ptr().add(TIME_OF_LAST_SM_OFFSET) as *const AtomicI64))
                .store(time_ns, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        unsafe {
            (*(self.metadata_ptr().add(IS_CONNECTED_OFFSET) as *const AtomicI32))
                .load(Ordering::Acquire) == 1
        }
    }

    #[inline]
    pub fn set_connected(&self, connected: bool) {
        unsafe {
            (*(self.metadata_ptr().add(IS_CONNECTED_OFFSET) as *const AtomicI32))
                .store(connected as i32, Ordering::Release);
        }
    }

    /// Producer position derived from the active partition's raw tail.
    pub fn producer_position(&self) -> i64 {
        let bits = position_bits_to_shift(self.term_length);
        let raw = self.raw_tail_volatile(self.active_partition_index());
        compute_position(
            raw_tail_term_id(raw),
            raw_tail_offset(raw, self.term_length),
            bits,
            self.initial_term_id(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_math() {
        let term_length = 64 * 1024;
        let bits = position_bits_to_shift(term_length);
        assert_eq!(bits, 16);
        assert_eq!(compute_position(5, 0, bits, 5), 0);
        assert_eq!(compute_position(6, 128, bits, 5), term_length as i64 + 128);
        assert_eq!(compute_term_id_from_position(term_length as i64 + 128, bits, 5), 6);
        assert_eq!(compute_term_offset_from_position(term_length as i64 + 128, bits), 128);
    }

    #[test]
    fn raw_tail_packing() {
        let raw = pack_raw_tail(42, 1024);
        assert_eq!(raw_tail_term_id(raw), 42);
        assert_eq!(raw_tail_offset(raw, 64 * 1024), 1024);
        // offsets past the end clamp to term length
        let over = pack_raw_tail(42, 90_000);
        assert_eq!(raw_tail_offset(over, 64 * 1024), 64 * 1024);
    }

    #[test]
    fn index_rotation() {
        assert_eq!(index_by_term(10, 10), 0);
        assert_eq!(index_by_term(10, 11), 1);
        assert_eq!(index_by_term(10, 12), 2);
        assert_eq!(index_by_term(10, 13), 0);
        assert_eq!(next_partition_index(2), 0);
    }

    #[test]
    fn term_length_validation() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(64 * 1024 + 1).is_err());
        assert!(check_term_length(1024).is_err());
    }

    #[test]
    fn initialize_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.logbuffer");
        let term_length = TERM_MIN_LENGTH;

        let log = LogBuffers::create(&path, term_length).unwrap();
        log.initialize(100, 100, 1408, 7, 10, 55);

        assert_eq!(log.initial_term_id(), 100);
        assert_eq!(log.mtu_length(), 1408);
        assert_eq!(log.session_id(), 7);
        assert_eq!(log.stream_id(), 10);
        assert_eq!(log.correlation_id(), 55);
        assert_eq!(log.active_partition_index(), 0);
        assert_eq!(log.end_of_stream_position(), i64::MAX);
        assert_eq!(log.producer_position(), 0);

        let reopened = LogBuffers::open(&path, term_length).unwrap();
        assert_eq!(reopened.session_id(), 7);
        log.unlink();
    }

    #[test]
    fn rotation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotate.logbuffer");
        let log = LogBuffers::create(&path, TERM_MIN_LENGTH).unwrap();
        log.initialize(0, 0, 1408, 1, 1, 1);

        log.rotate(0, 0);
        assert_eq!(log.active_partition_index(), 1);
        assert_eq!(raw_tail_term_id(log.raw_tail_volatile(1)), 1);

        // the second producer observing the trip rotates again with the same
        // arguments and changes nothing
        log.rotate(0, 0);
        assert_eq!(log.active_partition_index(), 1);
        assert_eq!(raw_tail_term_id(log.raw_tail_volatile(1)), 1);
        log.unlink();
    }
}
