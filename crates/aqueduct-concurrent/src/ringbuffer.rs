use std::sync::atomic::{AtomicI64, Ordering};

use aqueduct_utils::{CACHE_LINE_LENGTH, align};

use crate::error::RingBufferError;

/// Record framing for the control ring: an 8 byte header packing
/// `(length: i32, msg_type: i32)` written as one atomic word. A negative
/// length marks a claimed-but-uncommitted record, zero an unclaimed slot.
pub const HEADER_LENGTH: usize = 8;
pub const ALIGNMENT: usize = 8;
pub const PADDING_MSG_TYPE_ID: i32 = -1;

const TAIL_POSITION_OFFSET: usize = 0;
const HEAD_CACHE_POSITION_OFFSET: usize = 2 * CACHE_LINE_LENGTH;
const HEAD_POSITION_OFFSET: usize = 4 * CACHE_LINE_LENGTH;
const CORRELATION_COUNTER_OFFSET: usize = 6 * CACHE_LINE_LENGTH;
const CONSUMER_HEARTBEAT_OFFSET: usize = 8 * CACHE_LINE_LENGTH;

/// Space reserved past the data capacity for the ring's position counters
/// and the consumer heartbeat, each pair of cache lines apart.
pub const TRAILER_LENGTH: usize = 10 * CACHE_LINE_LENGTH;

#[inline]
const fn make_header(length: i32, msg_type: i32) -> i64 {
    ((msg_type as i64) << 32) | (length as u32 as i64)
}

#[inline]
const fn record_length(header: i64) -> i32 {
    header as i32
}

#[inline]
const fn message_type(header: i64) -> i32 {
    (header >> 32) as i32
}

/// Many-producer single-consumer byte ring over a shared-memory region.
/// Clients claim space with a CAS on the tail, the driver conductor drains
/// from the head. Layout is `capacity` data bytes (power of two) followed by
/// [`TRAILER_LENGTH`] bytes of counters.
///
/// This is a view over externally owned memory, so copies share the ring.
#[derive(Clone, Copy)]
pub struct ManyToOneRingBuffer {
    ptr: *mut u8,
    capacity: usize,
    mask: usize,
    max_msg_length: usize,
}

unsafe impl Send for ManyToOneRingBuffer {}
unsafe impl Sync for ManyToOneRingBuffer {}

impl ManyToOneRingBuffer {
    pub fn new(ptr: *mut u8, total_length: usize) -> Result<Self, RingBufferError> {
        let capacity = total_length - TRAILER_LENGTH;
        if !capacity.is_power_of_two() {
            return Err(RingBufferError::CapacityNotPowerOfTwo);
        }
        Ok(Self { ptr, capacity, mask: capacity - 1, max_msg_length: capacity / 8 })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    #[inline]
    fn counter(&self, offset: usize) -> &AtomicI64 {
        unsafe { &*(self.ptr.add(self.capacity + offset) as *const AtomicI64) }
    }

    #[inline]
    fn header_at(&self, index: usize) -> &AtomicI64 {
        unsafe { &*(self.ptr.add(index) as *const AtomicI64) }
    }

    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.counter(TAIL_POSITION_OFFSET).load(Ordering::Acquire)
    }

    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.counter(HEAD_POSITION_OFFSET).load(Ordering::Acquire)
    }

    #[inline]
    pub fn size(&self) -> usize {
        (self.producer_position() - self.consumer_position()) as usize
    }

    #[inline]
    pub fn next_correlation_id(&self) -> i64 {
        self.counter(CORRELATION_COUNTER_OFFSET).fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.counter(CONSUMER_HEARTBEAT_OFFSET).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_consumer_heartbeat_time(&self, time_ms: i64) {
        self.counter(CONSUMER_HEARTBEAT_OFFSET).store(time_ms, Ordering::Release);
    }

    /// Multi-producer write. Claims space with a CAS on the tail, commits by
    /// flipping the header length positive. A record never straddles the end
    /// of the buffer; the gap is filled with a padding record instead.
    pub fn write(&self, msg_type: i32, msg: &[u8]) -> Result<(), RingBufferError> {
        if msg_type <= 0 {
            return Err(RingBufferError::ReservedTypeId(msg_type));
        }
        if msg.len() > self.max_msg_length {
            return Err(RingBufferError::MessageTooLong(msg.len(), self.max_msg_length));
        }

        let rec_length = msg.len() + HEADER_LENGTH;
        let required = align(rec_length, ALIGNMENT);
        let (index, padding) = self.claim(required)?;

        if padding > 0 {
            self.header_at(index)
                .store(make_header(padding as i32, PADDING_MSG_TYPE_ID), Ordering::Release);
        }
        let index = if padding > 0 { 0 } else { index };

        self.header_at(index).store(make_header(-(rec_length as i32), msg_type), Ordering::Release);
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.ptr.add(index + HEADER_LENGTH),
                msg.len(),
            );
        }
        self.header_at(index).store(make_header(rec_length as i32, msg_type), Ordering::Release);
        Ok(())
    }

    fn claim(&self, required: usize) -> Result<(usize, usize), RingBufferError> {
        let tail_counter = self.counter(TAIL_POSITION_OFFSET);
        let head_cache = self.counter(HEAD_CACHE_POSITION_OFFSET);

        loop {
            let tail = tail_counter.load(Ordering::Acquire);
            let mut head = head_cache.load(Ordering::Relaxed);

            if required > self.capacity - (tail - head) as usize {
                head = self.counter(HEAD_POSITION_OFFSET).load(Ordering::Acquire);
                if required > self.capacity - (tail - head) as usize {
                    return Err(RingBufferError::InsufficientCapacity);
                }
                head_cache.store(head, Ordering::Relaxed);
            }

            let tail_index = (tail as usize) & self.mask;
            let to_end = self.capacity - tail_index;
            let mut padding = 0usize;

            if required > to_end {
                // wrap: the padding consumes to_end, record restarts at zero
                let mut head_index = (head as usize) & self.mask;
                if required > head_index {
                    head = self.counter(HEAD_POSITION_OFFSET).load(Ordering::Acquire);
                    head_index = (head as usize) & self.mask;
                    if required > head_index {
                        return Err(RingBufferError::InsufficientCapacity);
                    }
                    head_cache.store(head, Ordering::Relaxed);
                }
                padding = to_end;
            }

            if tail_counter
                .compare_exchange(
                    tail,
                    tail + (required + padding) as i64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok((tail_index, padding));
            }
        }
    }

    /// Single-consumer read of up to `limit` messages. Consumed bytes are
    /// zeroed before the head advances so producers reclaim clean memory.
    pub fn read<F>(&self, limit: usize, mut handler: F) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        let head_counter = self.counter(HEAD_POSITION_OFFSET);
        let head = head_counter.load(Ordering::Relaxed);
        let head_index = (head as usize) & self.mask;
        let contiguous = self.capacity - head_index;

        let mut bytes_read = 0usize;
        let mut messages = 0usize;

        while bytes_read < contiguous && messages < limit {
            let record_index = head_index + bytes_read;
            let header = self.header_at(record_index).load(Ordering::Acquire);
            let length = record_length(header);
            if length <= 0 {
                break;
            }

            bytes_read += align(length as usize, ALIGNMENT);

            let msg_type = message_type(header);
            if msg_type == PADDING_MSG_TYPE_ID {
                continue;
            }

            let payload = unsafe {
                std::slice::from_raw_parts(
                    self.ptr.add(record_index + HEADER_LENGTH),
                    length as usize - HEADER_LENGTH,
                )
            };
            handler(msg_type, payload);
            messages += 1;
        }

        if bytes_read > 0 {
            unsafe { std::ptr::write_bytes(self.ptr.add(head_index), 0, bytes_read) };
            head_counter.store(head + bytes_read as i64, Ordering::Release);
        }

        messages
    }

    /// Skips a producer that claimed space and died before committing. Run by
    /// the consumer side once the ring has been blocked past the liveness
    /// timeout. Idempotent: a second call on the same spot finds committed
    /// padding and reports false.
    pub fn unblock(&self) -> bool {
        let head = self.counter(HEAD_POSITION_OFFSET).load(Ordering::Acquire);
        let tail = self.counter(TAIL_POSITION_OFFSET).load(Ordering::Acquire);
        if head == tail {
            return false;
        }

        let head_index = (head as usize) & self.mask;
        let header = self.header_at(head_index).load(Ordering::Acquire);
        let length = record_length(header);

        if length < 0 {
            self.header_at(head_index)
                .store(make_header(-length, PADDING_MSG_TYPE_ID), Ordering::Release);
            return true;
        }

        if length == 0 {
            // claim won the CAS but the header store never landed. If a later
            // producer has committed past the gap, pad the gap away.
            let blocked = std::cmp::min((tail - head) as usize, self.capacity - head_index);
            let mut offset = ALIGNMENT;
            while offset < blocked {
                if self.header_at(head_index + offset).load(Ordering::Acquire) != 0 {
                    self.header_at(head_index)
                        .store(make_header(offset as i32, PADDING_MSG_TYPE_ID), Ordering::Release);
                    return true;
                }
                offset += ALIGNMENT;
            }
        }

        false
    }
}
