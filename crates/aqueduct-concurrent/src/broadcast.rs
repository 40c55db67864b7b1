use std::sync::atomic::{AtomicI64, Ordering};

use aqueduct_utils::{CACHE_LINE_LENGTH, align};

use crate::error::BroadcastError;

pub const HEADER_LENGTH: usize = 8;
pub const ALIGNMENT: usize = 8;
pub const PADDING_MSG_TYPE_ID: i32 = -1;

const TAIL_INTENT_COUNTER_OFFSET: usize = 0;
const TAIL_COUNTER_OFFSET: usize = 2 * CACHE_LINE_LENGTH;
const LATEST_COUNTER_OFFSET: usize = 4 * CACHE_LINE_LENGTH;

pub const TRAILER_LENGTH: usize = 6 * CACHE_LINE_LENGTH;

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

/// Single-writer broadcast over shared memory. The driver conductor is the
/// only transmitter; every attached client reads independently. Slow readers
/// are lapped, detected through the tail-intent counter, and resynced to the
/// latest record rather than blocking the writer.
pub struct BroadcastTransmitter {
    ptr: *mut u8,
    capacity: usize,
    mask: usize,
    max_msg_length: usize,
}

unsafe impl Send for BroadcastTransmitter {}
unsafe impl Sync for BroadcastTransmitter {}

impl BroadcastTransmitter {
    pub fn new(ptr: *mut u8, total_length: usize) -> Result<Self, BroadcastError> {
        let capacity = total_length - TRAILER_LENGTH;
        if !capacity.is_power_of_two() {
            return Err(BroadcastError::CapacityNotPowerOfTwo);
        }
        Ok(Self { ptr, capacity, mask: capacity - 1, max_msg_length: capacity / 8 })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn counter(&self, offset: usize) -> &AtomicI64 {
        unsafe { &*(self.ptr.add(self.capacity + offset) as *const AtomicI64) }
    }

    #[inline]
    fn header_at(&self, index: usize) -> &AtomicI64 {
        unsafe { &*(self.ptr.add(index) as *const AtomicI64) }
    }

    pub fn transmit(&self, msg_type: i32, msg: &[u8]) -> Result<(), BroadcastError> {
        if msg.len() > self.max_msg_length {
            return Err(BroadcastError::MessageTooLong(msg.len(), self.max_msg_length));
        }

        let rec_length = msg.len() + HEADER_LENGTH;
        let aligned = align(rec_length, ALIGNMENT);

        let mut tail = self.counter(TAIL_COUNTER_OFFSET).load(Ordering::Relaxed);
        let mut record_index = (tail as usize) & self.mask;
        let to_end = self.capacity - record_index;

        if aligned > to_end {
            self.counter(TAIL_INTENT_COUNTER_OFFSET)
                .store(tail + (to_end + aligned) as i64, Ordering::Release);
            self.header_at(record_index)
                .store(make_header(to_end as i32, PADDING_MSG_TYPE_ID), Ordering::Relaxed);
            tail += to_end as i64;
            record_index = 0;
        } else {
            self.counter(TAIL_INTENT_COUNTER_OFFSET)
                .store(tail + aligned as i64, Ordering::Release);
        }

        self.header_at(record_index)
            .store(make_header(rec_length as i32, msg_type), Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.ptr.add(record_index + HEADER_LENGTH),
                msg.len(),
            );
        }

        self.counter(LATEST_COUNTER_OFFSET).store(tail, Ordering::Relaxed);
        self.counter(TAIL_COUNTER_OFFSET).store(tail + aligned as i64, Ordering::Release);
        Ok(())
    }
}

/// Per-client cursor over a broadcast buffer. Copies each record out and
/// revalidates against the tail intent so a lapped read never hands out torn
/// bytes.
pub struct BroadcastReceiver {
    ptr: *const u8,
    capacity: usize,
    mask: usize,
    cursor: i64,
    next_record: i64,
    lapped_count: u64,
    scratch: Vec<u8>,
}

unsafe impl Send for BroadcastReceiver {}

impl BroadcastReceiver {
    pub fn new(ptr: *const u8, total_length: usize) -> Result<Self, BroadcastError> {
        let capacity = total_length - TRAILER_LENGTH;
        if !capacity.is_power_of_two() {
            return Err(BroadcastError::CapacityNotPowerOfTwo);
        }
        let mut rx = Self {
            ptr,
            capacity,
            mask: capacity - 1,
            cursor: 0,
            next_record: 0,
            lapped_count: 0,
            scratch: Vec::new(),
        };
        let tail = rx.counter(TAIL_COUNTER_OFFSET).load(Ordering::Acquire);
        rx.cursor = tail;
        rx.next_record = tail;
        Ok(rx)
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
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    #[inline]
    fn validate(&self, cursor: i64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        cursor + self.capacity as i64 >
            self.counter(TAIL_INTENT_COUNTER_OFFSET).load(Ordering::Acquire)
    }

    /// Receives the next record if one is available. Returns `Ok(false)` when
    /// caught up and `Err(SpedPast)` when the transmitter lapped this reader
    /// (the cursor is resynced to the latest record before returning).
    pub fn receive<F>(&mut self, mut handler: F) -> Result<bool, BroadcastError>
    where
        F: FnMut(i32, &[u8]),
    {
        loop {
            let tail = self.counter(TAIL_COUNTER_OFFSET).load(Ordering::Acquire);
            let mut cursor = self.next_record;
            if tail <= cursor {
                return Ok(false);
            }

            if !self.validate(cursor) {
                self.lapped_count += 1;
                self.cursor = self.counter(LATEST_COUNTER_OFFSET).load(Ordering::Acquire);
                self.next_record = self.cursor;
                return Err(BroadcastError::SpedPast);
            }

            let mut record_index = (cursor as usize) & self.mask;
            let header = self.header_at(record_index).load(Ordering::Acquire);
            let mut length = record_length(header);
            let mut msg_type = message_type(header);

            if msg_type == PADDING_MSG_TYPE_ID {
                cursor += length as i64;
                record_index = 0;
                let header = self.header_at(record_index).load(Ordering::Acquire);
                length = record_length(header);
                msg_type = message_type(header);
            }

            self.scratch.clear();
            self.scratch.extend_from_slice(unsafe {
                std::slice::from_raw_parts(
                    self.ptr.add(record_index + HEADER_LENGTH),
                    length as usize - HEADER_LENGTH,
                )
            });

            self.next_record = cursor + align(length as usize, ALIGNMENT) as i64;

            // a lap while copying invalidates the scratch bytes, retry
            if !self.validate(cursor) {
                self.lapped_count += 1;
                self.cursor = self.counter(LATEST_COUNTER_OFFSET).load(Ordering::Acquire);
                self.next_record = self.cursor;
                continue;
            }

            self.cursor = cursor;
            handler(msg_type, &self.scratch);
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 1024;

    fn buffer() -> Vec<u8> {
        vec![0u8; CAPACITY + TRAILER_LENGTH]
    }

    #[test]
    fn transmit_receive_in_order() {
        let mut mem = buffer();
        let tx = BroadcastTransmitter::new(mem.as_mut_ptr(), mem.len()).unwrap();
        let mut rx = BroadcastReceiver::new(mem.as_ptr(), mem.len()).unwrap();

        tx.transmit(1, b"first").unwrap();
        tx.transmit(2, b"second").unwrap();

        let mut seen = Vec::new();
        while rx.receive(|t, m| seen.push((t, m.to_vec()))).unwrap() {}
        assert_eq!(seen, vec![(1, b"first".to_vec()), (2, b"second".to_vec())]);
    }

    #[test]
    fn receiver_attaches_at_tail() {
        let mut mem = buffer();
        let tx = BroadcastTransmitter::new(mem.as_mut_ptr(), mem.len()).unwrap();
        tx.transmit(1, b"missed").unwrap();

        let mut rx = BroadcastReceiver::new(mem.as_ptr(), mem.len()).unwrap();
        assert!(!rx.receive(|_, _| panic!("attached after transmit")).unwrap());

        tx.transmit(2, b"seen").unwrap();
        let mut got = None;
        rx.receive(|t, m| got = Some((t, m.to_vec()))).unwrap();
        assert_eq!(got, Some((2, b"seen".to_vec())));
    }

    #[test]
    fn wraps_across_the_end() {
        let mut mem = buffer();
        let tx = BroadcastTransmitter::new(mem.as_mut_ptr(), mem.len()).unwrap();
        let mut rx = BroadcastReceiver::new(mem.as_ptr(), mem.len()).unwrap();

        let msg = vec![7u8; 100];
        let mut sent = 0;
        let mut received = 0;
        for _ in 0..40 {
            tx.transmit(1, &msg).unwrap();
            sent += 1;
            while rx.receive(|_, m| assert_eq!(m, &msg[..])).unwrap() {
                received += 1;
            }
        }
        assert_eq!(sent, received);
    }

    #[test]
    fn lapped_reader_resyncs() {
        let mut mem = buffer();
        let tx = BroadcastTransmitter::new(mem.as_mut_ptr(), mem.len()).unwrap();
        let mut rx = BroadcastReceiver::new(mem.as_ptr(), mem.len()).unwrap();

        let msg = vec![1u8; 96];
        for _ in 0..64 {
            tx.transmit(1, &msg).unwrap();
        }

        assert_eq!(rx.receive(|_, _| ()), Err(BroadcastError::SpedPast));
        assert_eq!(rx.lapped_count(), 1);

        // after resync the receiver reads the most recent record onwards
        tx.transmit(2, b"fresh").unwrap();
        let mut types = Vec::new();
        while rx.receive(|t, _| types.push(t)).unwrap() {}
        assert!(types.contains(&2));
    }
}
