use std::sync::atomic::{AtomicI32, Ordering};

use aqueduct_utils::align;

/// Distinct error log: each distinct message is recorded once; repeats bump
/// the observation count and last-seen timestamp. Readers attach through the
/// control file and scan records until a zero length.
///
/// Record: `(length: i32, observation_count: i32, last_ts_ms: i64,
/// first_ts_ms: i64, utf8 message)`, 8 byte aligned.
pub struct DistinctErrorLog {
    ptr: *mut u8,
    capacity: usize,
    next_offset: usize,
}

unsafe impl Send for DistinctErrorLog {}

const LENGTH_OFFSET: usize = 0;
const OBSERVATION_COUNT_OFFSET: usize = 4;
const LAST_TIMESTAMP_OFFSET: usize = 8;
const FIRST_TIMESTAMP_OFFSET: usize = 16;
const ENCODED_ERROR_OFFSET: usize = 24;
const RECORD_ALIGNMENT: usize = 8;

impl DistinctErrorLog {
    pub fn new(ptr: *mut u8, capacity: usize) -> Self {
        Self { ptr, capacity, next_offset: 0 }
    }

    /// Records an error, deduplicating on the message text. Returns false
    /// when the log is full and the error was dropped.
    pub fn record(&mut self, message: &str, now_ms: i64) -> bool {
        if let Some(offset) = self.find(message) {
            unsafe {
                let record = self.ptr.add(offset);
                (record.add(LAST_TIMESTAMP_OFFSET) as *mut i64).write(now_ms);
                let count = &*(record.add(OBSERVATION_COUNT_OFFSET) as *const AtomicI32);
                count.fetch_add(1, Ordering::Release);
            }
            return true;
        }

        let record_length = ENCODED_ERROR_OFFSET + message.len();
        if self.next_offset + align(record_length, RECORD_ALIGNMENT) > self.capacity {
            tracing::warn!("distinct error log full, dropping: {message}");
            return false;
        }

        unsafe {
            let record = self.ptr.add(self.next_offset);
            (record.add(FIRST_TIMESTAMP_OFFSET) as *mut i64).write(now_ms);
            (record.add(LAST_TIMESTAMP_OFFSET) as *mut i64).write(now_ms);
            std::ptr::copy_nonoverlapping(
                message.as_ptr(),
                record.add(ENCODED_ERROR_OFFSET),
                message.len(),
            );
            (*(record.add(OBSERVATION_COUNT_OFFSET) as *const AtomicI32))
                .store(1, Ordering::Relaxed);
            // length last: publishes the record to readers
            (*(record.add(LENGTH_OFFSET) as *const AtomicI32))
                .store(record_length as i32, Ordering::Release);
        }
        self.next_offset += align(record_length, RECORD_ALIGNMENT);
        true
    }

    fn find(&self, message: &str) -> Option<usize> {
        let mut offset = 0;
        while offset < self.next_offset {
            let record = unsafe { self.ptr.add(offset) };
            let length =
                unsafe { (*(record.add(LENGTH_OFFSET) as *const AtomicI32)).load(Ordering::Acquire) }
                    as usize;
            if length == 0 {
                break;
            }
            let existing = unsafe {
                std::slice::from_raw_parts(
                    record.add(ENCODED_ERROR_OFFSET),
                    length - ENCODED_ERROR_OFFSET,
                )
            };
            if existing == message.as_bytes() {
                return Some(offset);
            }
            offset += align(length, RECORD_ALIGNMENT);
        }
        None
    }

    /// Scans all records, for tooling and tests.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, i32, i64, i64),
    {
        let mut offset = 0;
        while offset + ENCODED_ERROR_OFFSET <= self.capacity {
            let record = unsafe { self.ptr.add(offset) };
            let length =
                unsafe { (*(record.add(LENGTH_OFFSET) as *const AtomicI32)).load(Ordering::Acquire) }
                    as usize;
            if length == 0 {
                break;
            }
            unsafe {
                let message = std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                    record.add(ENCODED_ERROR_OFFSET),
                    length - ENCODED_ERROR_OFFSET,
                ));
                let count =
                    (*(record.add(OBSERVATION_COUNT_OFFSET) as *const AtomicI32)).load(Ordering::Acquire);
                let last = (record.add(LAST_TIMESTAMP_OFFSET) as *const i64).read();
                let first = (record.add(FIRST_TIMESTAMP_OFFSET) as *const i64).read();
                f(message, count, first, last);
            }
            offset += align(length, RECORD_ALIGNMENT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_errors_recorded_once() {
        let mut mem = vec![0u8; 4096];
        let mut log = DistinctErrorLog::new(mem.as_mut_ptr(), mem.len());

        assert!(log.record("cannot bind socket", 100));
        assert!(log.record("cannot allocate log buffer", 150));
        assert!(log.record("cannot bind socket", 200));

        let mut records = Vec::new();
        log.for_each(|msg, count, first, last| records.push((msg.to_string(), count, first, last)));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ("cannot bind socket".to_string(), 2, 100, 200));
        assert_eq!(records[1], ("cannot allocate log buffer".to_string(), 1, 150, 150));
    }

    #[test]
    fn full_log_drops() {
        let mut mem = vec![0u8; 64];
        let mut log = DistinctErrorLog::new(mem.as_mut_ptr(), mem.len());
        assert!(log.record("short", 1));
        assert!(!log.record("this message will not fit in the remaining space", 2));
    }
}
