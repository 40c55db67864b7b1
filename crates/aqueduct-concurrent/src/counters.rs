use std::{
    collections::VecDeque,
    sync::atomic::{AtomicI32, AtomicI64, Ordering},
};

use aqueduct_utils::CACHE_LINE_LENGTH;

use crate::error::CountersError;

/// One value record per counter, two cache lines so independent writers
/// never share a line.
pub const COUNTER_LENGTH: usize = 2 * CACHE_LINE_LENGTH;

/// One metadata record per counter: state, type id and a label.
pub const METADATA_LENGTH: usize = 4 * CACHE_LINE_LENGTH;

const STATE_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 4;
const LABEL_LENGTH_OFFSET: usize = 8;
const LABEL_OFFSET: usize = 12;
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET;

const RECORD_UNUSED: i32 = 0;
const RECORD_ALLOCATED: i32 = 1;
const RECORD_RECLAIMED: i32 = -1;

/// Allocates and reclaims counters backed by two shared regions: a metadata
/// region browsed by tooling and a values region written on the hot paths.
/// Owned by the driver conductor; readers attach through [`CountersReader`].
pub struct CountersManager {
    metadata_ptr: *mut u8,
    values_ptr: *mut u8,
    max_counters: usize,
    free_list: VecDeque<i32>,
    high_water: i32,
}

unsafe impl Send for CountersManager {}

impl CountersManager {
    pub fn new(metadata_ptr: *mut u8, metadata_length: usize, values_ptr: *mut u8) -> Self {
        Self {
            metadata_ptr,
            values_ptr,
            max_counters: metadata_length / METADATA_LENGTH,
            free_list: VecDeque::new(),
            high_water: 0,
        }
    }

    #[inline]
    fn state(&self, id: i32) -> &AtomicI32 {
        unsafe {
            &*(self.metadata_ptr.add(id as usize * METADATA_LENGTH + STATE_OFFSET)
                as *const AtomicI32)
        }
    }

    #[inline]
    fn value(&self, id: i32) -> &AtomicI64 {
        unsafe { &*(self.values_ptr.add(id as usize * COUNTER_LENGTH) as *const AtomicI64) }
    }

    pub fn allocate(&mut self, type_id: i32, label: &str) -> Result<i32, CountersError> {
        if label.len() > MAX_LABEL_LENGTH {
            return Err(CountersError::LabelTooLong(label.len(), MAX_LABEL_LENGTH));
        }

        // reclaimed ids are reused FIFO so stale readers age out first
        let id = if let Some(id) = self.free_list.pop_front() {
            id
        } else {
            if self.high_water as usize >= self.max_counters {
                return Err(CountersError::Exhausted);
            }
            let id = self.high_water;
            self.high_water += 1;
            id
        };

        let record = unsafe { self.metadata_ptr.add(id as usize * METADATA_LENGTH) };
        unsafe {
            (record.add(TYPE_ID_OFFSET) as *mut i32).write(type_id);
            (record.add(LABEL_LENGTH_OFFSET) as *mut i32).write(label.len() as i32);
            std::ptr::copy_nonoverlapping(label.as_ptr(), record.add(LABEL_OFFSET), label.len());
        }
        self.value(id).store(0, Ordering::Relaxed);
        self.state(id).store(RECORD_ALLOCATED, Ordering::Release);
        Ok(id)
    }

    pub fn free(&mut self, id: i32) {
        if self.state(id).load(Ordering::Relaxed) != RECORD_ALLOCATED {
            return;
        }
        self.state(id).store(RECORD_RECLAIMED, Ordering::Release);
        self.value(id).store(0, Ordering::Release);
        self.free_list.push_back(id);
    }

    /// Writer handle for a counter. Exactly one writer per counter id.
    pub fn position(&self, id: i32) -> Position {
        Position { ptr: self.value(id), id }
    }

    pub fn read_only_position(&self, id: i32) -> ReadOnlyPosition {
        ReadOnlyPosition { ptr: self.value(id), id }
    }

    pub fn reader(&self) -> CountersReader {
        CountersReader {
            metadata_ptr: self.metadata_ptr,
            values_ptr: self.values_ptr,
            max_counters: self.max_counters,
        }
    }
}

/// Read-side view over the counters regions, usable from any process that
/// mapped the control file.
pub struct CountersReader {
    metadata_ptr: *const u8,
    values_ptr: *const u8,
    max_counters: usize,
}

unsafe impl Send for CountersReader {}

impl CountersReader {
    pub fn new(metadata_ptr: *const u8, metadata_length: usize, values_ptr: *const u8) -> Self {
        Self { metadata_ptr, values_ptr, max_counters: metadata_length / METADATA_LENGTH }
    }

    pub fn counter_value(&self, id: i32) -> i64 {
        unsafe {
            (*(self.values_ptr.add(id as usize * COUNTER_LENGTH) as *const AtomicI64))
                .load(Ordering::Acquire)
        }
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(i32, i32, &str, i64),
    {
        for id in 0..self.max_counters as i32 {
            let record = unsafe { self.metadata_ptr.add(id as usize * METADATA_LENGTH) };
            let state =
                unsafe { (*(record.add(STATE_OFFSET) as *const AtomicI32)).load(Ordering::Acquire) };
            if state != RECORD_ALLOCATED {
                continue;
            }
            let type_id = unsafe { (record.add(TYPE_ID_OFFSET) as *const i32).read() };
            let label_length = unsafe { (record.add(LABEL_LENGTH_OFFSET) as *const i32).read() };
            let label = unsafe {
                std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                    record.add(LABEL_OFFSET),
                    label_length as usize,
                ))
            };
            f(id, type_id, label, self.counter_value(id));
        }
    }
}

/// Owned writer over one counter value. Release stores publish, so a reader
/// that observes the value also observes everything written before it.
#[derive(Clone, Copy, Debug)]
pub struct Position {
    ptr: *const AtomicI64,
    id: i32,
}

unsafe impl Send for Position {}
unsafe impl Sync for Position {}

impl Position {
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn get(&self) -> i64 {
        unsafe { (*self.ptr).load(Ordering::Relaxed) }
    }

    #[inline]
    pub fn get_volatile(&self) -> i64 {
        unsafe { (*self.ptr).load(Ordering::Acquire) }
    }

    #[inline]
    pub fn set_ordered(&self, value: i64) {
        unsafe { (*self.ptr).store(value, Ordering::Release) }
    }

    #[inline]
    pub fn set(&self, value: i64) {
        unsafe { (*self.ptr).store(value, Ordering::Relaxed) }
    }

    #[inline]
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        if self.get() < value {
            self.set_ordered(value);
            true
        } else {
            false
        }
    }
}

/// Acquire-loading view over a counter someone else writes.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnlyPosition {
    ptr: *const AtomicI64,
    id: i32,
}

unsafe impl Send for ReadOnlyPosition {}
unsafe impl Sync for ReadOnlyPosition {}

impl ReadOnlyPosition {
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn get_volatile(&self) -> i64 {
        unsafe { (*self.ptr).load(Ordering::Acquire) }
    }
}
