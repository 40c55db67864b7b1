use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("mapped file does not exist")]
    NonExistingFile,
    #[error("mapped file smaller than requested ({0} < {1})")]
    TooSmall(usize, usize),
    #[error("shmem error")]
    Shmem(#[from] ShmemError),
}

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum RingBufferError {
    #[error("capacity not a power of two")]
    CapacityNotPowerOfTwo,
    #[error("message of {0} bytes exceeds max of {1}")]
    MessageTooLong(usize, usize),
    #[error("message type id {0} is reserved")]
    ReservedTypeId(i32),
    #[error("insufficient capacity")]
    InsufficientCapacity,
}

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum BroadcastError {
    #[error("capacity not a power of two")]
    CapacityNotPowerOfTwo,
    #[error("message of {0} bytes exceeds max of {1}")]
    MessageTooLong(usize, usize),
    #[error("receiver fell behind the transmitter")]
    SpedPast,
}

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum CountersError {
    #[error("counters metadata exhausted")]
    Exhausted,
    #[error("label of {0} bytes exceeds max of {1}")]
    LabelTooLong(usize, usize),
    #[error("counter id {0} is not allocated")]
    NotAllocated(i32),
}
