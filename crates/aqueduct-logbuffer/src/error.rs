use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error("term length {0} not a power of two in [{1}, {2}]")]
    InvalidTermLength(usize, usize, usize),
    #[error("mtu {0} not a multiple of frame alignment or out of range")]
    InvalidMtu(usize),
    #[error("log file truncated: {0} < {1} bytes")]
    Truncated(usize, usize),
    #[error(transparent)]
    Region(#[from] aqueduct_concurrent::RegionError),
}
