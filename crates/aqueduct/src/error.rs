use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("control file version mismatch: found {0:#x}, expected {1:#x}")]
    ControlFileVersion(i32, i32),
    #[error(transparent)]
    Region(#[from] aqueduct_concurrent::RegionError),
    #[error(transparent)]
    RingBuffer(#[from] aqueduct_concurrent::RingBufferError),
    #[error(transparent)]
    Broadcast(#[from] aqueduct_concurrent::BroadcastError),
    #[error(transparent)]
    Counters(#[from] aqueduct_concurrent::CountersError),
    #[error(transparent)]
    LogBuffer(#[from] aqueduct_logbuffer::LogBufferError),
    #[error(transparent)]
    Uri(#[from] aqueduct_protocol::UriError),
    #[error("cannot resolve address '{0}'")]
    UnresolvedAddress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
