mod appender;
pub mod descriptor;
mod error;
pub mod frame;
mod rebuilder;
mod scanner;
mod unblocker;

pub use appender::{AppendResult, BufferClaim, TermAppender};
pub use descriptor::LogBuffers;
pub use error::LogBufferError;
pub use frame::HeaderWriter;
pub use rebuilder::{contiguous_offset, insert_packet, scan_for_gap};
pub use scanner::{ScanOutcome, scan_for_availability};
pub use unblocker::unblock_term;
