pub mod agent;
pub mod conductor;
pub mod context;
pub mod control_file;
pub mod driver;
mod error;
mod error_log;
pub mod flow_control;
pub mod image;
pub mod ipc_publication;
pub mod proxy;
pub mod publication;
pub mod receiver;
pub mod retransmit;
pub mod sender;
pub mod system_counters;
pub mod udp;

pub use context::{DriverContext, ThreadingMode};
pub use driver::MediaDriver;
pub use error::DriverError;
pub use error_log::DistinctErrorLog;
