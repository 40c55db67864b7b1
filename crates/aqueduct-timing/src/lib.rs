mod clock;
mod nanos;
mod repeater;

pub use clock::{Clock, ClockSource, NanoClock, global_clock, init_global_with_mock};
pub use nanos::Nanos;
pub use repeater::Repeater;
