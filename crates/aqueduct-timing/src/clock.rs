use std::sync::Arc;

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Nanos;

pub type Clock = quanta::Clock;

/// Steady clock used for every driver deadline. Backed by `quanta`, or by a
/// mock when a test installs one before any other thread reads the clock.
#[derive(Clone, Debug)]
pub struct NanoClock {
    inner: Clock,
}

impl NanoClock {
    #[inline]
    pub fn now(&self) -> Nanos {
        // raw() is in tick units; scale to nanos (identity for the mock)
        Nanos(self.inner.delta_as_nanos(0, self.inner.raw()))
    }
}

// might be mocked
static GLOBAL_CLOCK: OnceCell<NanoClock> = OnceCell::new();

#[inline]
pub fn init_global_with_mock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let clock = GLOBAL_CLOCK.get_or_init(|| NanoClock { inner: mock });
    // two threads racing to install different mocks would silently split time
    assert_eq!(
        clock.now(),
        Nanos::ZERO,
        "Do not initialize the global mock clock from 2 different threads"
    );
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static NanoClock {
    GLOBAL_CLOCK.get_or_init(|| NanoClock { inner: Clock::new() })
}

/// Injectable clock handle. Production code reads the global steady clock;
/// tests swap in a hand-cranked source so every timeout is deterministic.
#[derive(Clone)]
pub struct ClockSource(Arc<dyn Fn() -> Nanos + Send + Sync>);

impl ClockSource {
    pub fn new(f: impl Fn() -> Nanos + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        (self.0)()
    }
}

impl Default for ClockSource {
    fn default() -> Self {
        Self(Arc::new(Nanos::now))
    }
}

impl std::fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClockSource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_drives_now() {
        let controller = init_global_with_mock();
        let start = Nanos::now();
        controller.increment(500);
        assert_eq!(Nanos::now() - start, Nanos(500));

        // the default source reads the same mocked global
        let source = ClockSource::default();
        assert!(source.now() >= start);
    }
}
