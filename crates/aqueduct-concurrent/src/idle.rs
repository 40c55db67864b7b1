use aqueduct_timing::Nanos;

/// Wait strategy applied when a duty cycle did zero work. Agents never block
/// on IO; all idling is time-based and resets as soon as work reappears.
#[derive(Clone, Copy, Debug)]
pub enum IdleStrategy {
    BusySpin,
    Yield,
    Sleep(Nanos),
    /// Spins, then yields, then parks with the given period.
    Backoff { max_spins: u32, max_yields: u32, park_period: Nanos },
}

impl IdleStrategy {
    pub const fn default_backoff() -> Self {
        IdleStrategy::Backoff {
            max_spins: 10,
            max_yields: 20,
            park_period: Nanos::from_micros(100),
        }
    }
}

/// Per-thread idle state for one strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct Idler {
    strategy_spins: u32,
    strategy_yields: u32,
}

impl Idler {
    pub fn idle(&mut self, strategy: IdleStrategy, work_count: usize) {
        if work_count > 0 {
            self.strategy_spins = 0;
            self.strategy_yields = 0;
            return;
        }

        match strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yield => std::thread::yield_now(),
            IdleStrategy::Sleep(period) => std::thread::sleep(period.into()),
            IdleStrategy::Backoff { max_spins, max_yields, park_period } => {
                if self.strategy_spins < max_spins {
                    self.strategy_spins += 1;
                    std::hint::spin_loop();
                } else if self.strategy_yields < max_yields {
                    self.strategy_yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(park_period.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_then_resets() {
        let strategy =
            IdleStrategy::Backoff { max_spins: 2, max_yields: 2, park_period: Nanos(1) };
        let mut idler = Idler::default();
        for _ in 0..5 {
            idler.idle(strategy, 0);
        }
        assert_eq!(idler.strategy_spins, 2);
        assert_eq!(idler.strategy_yields, 2);

        idler.idle(strategy, 3);
        assert_eq!(idler.strategy_spins, 0);
        assert_eq!(idler.strategy_yields, 0);
    }
}
