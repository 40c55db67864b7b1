use aqueduct_timing::Nanos;
use rand::Rng;

/// Delay applied before honoring a NAK: zero for unicast, randomized for
/// multicast so a crowd of receivers doesn't trigger a retransmit storm.
#[derive(Clone, Copy, Debug)]
pub enum DelayGenerator {
    Static(Nanos),
    Randomized { max: Nanos },
}

impl DelayGenerator {
    fn next_delay(&self) -> Nanos {
        match self {
            DelayGenerator::Static(delay) => *delay,
            DelayGenerator::Randomized { max } => {
                Nanos(rand::rng().random_range(0..=max.0))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActionState {
    Inactive,
    Delayed,
    Lingering,
}

#[derive(Clone, Copy, Debug)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: i32,
    state: ActionState,
    expiry: Nanos,
}

impl RetransmitAction {
    const fn idle() -> Self {
        Self { term_id: 0, term_offset: 0, length: 0, state: ActionState::Inactive, expiry: Nanos::ZERO }
    }

    fn covers(&self, term_id: i32, term_offset: i32, length: i32) -> bool {
        self.state != ActionState::Inactive &&
            self.term_id == term_id &&
            term_offset >= self.term_offset &&
            term_offset + length <= self.term_offset + self.length
    }
}

const MAX_ACTIVE_RETRANSMITS: usize = 16;

/// Schedules and rate-limits retransmissions. An incoming NAK already
/// covered by an in-flight or lingering action is ignored; otherwise it
/// fires after the generated delay and then lingers to suppress duplicates.
pub struct RetransmitHandler {
    actions: [RetransmitAction; MAX_ACTIVE_RETRANSMITS],
    delay_generator: DelayGenerator,
    linger: Nanos,
}

impl RetransmitHandler {
    pub fn new(delay_generator: DelayGenerator, linger: Nanos) -> Self {
        Self { actions: [RetransmitAction::idle(); MAX_ACTIVE_RETRANSMITS], delay_generator, linger }
    }

    pub fn on_nak<F>(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: i32,
        now: Nanos,
        mut resend: F,
    ) where
        F: FnMut(i32, i32, i32),
    {
        if self.actions.iter().any(|a| a.covers(term_id, term_offset, length)) {
            return;
        }

        let Some(slot) = self.actions.iter_mut().find(|a| a.state == ActionState::Inactive)
        else {
            // all slots busy: drop the NAK, the receiver will ask again
            return;
        };

        let delay = self.delay_generator.next_delay();
        *slot = RetransmitAction {
            term_id,
            term_offset,
            length,
            state: ActionState::Delayed,
            expiry: now + delay,
        };

        if delay == Nanos::ZERO {
            resend(term_id, term_offset, length);
            slot.state = ActionState::Lingering;
            slot.expiry = now + self.linger;
        }
    }

    pub fn process_timeouts<F>(&mut self, now: Nanos, mut resend: F)
    where
        F: FnMut(i32, i32, i32),
    {
        for action in &mut self.actions {
            match action.state {
                ActionState::Delayed if now >= action.expiry => {
                    resend(action.term_id, action.term_offset, action.length);
                    action.state = ActionState::Lingering;
                    action.expiry = now + self.linger;
                }
                ActionState::Lingering if now >= action.expiry => {
                    action.state = ActionState::Inactive;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(delay: Nanos) -> RetransmitHandler {
        RetransmitHandler::new(DelayGenerator::Static(delay), Nanos::from_millis(40))
    }

    #[test]
    fn unicast_fires_immediately_then_lingers() {
        let mut h = handler(Nanos::ZERO);
        let mut fired = Vec::new();
        h.on_nak(1, 0, 1024, Nanos::ZERO, |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired, vec![(1, 0, 1024)]);

        // duplicate within the linger window is suppressed
        h.on_nak(1, 0, 1024, Nanos::from_millis(10), |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired.len(), 1);

        // after linger expiry a new NAK fires again
        h.process_timeouts(Nanos::from_millis(50), |_, _, _| panic!("nothing delayed"));
        h.on_nak(1, 0, 1024, Nanos::from_millis(51), |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn overlapping_range_is_deduplicated() {
        let mut h = handler(Nanos::ZERO);
        let mut fired = Vec::new();
        h.on_nak(1, 0, 4096, Nanos::ZERO, |t, o, l| fired.push((t, o, l)));
        h.on_nak(1, 1024, 512, Nanos::ZERO, |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired.len(), 1);

        // a different term is not covered
        h.on_nak(2, 1024, 512, Nanos::ZERO, |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn delayed_fire_waits_for_expiry() {
        let mut h = handler(Nanos::from_millis(10));
        let mut fired = Vec::new();
        h.on_nak(1, 0, 1024, Nanos::ZERO, |t, o, l| fired.push((t, o, l)));
        assert!(fired.is_empty());

        h.process_timeouts(Nanos::from_millis(5), |t, o, l| fired.push((t, o, l)));
        assert!(fired.is_empty());

        h.process_timeouts(Nanos::from_millis(10), |t, o, l| fired.push((t, o, l)));
        assert_eq!(fired, vec![(1, 0, 1024)]);
    }

    #[test]
    fn randomized_delay_is_bounded() {
        let generator = DelayGenerator::Randomized { max: Nanos::from_millis(60) };
        for _ in 0..100 {
            assert!(generator.next_delay() <= Nanos::from_millis(60));
        }
    }
}
