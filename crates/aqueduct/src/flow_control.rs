use std::net::SocketAddr;

use aqueduct_logbuffer::descriptor::compute_position;
use aqueduct_protocol::{ChannelUri, StatusMessage};
use aqueduct_timing::Nanos;

use crate::context::DriverContext;

/// Strategy turning receiver status messages into the sender's position
/// limit. Implementations are owned by the sender thread; no locking.
pub trait FlowControl: Send {
    #[allow(clippy::too_many_arguments)]
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        src: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        now: Nanos,
    ) -> i64;

    /// Invoked from the zero-bytes-sent branch of the send loop only, so a
    /// busy stream never pays for receiver expiry scans.
    fn on_idle(&mut self, now: Nanos, sender_limit: i64) -> i64;
}

/// Picks the strategy for a channel: unicast tracks the single receiver,
/// multicast takes the minimum across live receivers, and a `tags` param
/// additionally filters which receivers may hold the stream back.
pub fn flow_control_for(uri: &ChannelUri, context: &DriverContext) -> Box<dyn FlowControl> {
    if !uri.is_multicast() {
        return Box::new(UnicastFlowControl);
    }
    let timeout = context.flow_control_receiver_timeout_ns;
    match uri.tags.as_deref().and_then(|t| t.parse::<i64>().ok()) {
        Some(tag) => Box::new(TaggedMulticastFlowControl {
            inner: MinMulticastFlowControl::new(timeout),
            tag,
        }),
        None => Box::new(MinMulticastFlowControl::new(timeout)),
    }
}

/// One receiver: the limit is its consumption position plus its window.
pub struct UnicastFlowControl;

impl FlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        _src: SocketAddr,
        _sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        _now: Nanos,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset as usize,
            position_bits,
            initial_term_id,
        );
        position + sm.receiver_window as i64
    }

    fn on_idle(&mut self, _now: Nanos, sender_limit: i64) -> i64 {
        sender_limit
    }
}

struct ReceiverState {
    receiver_id: i64,
    last_position: i64,
    last_position_plus_window: i64,
    time_of_last_sm: Nanos,
}

/// Minimum across tracked receivers; receivers silent past the timeout stop
/// holding the stream back.
pub struct MinMulticastFlowControl {
    receivers: Vec<ReceiverState>,
    receiver_timeout: Nanos,
}

impl MinMulticastFlowControl {
    pub fn new(receiver_timeout: Nanos) -> Self {
        Self { receivers: Vec::new(), receiver_timeout }
    }

    fn apply(&mut self, sm: &StatusMessage, position: i64, now: Nanos, sender_limit: i64) -> i64 {
        let position_plus_window = position + sm.receiver_window as i64;

        match self.receivers.iter_mut().find(|r| r.receiver_id == sm.receiver_id) {
            Some(receiver) => {
                receiver.last_position = std::cmp::max(receiver.last_position, position);
                receiver.last_position_plus_window = position_plus_window;
                receiver.time_of_last_sm = now;
            }
            None => self.receivers.push(ReceiverState {
                receiver_id: sm.receiver_id,
                last_position: position,
                last_position_plus_window: position_plus_window,
                time_of_last_sm: now,
            }),
        }

        self.min_limit().unwrap_or(std::cmp::max(sender_limit, position_plus_window))
    }

    fn min_limit(&self) -> Option<i64> {
        self.receivers.iter().map(|r| r.last_position_plus_window).min()
    }
}

impl FlowControl for MinMulticastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        _src: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        now: Nanos,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset as usize,
            position_bits,
            initial_term_id,
        );
        self.apply(sm, position, now, sender_limit)
    }

    fn on_idle(&mut self, now: Nanos, sender_limit: i64) -> i64 {
        let timeout = self.receiver_timeout;
        self.receivers.retain(|r| now.saturating_sub(r.time_of_last_sm) <= timeout);
        self.min_limit().unwrap_or(sender_limit)
    }
}

/// Like min, but only receivers carrying the matching feedback tag are
/// allowed to slow the stream.
pub struct TaggedMulticastFlowControl {
    inner: MinMulticastFlowControl,
    tag: i64,
}

impl FlowControl for TaggedMulticastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        src: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        now: Nanos,
    ) -> i64 {
        if sm.feedback != Some(self.tag) {
            return sender_limit;
        }
        self.inner.on_status_message(sm, src, sender_limit, initial_term_id, position_bits, now)
    }

    fn on_idle(&mut self, now: Nanos, sender_limit: i64) -> i64 {
        self.inner.on_idle(now, sender_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sm(receiver_id: i64, term_id: i32, term_offset: i32, window: i32) -> StatusMessage {
        StatusMessage {
            flags: 0,
            session_id: 1,
            stream_id: 10,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
            receiver_id,
            feedback: None,
        }
    }

    fn src() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    const BITS: u32 = 16;

    #[test]
    fn unicast_limit_is_position_plus_window() {
        let mut fc = UnicastFlowControl;
        let limit = fc.on_status_message(&sm(1, 0, 1024, 4096), src(), 0, 0, BITS, Nanos::ZERO);
        assert_eq!(limit, 1024 + 4096);
    }

    #[test]
    fn min_multicast_takes_slowest() {
        let mut fc = MinMulticastFlowControl::new(Nanos::from_secs(2));
        let now = Nanos::from_secs(1);
        fc.on_status_message(&sm(1, 0, 8192, 4096), src(), 0, 0, BITS, now);
        let limit = fc.on_status_message(&sm(2, 0, 1024, 4096), src(), 0, 0, BITS, now);
        assert_eq!(limit, 1024 + 4096);
    }

    #[test]
    fn silent_receiver_expires() {
        let mut fc = MinMulticastFlowControl::new(Nanos::from_secs(2));
        fc.on_status_message(&sm(1, 0, 8192, 4096), src(), 0, 0, BITS, Nanos::from_secs(1));
        fc.on_status_message(&sm(2, 0, 1024, 4096), src(), 0, 0, BITS, Nanos::from_secs(1));

        // receiver 2 goes quiet, receiver 1 keeps reporting
        let limit =
            fc.on_status_message(&sm(1, 0, 16384, 4096), src(), 0, 0, BITS, Nanos::from_secs(4));
        assert_eq!(limit, 1024 + 4096);

        let limit = fc.on_idle(Nanos::from_secs(5), 0);
        assert_eq!(limit, 16384 + 4096);
    }

    #[test]
    fn tagged_ignores_foreign_tags() {
        let mut fc = TaggedMulticastFlowControl {
            inner: MinMulticastFlowControl::new(Nanos::from_secs(2)),
            tag: 42,
        };
        let mut tagged = sm(1, 0, 1024, 4096);
        tagged.feedback = Some(42);
        let mut foreign = sm(2, 0, 64, 4096);
        foreign.feedback = Some(7);

        let limit = fc.on_status_message(&tagged, src(), 0, 0, BITS, Nanos::ZERO);
        assert_eq!(limit, 1024 + 4096);
        let limit = fc.on_status_message(&foreign, src(), limit, 0, BITS, Nanos::ZERO);
        assert_eq!(limit, 1024 + 4096);
    }
}
