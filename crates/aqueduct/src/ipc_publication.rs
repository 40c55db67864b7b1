use std::{
    cell::UnsafeCell,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use arc_swap::ArcSwap;
use aqueduct_concurrent::Position;
use aqueduct_logbuffer::{HeaderWriter, LogBuffers, descriptor, unblock_term};
use aqueduct_timing::Nanos;

use crate::{
    context::DriverContext,
    image::SubscriberPosition,
    publication::PublicationState,
    system_counters::{SystemCounters, increment},
};

#[repr(C, align(64))]
struct ConductorFields {
    ref_count: i32,
    last_consumer_position: i64,
    time_of_last_activity: Nanos,
    linger_deadline: Nanos,
}

/// Shared-memory-only publication: the same lifecycle as the network
/// variant minus the wire. Subscribers read the term log directly, so the
/// conductor owns every mutation here.
pub struct IpcPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: usize,
    position_bits: u32,
    term_window_length: usize,
    is_exclusive: bool,
    log: LogBuffers,
    header_writer: HeaderWriter,
    counters: SystemCounters,
    publisher_limit: Position,
    subscriber_positions: ArcSwap<Vec<SubscriberPosition>>,
    state: AtomicU8,
    unblock_timeout: Nanos,
    linger_timeout: Nanos,
    conductor_fields: UnsafeCell<ConductorFields>,
}

// single-threaded conductor owns the UnsafeCell fields
unsafe impl Send for IpcPublication {}
unsafe impl Sync for IpcPublication {}

impl IpcPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        is_exclusive: bool,
        log: LogBuffers,
        publisher_limit: Position,
        counters: SystemCounters,
        context: &DriverContext,
        now: Nanos,
    ) -> Self {
        let term_length = log.term_length();
        Self {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            position_bits: descriptor::position_bits_to_shift(term_length),
            term_window_length: context.term_window_length(term_length),
            is_exclusive,
            header_writer: HeaderWriter::new(session_id, stream_id),
            log,
            counters,
            publisher_limit,
            subscriber_positions: ArcSwap::from_pointee(Vec::new()),
            state: AtomicU8::new(PublicationState::Active as u8),
            unblock_timeout: context.publication_unblock_timeout_ns,
            linger_timeout: context.publication_linger_timeout_ns,
            conductor_fields: UnsafeCell::new(ConductorFields {
                ref_count: 0,
                last_consumer_position: 0,
                time_of_last_activity: now,
                linger_deadline: Nanos::ZERO,
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn conductor_fields(&self) -> &mut ConductorFields {
        unsafe { &mut *self.conductor_fields.get() }
    }

    #[inline]
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    #[inline]
    pub fn log(&self) -> &LogBuffers {
        &self.log
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn state(&self) -> PublicationState {
        match self.state.load(Ordering::Acquire) {
            1 => PublicationState::Draining,
            2 => PublicationState::Linger,
            3 => PublicationState::Closing,
            _ => PublicationState::Active,
        }
    }

    #[inline]
    pub fn publisher_limit_counter_id(&self) -> i32 {
        self.publisher_limit.id()
    }

    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.log.producer_position()
    }

    pub fn incref(&self) {
        self.conductor_fields().ref_count += 1;
    }

    pub fn decref(&self, now: Nanos) {
        let fields = self.conductor_fields();
        fields.ref_count -= 1;
        aqueduct_utils::safe_assert!(
            fields.ref_count >= 0,
            "ipc publication {} refcount went negative",
            self.registration_id
        );
        if fields.ref_count == 0 {
            self.log.set_end_of_stream_position(self.producer_position());
            self.state.store(PublicationState::Draining as u8, Ordering::Release);
            fields.time_of_last_activity = now;
        }
    }

    pub fn is_accepting_links(&self) -> bool {
        self.state() == PublicationState::Active
    }

    pub fn params_match(&self, term_length: Option<usize>, session_id: Option<i32>) -> bool {
        term_length.is_none_or(|t| t == self.term_length) &&
            session_id.is_none_or(|s| s == self.session_id)
    }

    pub fn add_subscriber_position(&self, position: SubscriberPosition) {
        let mut positions: Vec<SubscriberPosition> = (**self.subscriber_positions.load()).clone();
        positions.push(position);
        self.subscriber_positions.store(Arc::new(positions));
        self.log.set_connected(true);
    }

    pub fn remove_subscriber_position(&self, subscription_registration_id: i64) -> Option<i32> {
        let mut positions: Vec<SubscriberPosition> = (**self.subscriber_positions.load()).clone();
        let found = positions
            .iter()
            .position(|s| s.subscription_registration_id == subscription_registration_id)?;
        let removed = positions.remove(found);
        self.subscriber_positions.store(Arc::new(positions));
        if positions_empty(&self.subscriber_positions) {
            self.log.set_connected(false);
        }
        Some(removed.counter_id)
    }

    /// Join position for a new subscriber: the live producer position.
    pub fn join_position(&self) -> i64 {
        self.producer_position()
    }

    fn min_consumer_position(&self) -> Option<i64> {
        self.subscriber_positions.load().iter().map(|s| s.position.get_volatile()).min()
    }

    pub fn update_publisher_limit(&self) -> usize {
        match self.min_consumer_position() {
            Some(min_position) => {
                let proposed = min_position + self.term_window_length as i64;
                usize::from(self.publisher_limit.propose_max_ordered(proposed))
            }
            None => {
                // no consumers: back-pressure at the current producer point
                let producer = self.producer_position();
                if self.publisher_limit.get() != producer {
                    self.publisher_limit.set_ordered(producer);
                    1
                } else {
                    0
                }
            }
        }
    }

    pub fn on_time_event(&self, now: Nanos) {
        match self.state() {
            PublicationState::Active | PublicationState::Draining => {
                self.check_unblock(now);
                if self.state() == PublicationState::Draining && self.is_drained() {
                    self.conductor_fields().linger_deadline = now + self.linger_timeout;
                    self.state.store(PublicationState::Linger as u8, Ordering::Release);
                }
            }
            PublicationState::Linger => {
                if now >= self.conductor_fields().linger_deadline {
                    self.state.store(PublicationState::Closing as u8, Ordering::Release);
                }
            }
            PublicationState::Closing => {}
        }
    }

    fn is_drained(&self) -> bool {
        let eos = self.log.end_of_stream_position();
        self.subscriber_positions.load().iter().all(|s| s.position.get_volatile() >= eos)
    }

    fn check_unblock(&self, now: Nanos) {
        let Some(consumer_position) = self.min_consumer_position() else { return };
        let fields = self.conductor_fields();

        if consumer_position != fields.last_consumer_position {
            fields.last_consumer_position = consumer_position;
            fields.time_of_last_activity = now;
            return;
        }

        if self.producer_position() > consumer_position &&
            now.saturating_sub(fields.time_of_last_activity) > self.unblock_timeout
        {
            let term_id = descriptor::compute_term_id_from_position(
                consumer_position,
                self.position_bits,
                self.initial_term_id,
            );
            let index = descriptor::index_by_term(self.initial_term_id, term_id);
            let blocked_offset = (consumer_position & (self.term_length as i64 - 1)) as usize;
            let tail_offset =
                descriptor::raw_tail_offset(self.log.raw_tail_volatile(index), self.term_length);

            if unblock_term(
                self.log.term_ptr(index),
                &self.header_writer,
                term_id,
                blocked_offset,
                tail_offset,
            ) {
                increment(&self.counters.unblocked_publications);
                fields.time_of_last_activity = now;
            }
        }
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.state() == PublicationState::Closing
    }

    pub fn subscriber_counter_ids(&self) -> Vec<i32> {
        self.subscriber_positions.load().iter().map(|s| s.counter_id).collect()
    }

    pub fn free_counter_ids(&self) -> [i32; 1] {
        [self.publisher_limit.id()]
    }

    pub fn close_resources(&self) {
        self.log.unlink();
    }
}

fn positions_empty(positions: &ArcSwap<Vec<SubscriberPosition>>) -> bool {
    positions.load().is_empty()
}
