use std::{
    cell::UnsafeCell,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
};

use arc_swap::ArcSwap;
use aqueduct_concurrent::{Position, ReadOnlyPosition};
use aqueduct_logbuffer::{
    HeaderWriter, LogBuffers, descriptor, scan_for_availability, unblock_term,
};
use aqueduct_protocol::{
    FrameFlags, NakFrame, RttMeasurement, SetupFrame, StatusMessage,
    frames::{CURRENT_VERSION, DATA_HEADER_LENGTH, HDR_TYPE_DATA, RTT_MEASUREMENT_LENGTH, SETUP_LENGTH},
};
use aqueduct_timing::Nanos;

use crate::{
    context::DriverContext,
    flow_control::FlowControl,
    retransmit::RetransmitHandler,
    system_counters::{SystemCounters, add, increment},
    udp::SendChannelEndpoint,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PublicationState {
    Active = 0,
    Draining = 1,
    Linger = 2,
    Closing = 3,
}

impl PublicationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PublicationState::Draining,
            2 => PublicationState::Linger,
            3 => PublicationState::Closing,
            _ => PublicationState::Active,
        }
    }
}

/// State only the sender agent touches, on its own cache lines.
#[repr(C, align(64))]
struct SenderFields {
    flow_control: Box<dyn FlowControl>,
    retransmit: RetransmitHandler,
    has_received_sm: bool,
    setup_elicited: bool,
    time_of_last_setup: Nanos,
    time_of_last_send: Nanos,
}

/// State only the conductor touches, kept off the sender's lines.
#[repr(C, align(64))]
struct ConductorFields {
    ref_count: i32,
    clean_position: i64,
    last_sender_position: i64,
    time_of_last_activity: Nanos,
    linger_deadline: Nanos,
    sender_remove_requested: bool,
}

pub struct PublicationParams {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub mtu_length: usize,
    pub is_exclusive: bool,
    pub ttl: Option<u8>,
}

/// Per-outbound-stream state machine. The sender agent drives the wire side
/// (`send`, control-frame handlers); the conductor drives lifecycle and the
/// publisher limit. The two agents' mutable state lives in disjoint
/// cache-line-aligned field groups.
pub struct NetworkPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: usize,
    position_bits: u32,
    mtu_length: usize,
    term_window_length: usize,
    is_exclusive: bool,
    ttl: Option<u8>,
    log: LogBuffers,
    header_writer: HeaderWriter,
    endpoint: Arc<SendChannelEndpoint>,
    counters: SystemCounters,

    publisher_limit: Position,
    sender_position: Position,
    sender_limit: AtomicI64,

    state: AtomicU8,
    is_connected: AtomicBool,
    has_sender_released: AtomicBool,
    time_of_last_sm: AtomicI64,
    spy_positions: ArcSwap<Vec<ReadOnlyPosition>>,

    unblock_timeout: Nanos,
    connection_timeout: Nanos,
    linger_timeout: Nanos,
    setup_timeout: Nanos,
    heartbeat_timeout: Nanos,

    sender_fields: UnsafeCell<SenderFields>,
    conductor_fields: UnsafeCell<ConductorFields>,
}

// The sender agent is the only caller of sender_fields, the conductor of
// conductor_fields; everything crossing the boundary is atomic or a
// Position.
unsafe impl Send for NetworkPublication {}
unsafe impl Sync for NetworkPublication {}

impl NetworkPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: PublicationParams,
        log: LogBuffers,
        endpoint: Arc<SendChannelEndpoint>,
        flow_control: Box<dyn FlowControl>,
        retransmit: RetransmitHandler,
        publisher_limit: Position,
        sender_position: Position,
        counters: SystemCounters,
        context: &DriverContext,
        now: Nanos,
    ) -> Self {
        Self {
            registration_id: params.registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            term_length: params.term_length,
            position_bits: descriptor::position_bits_to_shift(params.term_length),
            mtu_length: params.mtu_length,
            term_window_length: context.term_window_length(params.term_length),
            is_exclusive: params.is_exclusive,
            ttl: params.ttl,
            header_writer: HeaderWriter::new(params.session_id, params.stream_id),
            log,
            endpoint,
            counters,
            publisher_limit,
            sender_position,
            sender_limit: AtomicI64::new(0),
            state: AtomicU8::new(PublicationState::Active as u8),
            is_connected: AtomicBool::new(false),
            has_sender_released: AtomicBool::new(false),
            time_of_last_sm: AtomicI64::new(0),
            spy_positions: ArcSwap::from_pointee(Vec::new()),
            unblock_timeout: context.publication_unblock_timeout_ns,
            connection_timeout: context.publication_connection_timeout_ns,
            linger_timeout: context.publication_linger_timeout_ns,
            setup_timeout: context.publication_setup_timeout_ns,
            heartbeat_timeout: context.publication_heartbeat_timeout_ns,
            sender_fields: UnsafeCell::new(SenderFields {
                flow_control,
                retransmit,
                has_received_sm: false,
                setup_elicited: false,
                time_of_last_setup: Nanos::ZERO,
                time_of_last_send: now,
            }),
            conductor_fields: UnsafeCell::new(ConductorFields {
                ref_count: 0,
                clean_position: 0,
                last_sender_position: 0,
                time_of_last_activity: now,
                linger_deadline: Nanos::ZERO,
                sender_remove_requested: false,
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn sender_fields(&self) -> &mut SenderFields {
        unsafe { &mut *self.sender_fields.get() }
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
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn mtu_length(&self) -> usize {
        self.mtu_length
    }

    #[inline]
    pub fn endpoint(&self) -> &Arc<SendChannelEndpoint> {
        &self.endpoint
    }

    #[inline]
    pub fn log(&self) -> &LogBuffers {
        &self.log
    }

    #[inline]
    pub fn state(&self) -> PublicationState {
        PublicationState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn publisher_limit_counter_id(&self) -> i32 {
        self.publisher_limit.id()
    }

    #[inline]
    pub fn sender_position_counter_id(&self) -> i32 {
        self.sender_position.id()
    }

    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.log.producer_position()
    }

    #[inline]
    fn is_end_of_stream(&self) -> bool {
        self.state.load(Ordering::Acquire) != PublicationState::Active as u8
    }

    // ---- sender side ----------------------------------------------------

    /// One send duty cycle: setup, data scan, heartbeat, flow-control decay,
    /// scheduled retransmits. Returns bytes put on the wire.
    pub fn send(&self, now: Nanos) -> usize {
        let fields = self.sender_fields();
        let snd_pos = self.sender_position.get();
        let active_term_id =
            descriptor::compute_term_id_from_position(snd_pos, self.position_bits, self.initial_term_id);
        let term_offset = (snd_pos & (self.term_length as i64 - 1)) as usize;

        if (!fields.has_received_sm || fields.setup_elicited) &&
            now.saturating_sub(fields.time_of_last_setup) >= self.setup_timeout
        {
            self.send_setup(fields, now, active_term_id, term_offset);
        }

        let mut bytes_sent = 0;
        let available_window = self.sender_limit.load(Ordering::Acquire) - snd_pos;
        if available_window > 0 {
            let scan_limit = std::cmp::min(available_window as usize, self.mtu_length);
            let index = descriptor::index_by_term(self.initial_term_id, active_term_id);
            let term_ptr = self.log.term_ptr(index);

            let outcome = scan_for_availability(term_ptr, term_offset, scan_limit, self.term_length);
            if outcome.available > 0 {
                let payload = unsafe {
                    std::slice::from_raw_parts(term_ptr.add(term_offset), outcome.available)
                };
                if self.endpoint.send(payload) == 0 {
                    bytes_sent = outcome.available;
                    self.sender_position
                        .set_ordered(snd_pos + (outcome.available + outcome.padding) as i64);
                    fields.time_of_last_send = now;
                    add(&self.counters.bytes_sent, outcome.available as i64);
                } else {
                    increment(&self.counters.short_sends);
                }
            }
        }

        if bytes_sent == 0 {
            if now.saturating_sub(fields.time_of_last_send) >= self.heartbeat_timeout {
                self.send_heartbeat(fields, now, active_term_id, term_offset);
            }
            let current = self.sender_limit.load(Ordering::Acquire);
            let decayed = fields.flow_control.on_idle(now, current);
            if decayed != current {
                self.sender_limit.store(decayed, Ordering::Release);
            }
        }

        let resend = |term_id: i32, term_offset: i32, length: i32| {
            self.resend(term_id, term_offset as usize, length as usize);
        };
        fields.retransmit.process_timeouts(now, resend);

        bytes_sent
    }

    fn send_setup(
        &self,
        fields: &mut SenderFields,
        now: Nanos,
        active_term_id: i32,
        term_offset: usize,
    ) {
        let setup = SetupFrame {
            session_id: self.session_id,
            stream_id: self.stream_id,
            initial_term_id: self.initial_term_id,
            active_term_id,
            term_offset: term_offset as i32,
            term_length: self.term_length as i32,
            mtu_length: self.mtu_length as i32,
            ttl: self.ttl.map_or(0, |t| t as i32),
        };
        let mut buf = [0u8; SETUP_LENGTH];
        setup.encode(&mut buf);
        if self.endpoint.send(&buf) != 0 {
            increment(&self.counters.short_sends);
        }
        fields.time_of_last_setup = now;
        fields.setup_elicited = false;
    }

    fn send_heartbeat(
        &self,
        fields: &mut SenderFields,
        now: Nanos,
        active_term_id: i32,
        term_offset: usize,
    ) {
        let mut buf = [0u8; DATA_HEADER_LENGTH];
        let mut flags = FrameFlags::BEGIN | FrameFlags::END;
        if self.is_end_of_stream() {
            flags |= FrameFlags::EOS;
        }
        buf[4] = CURRENT_VERSION;
        buf[5] = flags.bits();
        buf[6..8].copy_from_slice(&HDR_TYPE_DATA.to_le_bytes());
        buf[8..12].copy_from_slice(&(term_offset as i32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.session_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[20..24].copy_from_slice(&active_term_id.to_le_bytes());

        if self.endpoint.send(&buf) == 0 {
            fields.time_of_last_send = now;
            increment(&self.counters.heartbeats_sent);
        } else {
            increment(&self.counters.short_sends);
        }
    }

    /// Status message from a receiver: refresh liveness, let flow control
    /// move the sender limit.
    pub fn on_status_message(&self, sm: &StatusMessage, src: std::net::SocketAddr, now: Nanos) {
        let fields = self.sender_fields();
        fields.has_received_sm = true;
        if sm.flags & FrameFlags::SEND_SETUP.bits() != 0 {
            fields.setup_elicited = true;
        }

        self.time_of_last_sm.store(now.0 as i64, Ordering::Release);
        if !self.is_connected.swap(true, Ordering::AcqRel) {
            self.log.set_connected(true);
            tracing::debug!(
                session_id = self.session_id,
                stream_id = self.stream_id,
                "publication connected"
            );
        }
        self.log.set_time_of_last_status_message(now.0 as i64);

        let current = self.sender_limit.load(Ordering::Acquire);
        let new_limit = fields.flow_control.on_status_message(
            sm,
            src,
            current,
            self.initial_term_id,
            self.position_bits,
            now,
        );
        self.sender_limit.store(new_limit, Ordering::Release);
        increment(&self.counters.status_messages_received);
    }

    pub fn on_nak(&self, nak: &NakFrame, now: Nanos) {
        increment(&self.counters.naks_received);
        let fields = self.sender_fields();
        let resend = |term_id: i32, term_offset: i32, length: i32| {
            self.resend(term_id, term_offset as usize, length as usize);
        };
        fields.retransmit.on_nak(nak.term_id, nak.term_offset, nak.length, now, resend);
    }

    pub fn on_rtt_measurement(&self, rtt: &RttMeasurement, now: Nanos) {
        if rtt.flags & FrameFlags::REPLY.bits() != 0 {
            return;
        }
        let reply = RttMeasurement {
            flags: FrameFlags::REPLY.bits(),
            session_id: self.session_id,
            stream_id: self.stream_id,
            echo_timestamp_ns: rtt.echo_timestamp_ns,
            reception_delta_ns: (now.0 as i64).saturating_sub(rtt.echo_timestamp_ns),
            receiver_id: rtt.receiver_id,
        };
        let mut buf = [0u8; RTT_MEASUREMENT_LENGTH];
        reply.encode(&mut buf);
        if self.endpoint.send(&buf) != 0 {
            increment(&self.counters.short_sends);
        }
    }

    /// Re-sends committed frames in `[term_offset, term_offset + length)` of
    /// `term_id`, one MTU-bounded datagram at a time.
    fn resend(&self, term_id: i32, mut term_offset: usize, length: usize) {
        let index = descriptor::index_by_term(self.initial_term_id, term_id);
        let term_ptr = self.log.term_ptr(index);
        let end = std::cmp::min(term_offset + length, self.term_length);

        while term_offset < end {
            let max = std::cmp::min(self.mtu_length, end - term_offset);
            let outcome = scan_for_availability(term_ptr, term_offset, max, self.term_length);
            if outcome.available == 0 {
                break;
            }
            let payload =
                unsafe { std::slice::from_raw_parts(term_ptr.add(term_offset), outcome.available) };
            if self.endpoint.send(payload) != 0 {
                increment(&self.counters.short_sends);
                break;
            }
            increment(&self.counters.retransmits_sent);
            term_offset += outcome.available + outcome.padding;
        }
    }

    /// Sender acknowledgement that the publication left its send list.
    pub fn sender_release(&self) {
        self.has_sender_released.store(true, Ordering::Release);
    }

    // ---- conductor side -------------------------------------------------

    pub fn incref(&self) {
        self.conductor_fields().ref_count += 1;
    }

    /// The last publication link dropping moves the stream to DRAINING and
    /// publishes the end-of-stream position.
    pub fn decref(&self, now: Nanos) {
        let fields = self.conductor_fields();
        fields.ref_count -= 1;
        aqueduct_utils::safe_assert!(
            fields.ref_count >= 0,
            "publication {} refcount went negative",
            self.registration_id
        );
        if fields.ref_count == 0 {
            self.log.set_end_of_stream_position(self.producer_position());
            self.state.store(PublicationState::Draining as u8, Ordering::Release);
            fields.time_of_last_activity = now;
            tracing::debug!(registration_id = self.registration_id, "publication draining");
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.conductor_fields().ref_count
    }

    pub fn add_spy_position(&self, position: ReadOnlyPosition) {
        let mut positions: Vec<ReadOnlyPosition> = (**self.spy_positions.load()).clone();
        positions.push(position);
        self.spy_positions.store(Arc::new(positions));
    }

    pub fn remove_spy_position(&self, counter_id: i32) {
        let mut positions: Vec<ReadOnlyPosition> = (**self.spy_positions.load()).clone();
        positions.retain(|p| p.id() != counter_id);
        self.spy_positions.store(Arc::new(positions));
    }

    pub fn has_spies(&self) -> bool {
        !self.spy_positions.load().is_empty()
    }

    /// Conductor duty cycle: raise the publisher limit to
    /// `min(consumer positions) + term window` and opportunistically clean
    /// buffers the consumers have left behind.
    pub fn update_publisher_limit(&self) -> usize {
        let snd_pos = self.sender_position.get_volatile();
        let connected = self.is_connected.load(Ordering::Acquire) || self.has_spies();

        if connected {
            let mut min_position = snd_pos;
            for spy in self.spy_positions.load().iter() {
                min_position = std::cmp::min(min_position, spy.get_volatile());
            }
            let proposed = min_position + self.term_window_length as i64;
            if self.publisher_limit.propose_max_ordered(proposed) {
                self.clean_buffer(min_position);
                return 1;
            }
        } else if self.publisher_limit.get() > snd_pos {
            self.publisher_limit.set_ordered(snd_pos);
            return 1;
        }

        0
    }

    fn clean_buffer(&self, min_consumer_position: i64) {
        let fields = self.conductor_fields();
        let dirty = min_consumer_position - fields.clean_position;
        if dirty > 2 * self.term_length as i64 {
            let clean_term_id = descriptor::compute_term_id_from_position(
                fields.clean_position,
                self.position_bits,
                self.initial_term_id,
            );
            let index = descriptor::index_by_term(self.initial_term_id, clean_term_id);
            let offset =
                descriptor::compute_term_offset_from_position(fields.clean_position, self.position_bits);
            let length = self.term_length - offset;
            unsafe {
                std::ptr::write_bytes(self.log.term_ptr(index).add(offset), 0, length);
            }
            fields.clean_position += length as i64;
        }
    }

    /// Periodic conductor sweep: connection staleness, the unblock policy
    /// and the DRAINING -> LINGER -> CLOSING walk.
    pub fn on_time_event(&self, now: Nanos) {
        if self.is_connected.load(Ordering::Acquire) {
            let last_sm = Nanos(self.time_of_last_sm.load(Ordering::Acquire) as u64);
            if now.saturating_sub(last_sm) > self.connection_timeout {
                self.is_connected.store(false, Ordering::Release);
                self.log.set_connected(false);
                tracing::debug!(
                    registration_id = self.registration_id,
                    "publication lost connection"
                );
            }
        }

        match self.state() {
            PublicationState::Active | PublicationState::Draining => {
                self.check_unblock(now);
                if self.state() == PublicationState::Draining && self.is_drained() {
                    let fields = self.conductor_fields();
                    fields.linger_deadline = now + self.linger_timeout;
                    self.state.store(PublicationState::Linger as u8, Ordering::Release);
                    tracing::debug!(registration_id = self.registration_id, "publication lingering");
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
        let snd_pos = self.sender_position.get_volatile();
        if snd_pos < self.producer_position() {
            return false;
        }
        self.spy_positions.load().iter().all(|spy| spy.get_volatile() >= snd_pos)
    }

    fn check_unblock(&self, now: Nanos) {
        let fields = self.conductor_fields();
        let snd_pos = self.sender_position.get_volatile();

        if snd_pos != fields.last_sender_position {
            fields.last_sender_position = snd_pos;
            fields.time_of_last_activity = now;
            return;
        }

        if self.producer_position() > snd_pos &&
            now.saturating_sub(fields.time_of_last_activity) > self.unblock_timeout
        {
            let term_id = descriptor::compute_term_id_from_position(
                snd_pos,
                self.position_bits,
                self.initial_term_id,
            );
            let index = descriptor::index_by_term(self.initial_term_id, term_id);
            let blocked_offset = (snd_pos & (self.term_length as i64 - 1)) as usize;
            let tail_offset = descriptor::raw_tail_offset(
                self.log.raw_tail_volatile(index),
                self.term_length,
            );

            if unblock_term(
                self.log.term_ptr(index),
                &self.header_writer,
                term_id,
                blocked_offset,
                tail_offset,
            ) {
                increment(&self.counters.unblocked_publications);
                fields.time_of_last_activity = now;
                tracing::info!(
                    registration_id = self.registration_id,
                    position = snd_pos,
                    "unblocked publication"
                );
            }
        }
    }

    /// True once CLOSING and the sender has confirmed it dropped the stream.
    pub fn has_reached_end_of_life(&self) -> bool {
        self.state() == PublicationState::Closing &&
            self.has_sender_released.load(Ordering::Acquire)
    }

    pub fn sender_remove_requested(&self) -> bool {
        self.conductor_fields().sender_remove_requested
    }

    pub fn mark_sender_remove_requested(&self) {
        self.conductor_fields().sender_remove_requested = true;
    }

    /// Matching check for shared (non-exclusive) reuse: requested params must
    /// agree with the live log buffer.
    pub fn params_match(&self, term_length: Option<usize>, mtu: Option<usize>, session_id: Option<i32>) -> bool {
        term_length.is_none_or(|t| t == self.term_length) &&
            mtu.is_none_or(|m| m == self.mtu_length) &&
            session_id.is_none_or(|s| s == self.session_id)
    }

    /// Accepting new links requires an ACTIVE stream.
    pub fn is_accepting_links(&self) -> bool {
        self.state() == PublicationState::Active
    }

    pub fn free_counter_ids(&self) -> [i32; 2] {
        [self.publisher_limit.id(), self.sender_position.id()]
    }

    pub fn close_resources(&self) {
        self.log.unlink();
    }

    #[cfg(test)]
    pub fn sender_limit_for_test(&self) -> i64 {
        self.sender_limit.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn set_sender_limit_for_test(&self, limit: i64) {
        self.sender_limit.store(limit, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use aqueduct_concurrent::{COUNTER_LENGTH, CountersManager, METADATA_LENGTH};
    use aqueduct_logbuffer::TermAppender;
    use aqueduct_protocol::{ChannelUri, frames::HDR_TYPE_SETUP};

    use super::*;
    use crate::retransmit::DelayGenerator;

    struct Fixture {
        publication: Arc<NetworkPublication>,
        manager: CountersManager,
        recv_socket: mio::net::UdpSocket,
        _meta: Vec<u8>,
        _values: Vec<u8>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut context = DriverContext::default();
        context.dir = dir.path().to_path_buf();
        context.term_buffer_length = 64 * 1024;

        let recv_socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = recv_socket.local_addr().unwrap().port();
        let uri =
            ChannelUri::parse(&format!("aqueduct:udp?endpoint=127.0.0.1:{port}")).unwrap();
        let endpoint = Arc::new(SendChannelEndpoint::create(&uri, &context, 0).unwrap());

        let mut meta = vec![0u8; 32 * METADATA_LENGTH];
        let mut values = vec![0u8; 32 * COUNTER_LENGTH];
        let mut manager = CountersManager::new(meta.as_mut_ptr(), meta.len(), values.as_mut_ptr());
        let counters = SystemCounters::allocate(&mut manager).unwrap();
        let limit_id = manager.allocate(1, "pub-lmt").unwrap();
        let snd_pos_id = manager.allocate(1, "snd-pos").unwrap();

        let log = LogBuffers::create(context.publication_log_path(1), 64 * 1024).unwrap();
        log.initialize(0, 0, context.mtu_length, 7, 10, 1);

        let params = PublicationParams {
            registration_id: 1,
            session_id: 7,
            stream_id: 10,
            initial_term_id: 0,
            term_length: 64 * 1024,
            mtu_length: context.mtu_length,
            is_exclusive: false,
            ttl: None,
        };
        let publication = Arc::new(NetworkPublication::new(
            params,
            log,
            endpoint,
            Box::new(crate::flow_control::UnicastFlowControl),
            RetransmitHandler::new(DelayGenerator::Static(Nanos::ZERO), Nanos::from_millis(40)),
            manager.position(limit_id),
            manager.position(snd_pos_id),
            counters,
            &context,
            Nanos::ZERO,
        ));
        Fixture { publication, manager, recv_socket, _meta: meta, _values: values, _dir: dir }
    }

    fn recv_datagram(socket: &mio::net::UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        for _ in 0..1_000_000 {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => return Some(buf[..len].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::hint::spin_loop(),
                Err(_) => return None,
            }
        }
        None
    }

    fn append_frames(publication: &NetworkPublication, count: usize, payload_len: usize) {
        let log = publication.log();
        let raw_tail: &AtomicI64 = log.raw_tail_atomic(0);
        let appender = TermAppender::new(log.term_ptr(0), log.term_length(), raw_tail);
        let header = HeaderWriter::new(7, 10);
        for _ in 0..count {
            assert!(appender.append_unfragmented(&header, &vec![9u8; payload_len], 0) >= 0);
        }
    }

    #[test]
    fn sends_setup_until_status_message() {
        let fx = fixture();
        fx.publication.send(Nanos::from_millis(100));
        let datagram = recv_datagram(&fx.recv_socket).unwrap();
        assert_eq!(datagram.len(), SETUP_LENGTH);
        assert_eq!(
            aqueduct_protocol::FrameHeader::decode(&datagram).unwrap().frame_type,
            HDR_TYPE_SETUP
        );

        let sm = StatusMessage {
            flags: 0,
            session_id: 7,
            stream_id: 10,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window: 4096,
            receiver_id: 1,
            feedback: None,
        };
        fx.publication.on_status_message(&sm, "127.0.0.1:9999".parse().unwrap(), Nanos::from_millis(150));
        assert_eq!(fx.publication.sender_limit_for_test(), 4096);

        // no further setups once a status message arrived
        fx.publication.send(Nanos::from_millis(300));
        let next = recv_datagram(&fx.recv_socket);
        assert!(next.is_none_or(|d| d.len() != SETUP_LENGTH));
    }

    #[test]
    fn sends_committed_frames_and_advances() {
        let fx = fixture();
        append_frames(&fx.publication, 2, 32);
        fx.publication.set_sender_limit_for_test(1024);

        let sent = fx.publication.send(Nanos::from_millis(1));
        assert_eq!(sent, 128);
        assert_eq!(fx.manager.reader().counter_value(fx.publication.sender_position_counter_id()), 128);
    }

    #[test]
    fn heartbeats_when_idle() {
        let fx = fixture();
        let sm = StatusMessage {
            flags: 0,
            session_id: 7,
            stream_id: 10,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window: 0,
            receiver_id: 1,
            feedback: None,
        };
        fx.publication.on_status_message(&sm, "127.0.0.1:9999".parse().unwrap(), Nanos::ZERO);

        fx.publication.send(Nanos::from_millis(200));
        let datagram = recv_datagram(&fx.recv_socket).unwrap();
        let header = aqueduct_protocol::DataHeader::decode(&datagram).unwrap();
        assert!(header.is_heartbeat());
        assert!(!header.is_end_of_stream());
    }

    #[test]
    fn publisher_limit_tracks_consumers() {
        let fx = fixture();
        let publication = &fx.publication;

        // not connected: limit pinned at the sender position
        assert_eq!(publication.update_publisher_limit(), 0);

        let sm = StatusMessage {
            flags: 0,
            session_id: 7,
            stream_id: 10,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window: 4096,
            receiver_id: 1,
            feedback: None,
        };
        publication.on_status_message(&sm, "127.0.0.1:9999".parse().unwrap(), Nanos::ZERO);
        assert_eq!(publication.update_publisher_limit(), 1);
        assert_eq!(
            fx.manager.reader().counter_value(publication.publisher_limit_counter_id()),
            32 * 1024
        );
    }

    #[test]
    fn slow_spy_holds_the_limit() {
        let mut fx = fixture();
        let spy_id = fx.manager.allocate(1, "spy-pos").unwrap();
        let spy_writer = fx.manager.position(spy_id);
        spy_writer.set_ordered(64);
        fx.publication.add_spy_position(fx.manager.read_only_position(spy_id));

        // sender is ahead; the slow spy is the binding consumer
        fx.manager.position(fx.publication.sender_position_counter_id()).set_ordered(1024);

        assert_eq!(fx.publication.update_publisher_limit(), 1);
        assert_eq!(
            fx.manager.reader().counter_value(fx.publication.publisher_limit_counter_id()),
            64 + 32 * 1024
        );
    }

    #[test]
    fn lifecycle_draining_linger_closing() {
        let fx = fixture();
        let publication = &fx.publication;
        publication.incref();
        assert_eq!(publication.state(), PublicationState::Active);

        publication.decref(Nanos::from_secs(1));
        assert_eq!(publication.state(), PublicationState::Draining);
        assert_eq!(publication.log().end_of_stream_position(), 0);

        // nothing unsent: drained immediately
        publication.on_time_event(Nanos::from_secs(1));
        assert_eq!(publication.state(), PublicationState::Linger);

        publication.on_time_event(Nanos::from_secs(2));
        assert_eq!(publication.state(), PublicationState::Linger);

        publication.on_time_event(Nanos::from_secs(7));
        assert_eq!(publication.state(), PublicationState::Closing);

        assert!(!publication.has_reached_end_of_life());
        publication.sender_release();
        assert!(publication.has_reached_end_of_life());
    }

    #[test]
    fn draining_waits_for_unsent_bytes() {
        let fx = fixture();
        let publication = &fx.publication;
        publication.incref();
        append_frames(publication, 1, 32);

        publication.decref(Nanos::from_secs(1));
        publication.on_time_event(Nanos::from_secs(1));
        assert_eq!(publication.state(), PublicationState::Draining);

        // sender catches up, then the stream may linger
        publication.set_sender_limit_for_test(1024);
        publication.send(Nanos::from_secs(1));
        publication.on_time_event(Nanos::from_secs(2));
        assert_eq!(publication.state(), PublicationState::Linger);
    }

    #[test]
    fn unblock_rewrites_stalled_claim() {
        let fx = fixture();
        let publication = &fx.publication;
        let log = publication.log();

        // a producer claims 64 bytes and dies: raw tail advances, frame
        // length stays zero
        log.raw_tail_atomic(0).store(64, Ordering::Release);
        assert_eq!(publication.producer_position(), 64);

        publication.on_time_event(Nanos::from_secs(1));
        // not yet: the unblock timeout hasn't elapsed
        assert_eq!(fx.manager.reader().counter_value(fx.publication.counters.unblocked_publications.id()), 0);

        publication.on_time_event(Nanos::from_secs(12));
        assert_eq!(fx.manager.reader().counter_value(fx.publication.counters.unblocked_publications.id()), 1);

        // idempotent: the padding is committed now
        publication.on_time_event(Nanos::from_secs(30));
        assert_eq!(fx.manager.reader().counter_value(fx.publication.counters.unblocked_publications.id()), 1);

        // sender advances over the padding
        publication.set_sender_limit_for_test(1024);
        publication.send(Nanos::from_secs(30));
        assert_eq!(
            fx.manager.reader().counter_value(publication.sender_position_counter_id()),
            64
        );
    }
}
