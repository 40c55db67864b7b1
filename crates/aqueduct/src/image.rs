use std::{
    cell::UnsafeCell,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering},
    },
};

use arc_swap::ArcSwap;
use aqueduct_concurrent::{Position, ReadOnlyPosition};
use aqueduct_logbuffer::{LogBuffers, contiguous_offset, descriptor, insert_packet, scan_for_gap};
use aqueduct_protocol::{DataHeader, NakFrame, StatusMessage, frames::NAK_LENGTH};
use aqueduct_timing::Nanos;

use crate::{
    context::DriverContext,
    retransmit::DelayGenerator,
    system_counters::{SystemCounters, add, increment},
    udp::ReceiveChannelEndpoint,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageState {
    Active = 0,
    Inactive = 1,
    Linger = 2,
    Done = 3,
}

impl ImageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ImageState::Inactive,
            2 => ImageState::Linger,
            3 => ImageState::Done,
            _ => ImageState::Active,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SubscriberPosition {
    pub subscription_registration_id: i64,
    pub counter_id: i32,
    pub position: ReadOnlyPosition,
}

/// State only the receiver agent touches.
#[repr(C, align(64))]
struct ReceiverFields {
    sm_sent: bool,
    last_sm_position: i64,
    time_of_last_sm: Nanos,
    nak_gap: (i64, i32),
    nak_deadline: Option<Nanos>,
    time_of_last_nak: Nanos,
    scratch: Vec<u8>,
}

/// State only the conductor touches.
#[repr(C, align(64))]
struct ImageConductorFields {
    linger_deadline: Nanos,
    unavailable_sent: bool,
}

/// Receiver-side state for one `(session, stream, source)` tuple: owns the
/// inbound log, the high-water/rebuild positions, NAK generation and status
/// messages. Created by the conductor on the receiver's SETUP election.
pub struct PublicationImage {
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: usize,
    position_bits: u32,
    source_identity: String,
    control_addr: SocketAddr,
    endpoint: Arc<ReceiveChannelEndpoint>,
    log: LogBuffers,
    counters: SystemCounters,
    receiver_id: i64,
    window_length: usize,
    is_reliable: AtomicBool,
    nak_delay: DelayGenerator,
    sm_timeout: Nanos,
    liveness_timeout: Nanos,

    hwm_position: Position,
    rebuild_position: Position,
    subscriber_positions: ArcSwap<Vec<SubscriberPosition>>,

    state: AtomicU8,
    time_of_last_packet: AtomicI64,
    end_of_stream_position: AtomicI64,

    gap_position: AtomicI64,
    gap_length: AtomicI32,
    gap_flag: AtomicBool,

    receiver_fields: UnsafeCell<ReceiverFields>,
    conductor_fields: UnsafeCell<ImageConductorFields>,
}

// receiver_fields is only touched by the receiver agent, conductor_fields
// only by the conductor; the rest is atomic or single-writer positions.
unsafe impl Send for PublicationImage {}
unsafe impl Sync for PublicationImage {}

pub struct ImageParams {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_offset: usize,
    pub term_length: usize,
    pub mtu_length: usize,
    pub source_identity: String,
    pub control_addr: SocketAddr,
    pub is_reliable: bool,
}

impl PublicationImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &ImageParams,
        log: LogBuffers,
        endpoint: Arc<ReceiveChannelEndpoint>,
        hwm_position: Position,
        rebuild_position: Position,
        counters: SystemCounters,
        context: &DriverContext,
        now: Nanos,
    ) -> Self {
        let position_bits = descriptor::position_bits_to_shift(params.term_length);
        let initial_position = descriptor::compute_position(
            params.active_term_id,
            params.term_offset,
            position_bits,
            params.initial_term_id,
        );
        hwm_position.set_ordered(initial_position);
        rebuild_position.set_ordered(initial_position);

        let nak_delay = if endpoint.canonical().contains("control=") ||
            ChannelLooksMulticast::check(endpoint.canonical())
        {
            DelayGenerator::Randomized { max: context.nak_multicast_max_delay_ns }
        } else {
            DelayGenerator::Static(context.nak_unicast_delay_ns)
        };

        Self {
            correlation_id: params.correlation_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            term_length: params.term_length,
            position_bits,
            source_identity: params.source_identity.clone(),
            control_addr: params.control_addr,
            endpoint,
            log,
            counters,
            receiver_id: rand::random(),
            window_length: context.initial_receiver_window(params.term_length),
            is_reliable: AtomicBool::new(params.is_reliable),
            nak_delay,
            sm_timeout: context.status_message_timeout_ns,
            liveness_timeout: context.image_liveness_timeout_ns,
            hwm_position,
            rebuild_position,
            subscriber_positions: ArcSwap::from_pointee(Vec::new()),
            state: AtomicU8::new(ImageState::Active as u8),
            time_of_last_packet: AtomicI64::new(now.0 as i64),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            gap_position: AtomicI64::new(0),
            gap_length: AtomicI32::new(0),
            gap_flag: AtomicBool::new(false),
            receiver_fields: UnsafeCell::new(ReceiverFields {
                sm_sent: false,
                last_sm_position: initial_position,
                time_of_last_sm: Nanos::ZERO,
                nak_gap: (0, 0),
                nak_deadline: None,
                time_of_last_nak: Nanos::ZERO,
                scratch: Vec::with_capacity(64),
            }),
            conductor_fields: UnsafeCell::new(ImageConductorFields {
                linger_deadline: Nanos::ZERO,
                unavailable_sent: false,
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn receiver_fields(&self) -> &mut ReceiverFields {
        unsafe { &mut *self.receiver_fields.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn conductor_fields(&self) -> &mut ImageConductorFields {
        unsafe { &mut *self.conductor_fields.get() }
    }

    #[inline]
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
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
    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    #[inline]
    pub fn endpoint(&self) -> &Arc<ReceiveChannelEndpoint> {
        &self.endpoint
    }

    #[inline]
    pub fn log(&self) -> &LogBuffers {
        &self.log
    }

    #[inline]
    pub fn state(&self) -> ImageState {
        ImageState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn rebuild_position_value(&self) -> i64 {
        self.rebuild_position.get_volatile()
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream_position.load(Ordering::Acquire) != i64::MAX
    }

    // ---- receiver side --------------------------------------------------

    /// Inserts one datagram's frames. Out-of-window packets are counted and
    /// dropped; re-delivery of already-rebuilt bytes is benign.
    pub fn on_data(&self, header: &DataHeader, packet: &[u8], now: Nanos) {
        self.time_of_last_packet.store(now.0 as i64, Ordering::Release);

        let position = descriptor::compute_position(
            header.term_id,
            header.term_offset as usize,
            self.position_bits,
            self.initial_term_id,
        );

        if header.is_heartbeat() {
            increment(&self.counters.heartbeats_received);
            if header.is_end_of_stream() {
                self.end_of_stream_position.store(position, Ordering::Release);
            }
            return;
        }

        let rebuild = self.rebuild_position.get_volatile();
        if position + packet.len() as i64 <= rebuild {
            increment(&self.counters.flow_control_under_runs);
            return;
        }
        if position >= rebuild + self.term_length as i64 {
            increment(&self.counters.flow_control_over_runs);
            return;
        }

        let index = descriptor::index_by_term(self.initial_term_id, header.term_id);
        insert_packet(self.log.term_ptr(index), header.term_offset as usize, packet);
        self.hwm_position.propose_max_ordered(position + packet.len() as i64);
        add(&self.counters.bytes_received, packet.len() as i64);

        if header.is_end_of_stream() {
            self.end_of_stream_position.store(position + packet.len() as i64, Ordering::Release);
        }
    }

    /// Sends a status message when the consumption position has moved a
    /// quarter window or the SM timeout lapsed.
    pub fn send_pending_status_message(&self, now: Nanos) -> usize {
        if self.state() != ImageState::Active {
            return 0;
        }
        let fields = self.receiver_fields();
        let consumption = self.consumption_position();

        let moved = consumption - fields.last_sm_position >= self.window_length as i64 / 4;
        let timed_out = now.saturating_sub(fields.time_of_last_sm) >= self.sm_timeout;
        if fields.sm_sent && !moved && !timed_out {
            return 0;
        }

        let term_id = descriptor::compute_term_id_from_position(
            consumption,
            self.position_bits,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(consumption, self.position_bits);

        let sm = StatusMessage {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset as i32,
            receiver_window: self.window_length as i32,
            receiver_id: self.receiver_id,
            feedback: None,
        };
        fields.scratch.clear();
        sm.encode(&mut fields.scratch);
        if self.endpoint.send_to(&fields.scratch, self.control_addr) {
            increment(&self.counters.status_messages_sent);
            fields.sm_sent = true;
            fields.last_sm_position = consumption;
            fields.time_of_last_sm = now;
            1
        } else {
            increment(&self.counters.short_sends);
            0
        }
    }

    /// Fires a NAK for the conductor-detected gap after the channel's delay;
    /// re-NAKs on the SM cadence while the gap persists.
    pub fn send_pending_loss(&self, now: Nanos) -> usize {
        let fields = self.receiver_fields();

        if self.gap_flag.swap(false, Ordering::AcqRel) {
            let gap = (
                self.gap_position.load(Ordering::Acquire),
                self.gap_length.load(Ordering::Acquire),
            );
            let changed = gap != fields.nak_gap;
            let retry = now.saturating_sub(fields.time_of_last_nak) >= self.sm_timeout;
            if changed || (retry && fields.nak_deadline.is_none()) {
                fields.nak_gap = gap;
                let delay = match self.nak_delay {
                    DelayGenerator::Static(d) => d,
                    DelayGenerator::Randomized { max } => {
                        use rand::Rng;
                        Nanos(rand::rng().random_range(0..=max.0))
                    }
                };
                fields.nak_deadline = Some(now + delay);
            }
        }

        let Some(deadline) = fields.nak_deadline else { return 0 };
        if now < deadline {
            return 0;
        }
        fields.nak_deadline = None;

        let (gap_position, gap_length) = fields.nak_gap;
        let term_id = descriptor::compute_term_id_from_position(
            gap_position,
            self.position_bits,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(gap_position, self.position_bits);

        let nak = NakFrame {
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id,
            term_offset: term_offset as i32,
            length: gap_length,
        };
        let mut buf = [0u8; NAK_LENGTH];
        nak.encode(&mut buf);
        if self.endpoint.send_to(&buf, self.control_addr) {
            increment(&self.counters.naks_sent);
            fields.time_of_last_nak = now;
            1
        } else {
            increment(&self.counters.short_sends);
            0
        }
    }

    // ---- conductor side -------------------------------------------------

    /// Advances the rebuild position over contiguous committed frames and
    /// flags the first gap for the receiver to NAK. Unreliable streams skip
    /// the gap instead.
    pub fn track_rebuild(&self) -> usize {
        let hwm = self.hwm_position.get_volatile();
        let old_rebuild = self.rebuild_position.get();
        let mut rebuild = old_rebuild;

        loop {
            let term_id = descriptor::compute_term_id_from_position(
                rebuild,
                self.position_bits,
                self.initial_term_id,
            );
            let index = descriptor::index_by_term(self.initial_term_id, term_id);
            let offset =
                descriptor::compute_term_offset_from_position(rebuild, self.position_bits);
            let new_offset =
                contiguous_offset(self.log.term_ptr(index), offset, self.term_length);
            rebuild += (new_offset - offset) as i64;
            if new_offset != self.term_length || new_offset == offset {
                break;
            }
        }

        let mut work = 0;
        if rebuild != old_rebuild {
            self.rebuild_position.set_ordered(rebuild);
            work += 1;
        }

        if hwm > rebuild {
            if self.is_reliable.load(Ordering::Acquire) {
                let term_id = descriptor::compute_term_id_from_position(
                    rebuild,
                    self.position_bits,
                    self.initial_term_id,
                );
                let index = descriptor::index_by_term(self.initial_term_id, term_id);
                let offset =
                    descriptor::compute_term_offset_from_position(rebuild, self.position_bits);
                let hwm_offset = std::cmp::min(
                    self.term_length,
                    offset + (hwm - rebuild) as usize,
                );
                if let Some((gap_offset, gap_length)) =
                    scan_for_gap(self.log.term_ptr(index), offset, hwm_offset)
                {
                    let gap_position = rebuild + (gap_offset - offset) as i64;
                    self.gap_position.store(gap_position, Ordering::Release);
                    self.gap_length.store(gap_length as i32, Ordering::Release);
                    self.gap_flag.store(true, Ordering::Release);
                }
            } else {
                // loss accepted: jump the rebuild past the hole
                self.rebuild_position.set_ordered(hwm);
                work += 1;
            }
        }

        work
    }

    /// Liveness sweep: no packets within the timeout, or a drained end of
    /// stream, retires the image.
    pub fn on_time_event(&self, now: Nanos) {
        if self.state() != ImageState::Active {
            return;
        }
        let last_packet = Nanos(self.time_of_last_packet.load(Ordering::Acquire) as u64);
        let timed_out = now.saturating_sub(last_packet) > self.liveness_timeout;
        let drained_eos = self.is_end_of_stream() && self.is_drained();
        if timed_out || drained_eos {
            self.state.store(ImageState::Inactive as u8, Ordering::Release);
        }
    }

    pub fn is_drained(&self) -> bool {
        let target = std::cmp::min(
            self.hwm_position.get_volatile(),
            self.end_of_stream_position.load(Ordering::Acquire),
        );
        self.subscriber_positions.load().iter().all(|s| s.position.get_volatile() >= target)
    }

    pub fn begin_linger(&self, now: Nanos, linger: Nanos) {
        self.conductor_fields().linger_deadline = now + linger;
        self.conductor_fields().unavailable_sent = true;
        self.state.store(ImageState::Linger as u8, Ordering::Release);
    }

    pub fn unavailable_sent(&self) -> bool {
        self.conductor_fields().unavailable_sent
    }

    pub fn linger_expired(&self, now: Nanos) -> bool {
        self.state() == ImageState::Linger && now >= self.conductor_fields().linger_deadline
    }

    pub fn retire(&self) {
        self.state.store(ImageState::Done as u8, Ordering::Release);
    }

    pub fn is_accepting_subscriptions(&self) -> bool {
        self.state() == ImageState::Active
    }

    pub fn add_subscriber_position(&self, position: SubscriberPosition) {
        let mut positions: Vec<SubscriberPosition> = (**self.subscriber_positions.load()).clone();
        positions.push(position);
        self.subscriber_positions.store(Arc::new(positions));
    }

    /// Unlinks a subscription, returning the freed counter id if it was
    /// attached.
    pub fn remove_subscriber_position(&self, subscription_registration_id: i64) -> Option<i32> {
        let mut positions: Vec<SubscriberPosition> = (**self.subscriber_positions.load()).clone();
        let found = positions
            .iter()
            .position(|s| s.subscription_registration_id == subscription_registration_id)?;
        let removed = positions.remove(found);
        self.subscriber_positions.store(Arc::new(positions));
        Some(removed.counter_id)
    }

    pub fn subscriber_counter_ids(&self) -> Vec<i32> {
        self.subscriber_positions.load().iter().map(|s| s.counter_id).collect()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscriber_positions.load().is_empty()
    }

    fn consumption_position(&self) -> i64 {
        self.subscriber_positions
            .load()
            .iter()
            .map(|s| s.position.get_volatile())
            .min()
            .unwrap_or_else(|| self.rebuild_position.get_volatile())
    }

    pub fn hwm_counter_id(&self) -> i32 {
        self.hwm_position.id()
    }

    pub fn rebuild_counter_id(&self) -> i32 {
        self.rebuild_position.id()
    }

    pub fn close_resources(&self) {
        self.log.unlink();
    }
}

/// The canonical form alone tells us whether the stream arrived over
/// multicast.
struct ChannelLooksMulticast;

impl ChannelLooksMulticast {
    fn check(canonical: &str) -> bool {
        canonical
            .split("endpoint=")
            .nth(1)
            .and_then(|e| e.split(':').next())
            .and_then(|host| host.split('.').next())
            .and_then(|first| first.parse::<u8>().ok())
            .is_some_and(|first| (224..=239).contains(&first))
    }
}

#[cfg(test)]
mod tests {
    use aqueduct_concurrent::{COUNTER_LENGTH, CountersManager, METADATA_LENGTH};
    use aqueduct_logbuffer::{HeaderWriter, frame};
    use aqueduct_protocol::{ChannelUri, FrameHeader, frames::HDR_TYPE_NAK};

    use super::*;

    const TERM_LENGTH: usize = 64 * 1024;

    struct Fixture {
        image: Arc<PublicationImage>,
        manager: CountersManager,
        probe_socket: std::net::UdpSocket,
        _meta: Vec<u8>,
        _values: Vec<u8>,
        _dir: tempfile::TempDir,
    }

    fn fixture(reliable: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut context = DriverContext::default();
        context.dir = dir.path().to_path_buf();

        // the probe socket plays the remote sender's control address
        let probe_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe_socket.set_nonblocking(true).unwrap();
        let control_addr = probe_socket.local_addr().unwrap();

        let uri = ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:0").unwrap();
        let endpoint = Arc::new(ReceiveChannelEndpoint::create(&uri, &context, 0).unwrap());

        let mut meta = vec![0u8; 32 * METADATA_LENGTH];
        let mut values = vec![0u8; 32 * COUNTER_LENGTH];
        let mut manager = CountersManager::new(meta.as_mut_ptr(), meta.len(), values.as_mut_ptr());
        let counters = SystemCounters::allocate(&mut manager).unwrap();
        let hwm_id = manager.allocate(1, "rcv-hwm").unwrap();
        let rebuild_id = manager.allocate(1, "rcv-pos").unwrap();

        let log = LogBuffers::create(context.image_log_path(5), TERM_LENGTH).unwrap();
        log.initialize(0, 0, 1408, 77, 10, 5);

        let params = ImageParams {
            correlation_id: 5,
            session_id: 77,
            stream_id: 10,
            initial_term_id: 0,
            active_term_id: 0,
            term_offset: 0,
            term_length: TERM_LENGTH,
            mtu_length: 1408,
            source_identity: control_addr.to_string(),
            control_addr,
            is_reliable: reliable,
        };
        let image = Arc::new(PublicationImage::new(
            &params,
            log,
            endpoint,
            manager.position(hwm_id),
            manager.position(rebuild_id),
            counters,
            &context,
            Nanos::ZERO,
        ));
        Fixture { image, manager, probe_socket, _meta: meta, _values: values, _dir: dir }
    }

    fn data_packet(term_id: i32, term_offset: usize, payload: &[u8]) -> Vec<u8> {
        let writer = HeaderWriter::new(77, 10);
        let mut packet = vec![0u8; frame::HEADER_LENGTH + payload.len()];
        writer.write(packet.as_mut_ptr(), 0, term_id);
        unsafe {
            (packet.as_mut_ptr().add(frame::TERM_OFFSET_OFFSET) as *mut i32)
                .write_unaligned(term_offset as i32);
        }
        packet[frame::HEADER_LENGTH..].copy_from_slice(payload);
        let frame_length = (frame::HEADER_LENGTH + payload.len()) as i32;
        packet[0..4].copy_from_slice(&frame_length.to_le_bytes());
        packet
    }

    fn recv_probe(socket: &std::net::UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 256];
        for _ in 0..1_000_000 {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => return Some(buf[..len].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::hint::spin_loop(),
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn insert_then_rebuild_advances() {
        let fx = fixture(true);
        let packet = data_packet(0, 0, &[1u8; 32]);
        let header = DataHeader::decode(&packet).unwrap();

        fx.image.on_data(&header, &packet, Nanos::from_millis(1));
        assert_eq!(fx.image.track_rebuild(), 1);
        assert_eq!(fx.manager.reader().counter_value(fx.image.rebuild_counter_id()), 64);
        assert_eq!(fx.manager.reader().counter_value(fx.image.hwm_counter_id()), 64);
    }

    #[test]
    fn gap_triggers_nak() {
        let fx = fixture(true);
        let first = data_packet(0, 0, &[1u8; 32]);
        fx.image.on_data(&DataHeader::decode(&first).unwrap(), &first, Nanos::from_millis(1));
        // the frame at offset 64 is lost; offset 128 arrives
        let third = data_packet(0, 128, &[3u8; 32]);
        fx.image.on_data(&DataHeader::decode(&third).unwrap(), &third, Nanos::from_millis(2));

        fx.image.track_rebuild();
        assert_eq!(fx.image.send_pending_loss(Nanos::from_millis(3)), 1);

        let nak_bytes = recv_probe(&fx.probe_socket).unwrap();
        assert_eq!(FrameHeader::decode(&nak_bytes).unwrap().frame_type, HDR_TYPE_NAK);
        let nak = NakFrame::decode(&nak_bytes).unwrap();
        assert_eq!(nak.term_offset, 64);
        assert_eq!(nak.length, 64);

        // the rebuild position holds at the gap
        assert_eq!(fx.manager.reader().counter_value(fx.image.rebuild_counter_id()), 64);
    }

    #[test]
    fn unreliable_skips_the_gap() {
        let fx = fixture(false);
        let first = data_packet(0, 0, &[1u8; 32]);
        fx.image.on_data(&DataHeader::decode(&first).unwrap(), &first, Nanos::from_millis(1));
        let third = data_packet(0, 128, &[3u8; 32]);
        fx.image.on_data(&DataHeader::decode(&third).unwrap(), &third, Nanos::from_millis(2));

        fx.image.track_rebuild();
        assert_eq!(fx.image.send_pending_loss(Nanos::from_millis(3)), 0);
        assert_eq!(fx.manager.reader().counter_value(fx.image.rebuild_counter_id()), 192);
    }

    #[test]
    fn status_message_carries_consumption() {
        let fx = fixture(true);
        let packet = data_packet(0, 0, &[1u8; 32]);
        fx.image.on_data(&DataHeader::decode(&packet).unwrap(), &packet, Nanos::from_millis(1));
        fx.image.track_rebuild();

        assert_eq!(fx.image.send_pending_status_message(Nanos::from_millis(2)), 1);
        let sm_bytes = recv_probe(&fx.probe_socket).unwrap();
        let sm = StatusMessage::decode(&sm_bytes).unwrap();
        assert_eq!(sm.session_id, 77);
        assert_eq!(sm.consumption_term_offset, 64);
        assert!(sm.receiver_window > 0);

        // immediately after, nothing new to report
        assert_eq!(fx.image.send_pending_status_message(Nanos::from_millis(3)), 0);
    }

    #[test]
    fn liveness_timeout_inactivates() {
        let fx = fixture(true);
        fx.image.on_time_event(Nanos::from_secs(5));
        assert_eq!(fx.image.state(), ImageState::Active);

        fx.image.on_time_event(Nanos::from_secs(11));
        assert_eq!(fx.image.state(), ImageState::Inactive);

        fx.image.begin_linger(Nanos::from_secs(11), Nanos::from_secs(5));
        assert!(!fx.image.linger_expired(Nanos::from_secs(12)));
        assert!(fx.image.linger_expired(Nanos::from_secs(17)));
    }

    #[test]
    fn eos_drained_inactivates() {
        let fx = fixture(true);
        let mut packet = data_packet(0, 0, &[1u8; 32]);
        packet[5] |= aqueduct_protocol::FrameFlags::EOS.bits();
        fx.image.on_data(&DataHeader::decode(&packet).unwrap(), &packet, Nanos::from_millis(1));
        assert!(fx.image.is_end_of_stream());

        // a subscriber that has read everything drains the image
        let mut fx2 = fx;
        let sub_id = fx2.manager.allocate(1, "sub-pos").unwrap();
        fx2.manager.position(sub_id).set_ordered(64);
        fx2.image.add_subscriber_position(SubscriberPosition {
            subscription_registration_id: 1,
            counter_id: sub_id,
            position: fx2.manager.read_only_position(sub_id),
        });

        fx2.image.on_time_event(Nanos::from_secs(1));
        assert_eq!(fx2.image.state(), ImageState::Inactive);
    }
}
