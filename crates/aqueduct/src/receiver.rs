use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use aqueduct_concurrent::OneToOneQueue;
use aqueduct_protocol::{
    DataHeader, FrameFlags, FrameHeader, RttMeasurement, SetupFrame,
    frames::{HDR_TYPE_DATA, HDR_TYPE_PAD, HDR_TYPE_RTTM, HDR_TYPE_SETUP, RTT_MEASUREMENT_LENGTH},
};
use aqueduct_timing::{ClockSource, Nanos};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::warn;

use crate::{
    agent::Agent,
    proxy::{ConductorCommand, ConductorProxy, ReceiverCommand},
    image::PublicationImage,
    system_counters::{SystemCounters, increment},
    udp::ReceiveChannelEndpoint,
};

const COMMAND_LIMIT: usize = 10;

struct EndpointContext {
    token: Token,
    endpoint: Arc<ReceiveChannelEndpoint>,
    /// stream id to subscription refcount
    streams: HashMap<i32, i32>,
    /// (stream id, session id) to image
    images: HashMap<(i32, i32), Arc<PublicationImage>>,
    /// setups already forwarded to the conductor, awaiting an image
    pending_setups: HashSet<(i32, i32)>,
}

/// The receiver agent: polls every receive endpoint, rebuilds inbound
/// streams into their images, elects setups for new images, and pumps each
/// image's status-message and loss (NAK) senders.
pub struct ReceiverAgent {
    commands: Arc<OneToOneQueue<ReceiverCommand>>,
    conductor: ConductorProxy,
    endpoints: Vec<EndpointContext>,
    poll: Poll,
    events: Events,
    next_token: usize,
    recv_buf: Box<[u8; 64 * 1024]>,
    counters: SystemCounters,
    clock: ClockSource,
}

impl ReceiverAgent {
    pub fn new(
        commands: Arc<OneToOneQueue<ReceiverCommand>>,
        conductor: ConductorProxy,
        counters: SystemCounters,
        clock: ClockSource,
    ) -> std::io::Result<Self> {
        Ok(Self {
            commands,
            conductor,
            endpoints: Vec::new(),
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            next_token: 0,
            recv_buf: Box::new([0u8; 64 * 1024]),
            counters,
            clock,
        })
    }

    fn on_command(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::RegisterEndpoint(endpoint) => {
                use std::os::fd::AsRawFd;
                let token = Token(self.next_token);
                self.next_token += 1;
                let fd = endpoint.socket().as_raw_fd();
                if let Err(e) = self.poll.registry().register(
                    &mut SourceFd(&fd),
                    token,
                    Interest::READABLE,
                ) {
                    warn!("couldn't register receive endpoint socket: {e}");
                }
                self.endpoints.push(EndpointContext {
                    token,
                    endpoint,
                    streams: HashMap::new(),
                    images: HashMap::new(),
                    pending_setups: HashSet::new(),
                });
            }
            ReceiverCommand::CloseEndpoint(endpoint) => {
                use std::os::fd::AsRawFd;
                let fd = endpoint.socket().as_raw_fd();
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                self.endpoints.retain(|ctx| !Arc::ptr_eq(&ctx.endpoint, &endpoint));
            }
            ReceiverCommand::AddSubscription { endpoint, stream_id } => {
                if let Some(ctx) = self.context_for(&endpoint) {
                    *ctx.streams.entry(stream_id).or_insert(0) += 1;
                }
            }
            ReceiverCommand::RemoveSubscription { endpoint, stream_id } => {
                if let Some(ctx) = self.context_for(&endpoint) {
                    if let Some(count) = ctx.streams.get_mut(&stream_id) {
                        *count -= 1;
                        if *count <= 0 {
                            ctx.streams.remove(&stream_id);
                        }
                    }
                }
            }
            ReceiverCommand::NewImage(image) => {
                let key = (image.stream_id(), image.session_id());
                if let Some(ctx) = self.context_for(image.endpoint()) {
                    ctx.pending_setups.remove(&key);
                    ctx.images.insert(key, image);
                }
            }
            ReceiverCommand::RemoveImage(image) => {
                let key = (image.stream_id(), image.session_id());
                if let Some(ctx) = self.context_for(image.endpoint()) {
                    ctx.images.remove(&key);
                }
            }
        }
    }

    fn context_for(&mut self, endpoint: &Arc<ReceiveChannelEndpoint>) -> Option<&mut EndpointContext> {
        self.endpoints.iter_mut().find(|ctx| Arc::ptr_eq(&ctx.endpoint, endpoint))
    }

    fn poll_sockets(&mut self) -> usize {
        if let Err(e) = self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                warn!("receiver poll failed: {e}");
            }
            return 0;
        }

        let now = self.clock.now();
        let mut work = 0;
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            let Some(index) = self.endpoints.iter().position(|ctx| ctx.token == token) else {
                aqueduct_utils::safe_panic!("got event for unknown receive endpoint token");
                continue;
            };
            loop {
                let recv = self.endpoints[index].endpoint.socket().recv_from(&mut self.recv_buf[..]);
                match recv {
                    Ok((length, src)) => {
                        work += 1;
                        let ctx = &mut self.endpoints[index];
                        let packet = &self.recv_buf[..length];
                        dispatch_packet(ctx, &mut self.conductor, self.counters, packet, src, now);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("receiver recv failed: {e}");
                        break;
                    }
                }
            }
        }
        work
    }
}

fn dispatch_packet(
    ctx: &mut EndpointContext,
    conductor: &mut ConductorProxy,
    counters: SystemCounters,
    packet: &[u8],
    src: SocketAddr,
    now: Nanos,
) {
    let Ok(header) = FrameHeader::decode(packet) else {
        increment(&counters.invalid_packets);
        return;
    };

    match header.frame_type {
        HDR_TYPE_DATA | HDR_TYPE_PAD => {
            let Ok(data) = DataHeader::decode(packet) else {
                increment(&counters.invalid_packets);
                return;
            };
            if let Some(image) = ctx.images.get(&(data.stream_id, data.session_id)) {
                image.on_data(&data, packet, now);
            }
        }
        HDR_TYPE_SETUP => {
            let Ok(setup) = SetupFrame::decode(packet) else {
                increment(&counters.invalid_packets);
                return;
            };
            let key = (setup.stream_id, setup.session_id);
            if ctx.streams.contains_key(&setup.stream_id) &&
                !ctx.images.contains_key(&key) &&
                !ctx.pending_setups.contains(&key)
            {
                ctx.pending_setups.insert(key);
                conductor.send(ConductorCommand::CreatePublicationImage {
                    endpoint: ctx.endpoint.clone(),
                    setup,
                    control_addr: src,
                    src_addr: src,
                });
            }
        }
        HDR_TYPE_RTTM => {
            let Ok(rtt) = RttMeasurement::decode(packet) else {
                increment(&counters.invalid_packets);
                return;
            };
            if rtt.flags & FrameFlags::REPLY.bits() == 0 {
                let reply = RttMeasurement {
                    flags: FrameFlags::REPLY.bits(),
                    session_id: rtt.session_id,
                    stream_id: rtt.stream_id,
                    echo_timestamp_ns: rtt.echo_timestamp_ns,
                    reception_delta_ns: (now.0 as i64).saturating_sub(rtt.echo_timestamp_ns),
                    receiver_id: rtt.receiver_id,
                };
                let mut buf = [0u8; RTT_MEASUREMENT_LENGTH];
                reply.encode(&mut buf);
                if !ctx.endpoint.send_to(&buf, src) {
                    increment(&counters.short_sends);
                }
            }
        }
        _ => increment(&counters.invalid_packets),
    }
}

impl Agent for ReceiverAgent {
    fn do_work(&mut self) -> usize {
        let mut work = 0;

        for _ in 0..COMMAND_LIMIT {
            let Some(command) = self.commands.poll() else { break };
            self.on_command(command);
            work += 1;
        }

        work += self.poll_sockets();

        let now = self.clock.now();
        for ctx in &self.endpoints {
            for image in ctx.images.values() {
                work += image.send_pending_status_message(now);
                work += image.send_pending_loss(now);
            }
        }
        work += self.conductor.flush();

        work
    }

    fn name(&self) -> &'static str {
        "receiver"
    }
}
