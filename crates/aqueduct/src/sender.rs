use std::sync::Arc;

use aqueduct_concurrent::OneToOneQueue;
use aqueduct_protocol::{
    FrameHeader, NakFrame, RttMeasurement, StatusMessage,
    frames::{HDR_TYPE_NAK, HDR_TYPE_RTTM, HDR_TYPE_SM},
};
use aqueduct_timing::ClockSource;
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::warn;

use crate::{
    agent::Agent,
    proxy::SenderCommand,
    publication::NetworkPublication,
    system_counters::{SystemCounters, increment},
    udp::SendChannelEndpoint,
};

const COMMAND_LIMIT: usize = 10;

/// The sender agent: applies conductor commands, pumps every network
/// publication's send loop, and polls the send sockets for control traffic
/// (status messages, NAKs, RTT probes) flowing back from receivers.
pub struct SenderAgent {
    commands: Arc<OneToOneQueue<SenderCommand>>,
    publications: Vec<Arc<NetworkPublication>>,
    endpoints: Vec<(Token, Arc<SendChannelEndpoint>)>,
    poll: Poll,
    events: Events,
    next_token: usize,
    recv_buf: Box<[u8; 64 * 1024]>,
    counters: SystemCounters,
    clock: ClockSource,
}

impl SenderAgent {
    pub fn new(
        commands: Arc<OneToOneQueue<SenderCommand>>,
        counters: SystemCounters,
        clock: ClockSource,
    ) -> std::io::Result<Self> {
        Ok(Self {
            commands,
            publications: Vec::new(),
            endpoints: Vec::new(),
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            next_token: 0,
            recv_buf: Box::new([0u8; 64 * 1024]),
            counters,
            clock,
        })
    }

    fn on_command(&mut self, command: SenderCommand) {
        match command {
            SenderCommand::RegisterEndpoint(endpoint) => {
                use std::os::fd::AsRawFd;
                let token = Token(self.next_token);
                self.next_token += 1;
                let fd = endpoint.socket().as_raw_fd();
                if let Err(e) = self.poll.registry().register(
                    &mut SourceFd(&fd),
                    token,
                    Interest::READABLE,
                ) {
                    warn!("couldn't register send endpoint socket: {e}");
                }
                self.endpoints.push((token, endpoint));
            }
            SenderCommand::CloseEndpoint(endpoint) => {
                use std::os::fd::AsRawFd;
                let fd = endpoint.socket().as_raw_fd();
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                self.endpoints.retain(|(_, e)| !Arc::ptr_eq(e, &endpoint));
            }
            SenderCommand::NewPublication(publication) => self.publications.push(publication),
            SenderCommand::RemovePublication(publication) => {
                self.publications.retain(|p| !Arc::ptr_eq(p, &publication));
                publication.sender_release();
            }
            SenderCommand::AddDestination { endpoint, addr } => endpoint.add_destination(addr),
            SenderCommand::RemoveDestination { endpoint, addr } => {
                endpoint.remove_destination(addr)
            }
        }
    }

    fn poll_control_messages(&mut self) -> usize {
        if let Err(e) = self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                warn!("sender poll failed: {e}");
            }
            return 0;
        }

        let now = self.clock.now();
        let mut work = 0;
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            let Some(endpoint) =
                self.endpoints.iter().find(|(t, _)| *t == token).map(|(_, e)| e.clone())
            else {
                aqueduct_utils::safe_panic!("got event for unknown send endpoint token");
                continue;
            };
            loop {
                match endpoint.socket().recv_from(&mut self.recv_buf[..]) {
                    Ok((length, src)) => {
                        work += 1;
                        let packet = &self.recv_buf[..length];
                        self.dispatch_control(packet, src, now);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("sender recv failed: {e}");
                        break;
                    }
                }
            }
        }
        work
    }

    fn dispatch_control(&self, packet: &[u8], src: std::net::SocketAddr, now: aqueduct_timing::Nanos) {
        let Ok(header) = FrameHeader::decode(packet) else {
            increment(&self.counters.invalid_packets);
            return;
        };

        match header.frame_type {
            HDR_TYPE_SM => {
                let Ok(sm) = StatusMessage::decode(packet) else {
                    increment(&self.counters.invalid_packets);
                    return;
                };
                if let Some(publication) = self.find(sm.session_id, sm.stream_id) {
                    publication.on_status_message(&sm, src, now);
                }
            }
            HDR_TYPE_NAK => {
                let Ok(nak) = NakFrame::decode(packet) else {
                    increment(&self.counters.invalid_packets);
                    return;
                };
                if let Some(publication) = self.find(nak.session_id, nak.stream_id) {
                    publication.on_nak(&nak, now);
                }
            }
            HDR_TYPE_RTTM => {
                let Ok(rtt) = RttMeasurement::decode(packet) else {
                    increment(&self.counters.invalid_packets);
                    return;
                };
                if let Some(publication) = self.find(rtt.session_id, rtt.stream_id) {
                    publication.on_rtt_measurement(&rtt, now);
                }
            }
            _ => increment(&self.counters.invalid_packets),
        }
    }

    fn find(&self, session_id: i32, stream_id: i32) -> Option<&Arc<NetworkPublication>> {
        self.publications
            .iter()
            .find(|p| p.session_id() == session_id && p.stream_id() == stream_id)
    }
}

impl Agent for SenderAgent {
    fn do_work(&mut self) -> usize {
        let mut work = 0;

        for _ in 0..COMMAND_LIMIT {
            let Some(command) = self.commands.poll() else { break };
            self.on_command(command);
            work += 1;
        }

        work += self.poll_control_messages();

        let now = self.clock.now();
        for publication in &self.publications {
            work += publication.send(now);
        }

        work
    }

    fn name(&self) -> &'static str {
        "sender"
    }
}
