use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use aqueduct_concurrent::{
    BroadcastTransmitter, CountersManager, ManyToOneQueue, ManyToOneRingBuffer, Position,
};
use aqueduct_logbuffer::{LogBuffers, descriptor};
use aqueduct_protocol::{
    ChannelUri, DestinationMessage, ErrorCode, ErrorResponse, ImageMessage, ImageReady,
    OperationSucceeded, PublicationMessage, PublicationReady, RemoveMessage, SetupFrame,
    SubscriptionMessage, SubscriptionReady, command_type, response_type,
};
use aqueduct_timing::{Nanos, Repeater};
use tracing::{debug, info, warn};

use crate::{
    agent::Agent,
    context::DriverContext,
    error_log::DistinctErrorLog,
    flow_control::flow_control_for,
    image::{ImageParams, ImageState, PublicationImage, SubscriberPosition},
    ipc_publication::IpcPublication,
    proxy::{ConductorCommand, ReceiverCommand, ReceiverProxy, SenderCommand, SenderProxy},
    publication::{NetworkPublication, PublicationParams, PublicationState},
    retransmit::{DelayGenerator, RetransmitHandler},
    system_counters::{SystemCounters, increment},
    udp::{ReceiveChannelEndpoint, SendChannelEndpoint},
};

pub const SPY_PREFIX: &str = "aqueduct-spy:";

const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
const SENDER_POSITION_TYPE_ID: i32 = 2;
const RECEIVER_HWM_TYPE_ID: i32 = 3;
const RECEIVER_POSITION_TYPE_ID: i32 = 4;
const SUBSCRIBER_POSITION_TYPE_ID: i32 = 5;
const CHANNEL_STATUS_TYPE_ID: i32 = 6;
const CLIENT_HEARTBEAT_TYPE_ID: i32 = 7;

struct ClientSession {
    client_id: i64,
    deadline: Nanos,
    heartbeat: Position,
}

enum PublicationTarget {
    Network(Arc<NetworkPublication>),
    Ipc(Arc<IpcPublication>),
}

struct PublicationLink {
    registration_id: i64,
    client_id: i64,
    target: PublicationTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriptionKind {
    Network,
    Ipc,
    Spy,
}

struct LinkedPosition {
    target_id: i64,
    counter_id: i32,
}

struct SubscriptionLink {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    channel: String,
    canonical: String,
    kind: SubscriptionKind,
    reliable: bool,
    endpoint: Option<Arc<ReceiveChannelEndpoint>>,
    positions: Vec<LinkedPosition>,
}

/// Encodes and broadcasts driver to client responses.
struct ClientProxy {
    transmitter: BroadcastTransmitter,
    scratch: Vec<u8>,
}

impl ClientProxy {
    fn transmit(&mut self, response_type: i32) {
        if let Err(e) = self.transmitter.transmit(response_type, &self.scratch) {
            warn!("couldn't transmit client response: {e}");
        }
        self.scratch.clear();
    }

    fn on_error(&mut self, correlation_id: i64, code: ErrorCode, message: &str) {
        ErrorResponse {
            offending_correlation_id: correlation_id,
            error_code: code as i32,
            message: message.to_string(),
        }
        .encode(&mut self.scratch);
        self.transmit(response_type::ON_ERROR);
    }

    fn operation_succeeded(&mut self, correlation_id: i64) {
        OperationSucceeded { correlation_id }.encode(&mut self.scratch);
        self.transmit(response_type::ON_OPERATION_SUCCESS);
    }

    fn publication_ready(&mut self, ready: &PublicationReady, exclusive: bool) {
        ready.encode(&mut self.scratch);
        self.transmit(if exclusive {
            response_type::ON_EXCLUSIVE_PUBLICATION_READY
        } else {
            response_type::ON_PUBLICATION_READY
        });
    }

    fn subscription_ready(&mut self, ready: &SubscriptionReady) {
        ready.encode(&mut self.scratch);
        self.transmit(response_type::ON_SUBSCRIPTION_READY);
    }

    fn available_image(&mut self, image: &ImageReady) {
        image.encode(&mut self.scratch);
        self.transmit(response_type::ON_AVAILABLE_IMAGE);
    }

    fn unavailable_image(&mut self, message: &ImageMessage) {
        message.encode(&mut self.scratch);
        self.transmit(response_type::ON_UNAVAILABLE_IMAGE);
    }
}

/// Single-threaded orchestrator: drains client commands, reacts to
/// sender/receiver events, runs the timer sweep over every managed
/// resource, and keeps publisher limits and rebuild positions moving.
pub struct DriverConductor {
    context: DriverContext,
    to_driver: ManyToOneRingBuffer,
    clients_proxy: ClientProxy,
    counters_manager: CountersManager,
    system: SystemCounters,
    error_log: DistinctErrorLog,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    conductor_queue: Arc<ManyToOneQueue<ConductorCommand>>,

    clients: Vec<ClientSession>,
    publications: Vec<Arc<NetworkPublication>>,
    ipc_publications: Vec<Arc<IpcPublication>>,
    images: Vec<Arc<PublicationImage>>,
    publication_links: Vec<PublicationLink>,
    subscription_links: Vec<SubscriptionLink>,
    send_endpoints: HashMap<String, Arc<SendChannelEndpoint>>,
    receive_endpoints: HashMap<String, Arc<ReceiveChannelEndpoint>>,

    next_session_id: i32,
    timer: Repeater,
    last_consumer_position: i64,
    time_of_last_consumer_move: Nanos,
}

impl DriverConductor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: DriverContext,
        to_driver: ManyToOneRingBuffer,
        to_clients: BroadcastTransmitter,
        counters_manager: CountersManager,
        system: SystemCounters,
        error_log: DistinctErrorLog,
        sender_proxy: SenderProxy,
        receiver_proxy: ReceiverProxy,
        conductor_queue: Arc<ManyToOneQueue<ConductorCommand>>,
    ) -> Self {
        let timer = Repeater::every(context.timer_interval_ns);
        Self {
            context,
            to_driver,
            clients_proxy: ClientProxy { transmitter: to_clients, scratch: Vec::new() },
            counters_manager,
            system,
            error_log,
            sender_proxy,
            receiver_proxy,
            conductor_queue,
            clients: Vec::new(),
            publications: Vec::new(),
            ipc_publications: Vec::new(),
            images: Vec::new(),
            publication_links: Vec::new(),
            subscription_links: Vec::new(),
            send_endpoints: HashMap::new(),
            receive_endpoints: HashMap::new(),
            next_session_id: rand::random(),
            timer,
            last_consumer_position: 0,
            time_of_last_consumer_move: Nanos::ZERO,
        }
    }

    pub fn do_conductor_work(&mut self) -> usize {
        let now = self.context.clock.now();
        let mut work = 0;

        work += self.drain_client_commands(now);
        work += self.drain_conductor_queue(now);
        work += self.sender_proxy.flush();
        work += self.receiver_proxy.flush();

        if self.timer.fired(now) {
            self.on_timer(now);
            work += 1;
        }

        for image in &self.images {
            work += image.track_rebuild();
        }
        for publication in &self.publications {
            work += publication.update_publisher_limit();
        }
        for publication in &self.ipc_publications {
            work += publication.update_publisher_limit();
        }

        work
    }

    fn drain_client_commands(&mut self, now: Nanos) -> usize {
        let ring = self.to_driver;
        let limit = self.context.command_drain_limit;
        ring.read(limit, |msg_type, msg| self.dispatch_client_command(msg_type, msg, now))
    }

    fn drain_conductor_queue(&mut self, now: Nanos) -> usize {
        let queue = self.conductor_queue.clone();
        queue.drain(self.context.command_drain_limit, |command| match command {
            ConductorCommand::CreatePublicationImage { endpoint, setup, control_addr, src_addr } => {
                self.on_create_publication_image(&endpoint, &setup, control_addr, src_addr, now);
            }
        })
    }

    fn dispatch_client_command(&mut self, msg_type: i32, msg: &[u8], now: Nanos) {
        let outcome = match msg_type {
            command_type::ADD_PUBLICATION => PublicationMessage::decode(msg)
                .map(|m| self.on_add_publication(&m, false, now)),
            command_type::ADD_EXCLUSIVE_PUBLICATION => PublicationMessage::decode(msg)
                .map(|m| self.on_add_publication(&m, true, now)),
            command_type::REMOVE_PUBLICATION => {
                RemoveMessage::decode(msg).map(|m| self.on_remove_publication(&m, now))
            }
            command_type::ADD_SUBSCRIPTION => {
                SubscriptionMessage::decode(msg).map(|m| self.on_add_subscription(&m, now))
            }
            command_type::REMOVE_SUBSCRIPTION => {
                RemoveMessage::decode(msg).map(|m| self.on_remove_subscription(&m, now))
            }
            command_type::CLIENT_KEEPALIVE => aqueduct_protocol::CorrelatedMessage::decode(msg)
                .map(|m| self.on_client_keepalive(m.client_id, now)),
            command_type::CLIENT_CLOSE => aqueduct_protocol::CorrelatedMessage::decode(msg)
                .map(|m| self.on_client_close(m.client_id)),
            command_type::ADD_DESTINATION => {
                DestinationMessage::decode(msg).map(|m| self.on_destination(&m, true, now))
            }
            command_type::REMOVE_DESTINATION => {
                DestinationMessage::decode(msg).map(|m| self.on_destination(&m, false, now))
            }
            other => {
                self.record_error(now, &format!("unknown command type: {other}"));
                Ok(())
            }
        };

        if let Err(e) = outcome {
            self.record_error(now, &format!("malformed command {msg_type}: {e}"));
        }
    }

    fn record_error(&mut self, now: Nanos, message: &str) {
        increment(&self.system.errors);
        self.error_log.record(message, now.as_millis_u64() as i64);
        warn!("{message}");
    }

    // ---- clients --------------------------------------------------------

    fn ensure_client(&mut self, client_id: i64, now: Nanos) {
        let deadline = now + self.context.client_liveness_timeout_ns;
        match self.clients.iter_mut().find(|c| c.client_id == client_id) {
            Some(client) => client.deadline = deadline,
            None => {
                let heartbeat = self
                    .counters_manager
                    .allocate(CLIENT_HEARTBEAT_TYPE_ID, &format!("client-heartbeat: {client_id}"))
                    .map(|id| self.counters_manager.position(id));
                let Ok(heartbeat) = heartbeat else {
                    self.record_error(now, "cannot allocate client heartbeat counter");
                    return;
                };
                heartbeat.set_ordered(now.as_millis_u64() as i64);
                info!(client_id, "new client session");
                self.clients.push(ClientSession { client_id, deadline, heartbeat });
            }
        }
    }

    fn on_client_keepalive(&mut self, client_id: i64, now: Nanos) {
        self.ensure_client(client_id, now);
        if let Some(client) = self.clients.iter().find(|c| c.client_id == client_id) {
            client.heartbeat.set_ordered(now.as_millis_u64() as i64);
        }
    }

    /// Orderly client exit: expire the session so the next sweep reaps its
    /// resources through the normal timeout path.
    fn on_client_close(&mut self, client_id: i64) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) {
            client.deadline = Nanos::ZERO;
        }
    }

    // ---- publications ---------------------------------------------------

    fn next_session_id(&mut self, canonical: &str, stream_id: i32) -> i32 {
        loop {
            let candidate = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            let in_use = self.publications.iter().any(|p| {
                p.session_id() == candidate &&
                    p.stream_id() == stream_id &&
                    p.endpoint().canonical() == canonical
            });
            if !in_use {
                return candidate;
            }
        }
    }

    fn on_add_publication(&mut self, msg: &PublicationMessage, exclusive: bool, now: Nanos) {
        self.ensure_client(msg.client_id, now);

        let uri = match ChannelUri::parse(&msg.channel) {
            Ok(uri) => uri,
            Err(e) => {
                self.clients_proxy.on_error(
                    msg.correlation_id,
                    ErrorCode::InvalidChannel,
                    &e.to_string(),
                );
                return;
            }
        };

        if uri.is_ipc() {
            self.add_ipc_publication(msg, &uri, exclusive, now);
        } else {
            self.add_network_publication(msg, &uri, exclusive, now);
        }
    }

    fn add_network_publication(
        &mut self,
        msg: &PublicationMessage,
        uri: &ChannelUri,
        exclusive: bool,
        now: Nanos,
    ) {
        let canonical = uri.canonical_form();

        if !exclusive {
            let existing = self.publications.iter().find(|p| {
                !p.is_exclusive() &&
                    p.stream_id() == msg.stream_id &&
                    p.endpoint().canonical() == canonical &&
                    p.is_accepting_links()
            });
            if let Some(publication) = existing.cloned() {
                if !publication.params_match(uri.term_length, uri.mtu, uri.session_id) {
                    self.clients_proxy.on_error(
                        msg.correlation_id,
                        ErrorCode::Generic,
                        "requested params differ from existing publication",
                    );
                    return;
                }
                publication.incref();
                self.publication_links.push(PublicationLink {
                    registration_id: msg.correlation_id,
                    client_id: msg.client_id,
                    target: PublicationTarget::Network(publication.clone()),
                });
                let ready = PublicationReady {
                    correlation_id: msg.correlation_id,
                    registration_id: publication.registration_id(),
                    session_id: publication.session_id(),
                    stream_id: publication.stream_id(),
                    publication_limit_counter_id: publication.publisher_limit_counter_id(),
                    channel_status_counter_id: publication.endpoint().status_counter_id(),
                    log_file: self
                        .context
                        .publication_log_path(publication.registration_id())
                        .to_string_lossy()
                        .into_owned(),
                };
                self.clients_proxy.publication_ready(&ready, false);
                return;
            }
        }

        let endpoint = match self.get_or_create_send_endpoint(uri, &canonical, now) {
            Ok(endpoint) => endpoint,
            Err(message) => {
                self.clients_proxy.on_error(msg.correlation_id, ErrorCode::Generic, &message);
                return;
            }
        };

        let term_length = uri.term_length.unwrap_or(self.context.term_buffer_length);
        if let Err(e) = descriptor::check_term_length(term_length) {
            self.clients_proxy.on_error(msg.correlation_id, ErrorCode::InvalidChannel, &e.to_string());
            return;
        }
        let mtu_length = uri.mtu.unwrap_or(self.context.mtu_length);

        let registration_id = msg.correlation_id;
        let session_id =
            uri.session_id.unwrap_or_else(|| self.next_session_id(&canonical, msg.stream_id));
        let initial_term_id = uri.initial_term_id.unwrap_or_else(rand::random);

        let log = match LogBuffers::create(
            self.context.publication_log_path(registration_id),
            term_length,
        ) {
            Ok(log) => log,
            Err(e) => {
                self.record_error(now, &format!("cannot allocate log buffer: {e}"));
                self.clients_proxy.on_error(msg.correlation_id, ErrorCode::StorageSpace, &e.to_string());
                return;
            }
        };
        log.initialize(
            initial_term_id,
            initial_term_id,
            mtu_length,
            session_id,
            msg.stream_id,
            registration_id,
        );

        let label_suffix =
            format!("{registration_id} {session_id} {} {}", msg.stream_id, msg.channel);
        let Ok(limit_id) = self
            .counters_manager
            .allocate(PUBLISHER_LIMIT_TYPE_ID, &format!("pub-lmt: {label_suffix}"))
        else {
            self.clients_proxy.on_error(msg.correlation_id, ErrorCode::Generic, "counters exhausted");
            return;
        };
        let Ok(snd_pos_id) = self
            .counters_manager
            .allocate(SENDER_POSITION_TYPE_ID, &format!("snd-pos: {label_suffix}"))
        else {
            self.counters_manager.free(limit_id);
            self.clients_proxy.on_error(msg.correlation_id, ErrorCode::Generic, "counters exhausted");
            return;
        };

        let delay_generator = if uri.is_multicast() {
            DelayGenerator::Randomized { max: self.context.nak_multicast_max_delay_ns }
        } else {
            DelayGenerator::Static(Nanos::ZERO)
        };

        let publication = Arc::new(NetworkPublication::new(
            PublicationParams {
                registration_id,
                session_id,
                stream_id: msg.stream_id,
                initial_term_id,
                term_length,
                mtu_length,
                is_exclusive: exclusive,
                ttl: uri.ttl,
            },
            log,
            endpoint.clone(),
            flow_control_for(uri, &self.context),
            RetransmitHandler::new(delay_generator, self.context.retransmit_linger_timeout_ns),
            self.counters_manager.position(limit_id),
            self.counters_manager.position(snd_pos_id),
            self.system,
            &self.context,
            now,
        ));

        endpoint.incref();
        publication.incref();
        self.link_spies_to_publication(&publication);

        self.publication_links.push(PublicationLink {
            registration_id: msg.correlation_id,
            client_id: msg.client_id,
            target: PublicationTarget::Network(publication.clone()),
        });
        self.sender_proxy.send(SenderCommand::NewPublication(publication.clone()));
        self.publications.push(publication.clone());

        debug!(
            registration_id,
            session_id,
            stream_id = msg.stream_id,
            channel = %msg.channel,
            "network publication added"
        );

        let ready = PublicationReady {
            correlation_id: msg.correlation_id,
            registration_id,
            session_id,
            stream_id: msg.stream_id,
            publication_limit_counter_id: limit_id,
            channel_status_counter_id: endpoint.status_counter_id(),
            log_file: self
                .context
                .publication_log_path(registration_id)
                .to_string_lossy()
                .into_owned(),
        };
        self.clients_proxy.publication_ready(&ready, exclusive);
    }

    fn add_ipc_publication(
        &mut self,
        msg: &PublicationMessage,
        uri: &ChannelUri,
        exclusive: bool,
        now: Nanos,
    ) {
        if !exclusive {
            let existing = self.ipc_publications.iter().find(|p| {
                !p.is_exclusive() && p.stream_id() == msg.stream_id && p.is_accepting_links()
            });
            if let Some(publication) = existing.cloned() {
                if !publication.params_match(uri.term_length, uri.session_id) {
                    self.clients_proxy.on_error(
                        msg.correlation_id,
                        ErrorCode::Generic,
                        "requested params differ from existing publication",
                    );
                    return;
                }
                publication.incref();
                self.publication_links.push(PublicationLink {
                    registration_id: msg.correlation_id,
                    client_id: msg.client_id,
                    target: PublicationTarget::Ipc(publication.clone()),
                });
                let ready = PublicationReady {
                    correlation_id: msg.correlation_id,
                    registration_id: publication.registration_id(),
                    session_id: publication.session_id(),
                    stream_id: publication.stream_id(),
                    publication_limit_counter_id: publication.publisher_limit_counter_id(),
                    channel_status_counter_id: -1,
                    log_file: self
                        .context
                        .publication_log_path(publication.registration_id())
                        .to_string_lossy()
                        .into_owned(),
                };
                self.clients_proxy.publication_ready(&ready, false);
                return;
            }
        }

        let term_length = uri.term_length.unwrap_or(self.context.ipc_term_buffer_length);
        if let Err(e) = descriptor::check_term_length(term_length) {
            self.clients_proxy.on_error(msg.correlation_id, ErrorCode::InvalidChannel, &e.to_string());
            return;
        }

        let registration_id = msg.correlation_id;
        let session_id = uri.session_id.unwrap_or_else(|| {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            id
        });
        let initial_term_id = uri.initial_term_id.unwrap_or_else(rand::random);

        let log = match LogBuffers::create(
            self.context.publication_log_path(registration_id),
            term_length,
        ) {
            Ok(log) => log,
            Err(e) => {
                self.record_error(now, &format!("cannot allocate log buffer: {e}"));
                self.clients_proxy.on_error(msg.correlation_id, ErrorCode::StorageSpace, &e.to_string());
                return;
            }
        };
        log.initialize(initial_term_id, initial_term_id, 0, session_id, msg.stream_id, registration_id);

        let Ok(limit_id) = self.counters_manager.allocate(
            PUBLISHER_LIMIT_TYPE_ID,
            &format!("pub-lmt: {registration_id} {session_id} {} ipc", msg.stream_id),
        ) else {
            self.clients_proxy.on_error(msg.correlation_id, ErrorCode::Generic, "counters exhausted");
            return;
        };

        let publication = Arc::new(IpcPublication::new(
            registration_id,
            session_id,
            msg.stream_id,
            initial_term_id,
            exclusive,
            log,
            self.counters_manager.position(limit_id),
            self.system,
            &self.context,
            now,
        ));
        publication.incref();

        // ipc subscribers waiting on this stream join immediately
        let subscriptions: Vec<i64> = self
            .subscription_links
            .iter()
            .filter(|link| link.kind == SubscriptionKind::Ipc && link.stream_id == msg.stream_id)
            .map(|link| link.registration_id)
            .collect();
        for subscription_id in subscriptions {
            self.link_stored_subscriber_to_ipc(subscription_id, &publication);
        }

        self.publication_links.push(PublicationLink {
            registration_id: msg.correlation_id,
            client_id: msg.client_id,
            target: PublicationTarget::Ipc(publication.clone()),
        });
        self.ipc_publications.push(publication);

        debug!(registration_id, session_id, stream_id = msg.stream_id, "ipc publication added");

        let ready = PublicationReady {
            correlation_id: msg.correlation_id,
            registration_id,
            session_id,
            stream_id: msg.stream_id,
            publication_limit_counter_id: limit_id,
            channel_status_counter_id: -1,
            log_file: self
                .context
                .publication_log_path(registration_id)
                .to_string_lossy()
                .into_owned(),
        };
        self.clients_proxy.publication_ready(&ready, exclusive);
    }

    fn get_or_create_send_endpoint(
        &mut self,
        uri: &ChannelUri,
        canonical: &str,
        now: Nanos,
    ) -> Result<Arc<SendChannelEndpoint>, String> {
        if let Some(endpoint) = self.send_endpoints.get(canonical) {
            return Ok(endpoint.clone());
        }
        let status_id = self
            .counters_manager
            .allocate(CHANNEL_STATUS_TYPE_ID, &format!("snd-channel: {canonical}"))
            .map_err(|e| e.to_string())?;
        match SendChannelEndpoint::create(uri, &self.context, status_id) {
            Ok(endpoint) => {
                let endpoint = Arc::new(endpoint);
                self.counters_manager.position(status_id).set_ordered(1);
                self.send_endpoints.insert(canonical.to_string(), endpoint.clone());
                self.sender_proxy.send(SenderCommand::RegisterEndpoint(endpoint.clone()));
                Ok(endpoint)
            }
            Err(e) => {
                self.counters_manager.free(status_id);
                self.record_error(now, &format!("cannot create send endpoint {canonical}: {e}"));
                Err(e.to_string())
            }
        }
    }

    fn on_remove_publication(&mut self, msg: &RemoveMessage, now: Nanos) {
        self.ensure_client(msg.client_id, now);
        let Some(index) = self
            .publication_links
            .iter()
            .position(|link| link.registration_id == msg.registration_id)
        else {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::UnknownPublication,
                &format!("unknown publication: {}", msg.registration_id),
            );
            return;
        };

        let link = self.publication_links.swap_remove(index);
        match link.target {
            PublicationTarget::Network(publication) => publication.decref(now),
            PublicationTarget::Ipc(publication) => publication.decref(now),
        }
        self.clients_proxy.operation_succeeded(msg.correlation_id);
    }

    // ---- subscriptions --------------------------------------------------

    fn on_add_subscription(&mut self, msg: &SubscriptionMessage, now: Nanos) {
        self.ensure_client(msg.client_id, now);

        let (kind, channel) = match msg.channel.strip_prefix(SPY_PREFIX) {
            Some(rest) => (SubscriptionKind::Spy, rest),
            None => (SubscriptionKind::Network, msg.channel.as_str()),
        };

        let uri = match ChannelUri::parse(channel) {
            Ok(uri) => uri,
            Err(e) => {
                self.clients_proxy.on_error(
                    msg.correlation_id,
                    ErrorCode::InvalidChannel,
                    &e.to_string(),
                );
                return;
            }
        };
        let kind = if uri.is_ipc() { SubscriptionKind::Ipc } else { kind };
        let canonical = uri.canonical_form();
        let reliable = uri.reliable.unwrap_or(true);

        // all subscriptions on one channel/stream must agree on reliability
        let conflict = self.subscription_links.iter().any(|link| {
            link.kind == SubscriptionKind::Network &&
                kind == SubscriptionKind::Network &&
                link.canonical == canonical &&
                link.stream_id == msg.stream_id &&
                link.reliable != reliable
        });
        if conflict {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::Generic,
                &format!("Option conflicts with existing subscriptions: reliable={reliable}"),
            );
            return;
        }

        let mut link = SubscriptionLink {
            registration_id: msg.correlation_id,
            client_id: msg.client_id,
            stream_id: msg.stream_id,
            channel: msg.channel.clone(),
            canonical,
            kind,
            reliable,
            endpoint: None,
            positions: Vec::new(),
        };

        match kind {
            SubscriptionKind::Network => {
                let endpoint =
                    match self.get_or_create_receive_endpoint(&uri, &link.canonical, now) {
                        Ok(endpoint) => endpoint,
                        Err(message) => {
                            self.clients_proxy.on_error(
                                msg.correlation_id,
                                ErrorCode::Generic,
                                &message,
                            );
                            return;
                        }
                    };
                endpoint.incref();
                self.receiver_proxy.send(ReceiverCommand::AddSubscription {
                    endpoint: endpoint.clone(),
                    stream_id: msg.stream_id,
                });
                link.endpoint = Some(endpoint.clone());

                self.clients_proxy.subscription_ready(&SubscriptionReady {
                    correlation_id: msg.correlation_id,
                    channel_status_counter_id: endpoint.status_counter_id(),
                });

                let images: Vec<Arc<PublicationImage>> = self
                    .images
                    .iter()
                    .filter(|image| {
                        image.is_accepting_subscriptions() &&
                            image.stream_id() == msg.stream_id &&
                            image.endpoint().canonical() == link.canonical
                    })
                    .cloned()
                    .collect();
                for image in images {
                    self.link_subscriber_to_image(&mut link, &image);
                }
            }
            SubscriptionKind::Ipc => {
                self.clients_proxy.subscription_ready(&SubscriptionReady {
                    correlation_id: msg.correlation_id,
                    channel_status_counter_id: -1,
                });
                let publications: Vec<Arc<IpcPublication>> = self
                    .ipc_publications
                    .iter()
                    .filter(|p| p.is_accepting_links() && p.stream_id() == msg.stream_id)
                    .cloned()
                    .collect();
                for publication in &publications {
                    self.link_subscriber_to_ipc(&mut link, publication);
                }
            }
            SubscriptionKind::Spy => {
                self.clients_proxy.subscription_ready(&SubscriptionReady {
                    correlation_id: msg.correlation_id,
                    channel_status_counter_id: -1,
                });
                let publications: Vec<Arc<NetworkPublication>> = self
                    .publications
                    .iter()
                    .filter(|p| {
                        p.is_accepting_links() &&
                            p.stream_id() == msg.stream_id &&
                            p.endpoint().canonical() == link.canonical
                    })
                    .cloned()
                    .collect();
                for publication in &publications {
                    self.link_spy(&mut link, publication);
                }
            }
        }

        self.subscription_links.push(link);
    }

    fn take_link(&mut self, registration_id: i64) -> Option<SubscriptionLink> {
        let index = self
            .subscription_links
            .iter()
            .position(|l| l.registration_id == registration_id)?;
        Some(self.subscription_links.swap_remove(index))
    }

    fn get_or_create_receive_endpoint(
        &mut self,
        uri: &ChannelUri,
        canonical: &str,
        now: Nanos,
    ) -> Result<Arc<ReceiveChannelEndpoint>, String> {
        if let Some(endpoint) = self.receive_endpoints.get(canonical) {
            return Ok(endpoint.clone());
        }
        let status_id = self
            .counters_manager
            .allocate(CHANNEL_STATUS_TYPE_ID, &format!("rcv-channel: {canonical}"))
            .map_err(|e| e.to_string())?;
        match ReceiveChannelEndpoint::create(uri, &self.context, status_id) {
            Ok(endpoint) => {
                let endpoint = Arc::new(endpoint);
                self.counters_manager.position(status_id).set_ordered(1);
                self.receive_endpoints.insert(canonical.to_string(), endpoint.clone());
                self.receiver_proxy.send(ReceiverCommand::RegisterEndpoint(endpoint.clone()));
                Ok(endpoint)
            }
            Err(e) => {
                self.counters_manager.free(status_id);
                self.record_error(now, &format!("cannot create receive endpoint {canonical}: {e}"));
                Err(e.to_string())
            }
        }
    }

    fn link_subscriber_to_image(
        &mut self,
        link: &mut SubscriptionLink,
        image: &Arc<PublicationImage>,
    ) {
        let join_position = image.rebuild_position_value();
        let Ok(counter_id) = self.counters_manager.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &format!("sub-pos: {} {} {}", link.registration_id, image.session_id(), link.stream_id),
        ) else {
            warn!("counters exhausted while linking subscriber");
            return;
        };
        self.counters_manager.position(counter_id).set_ordered(join_position);
        image.add_subscriber_position(SubscriberPosition {
            subscription_registration_id: link.registration_id,
            counter_id,
            position: self.counters_manager.read_only_position(counter_id),
        });
        link.positions
            .push(LinkedPosition { target_id: image.correlation_id(), counter_id });

        self.clients_proxy.available_image(&ImageReady {
            correlation_id: image.correlation_id(),
            session_id: image.session_id(),
            stream_id: image.stream_id(),
            subscription_registration_id: link.registration_id,
            subscriber_position_counter_id: counter_id,
            log_file: self
                .context
                .image_log_path(image.correlation_id())
                .to_string_lossy()
                .into_owned(),
            source_identity: image.source_identity().to_string(),
        });
    }

    fn link_stored_subscriber_to_ipc(
        &mut self,
        subscription_id: i64,
        publication: &Arc<IpcPublication>,
    ) {
        let Some(mut link) = self.take_link(subscription_id) else { return };
        self.link_subscriber_to_ipc(&mut link, publication);
        self.subscription_links.push(link);
    }

    fn link_subscriber_to_ipc(
        &mut self,
        link: &mut SubscriptionLink,
        publication: &Arc<IpcPublication>,
    ) {
        let join_position = publication.join_position();
        let Ok(counter_id) = self.counters_manager.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &format!(
                "sub-pos: {} {} {} ipc",
                link.registration_id,
                publication.session_id(),
                link.stream_id
            ),
        ) else {
            warn!("counters exhausted while linking ipc subscriber");
            return;
        };
        self.counters_manager.position(counter_id).set_ordered(join_position);
        publication.add_subscriber_position(SubscriberPosition {
            subscription_registration_id: link.registration_id,
            counter_id,
            position: self.counters_manager.read_only_position(counter_id),
        });
        link.positions
            .push(LinkedPosition { target_id: publication.registration_id(), counter_id });

        self.clients_proxy.available_image(&ImageReady {
            correlation_id: publication.registration_id(),
            session_id: publication.session_id(),
            stream_id: publication.stream_id(),
            subscription_registration_id: link.registration_id,
            subscriber_position_counter_id: counter_id,
            log_file: self
                .context
                .publication_log_path(publication.registration_id())
                .to_string_lossy()
                .into_owned(),
            source_identity: "aqueduct:ipc".to_string(),
        });
    }

    fn link_spy(&mut self, link: &mut SubscriptionLink, publication: &Arc<NetworkPublication>) {
        let join_position = publication.producer_position();
        let Ok(counter_id) = self.counters_manager.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &format!(
                "spy-pos: {} {} {}",
                link.registration_id,
                publication.session_id(),
                link.stream_id
            ),
        ) else {
            warn!("counters exhausted while linking spy");
            return;
        };
        self.counters_manager.position(counter_id).set_ordered(join_position);
        publication.add_spy_position(self.counters_manager.read_only_position(counter_id));
        link.positions
            .push(LinkedPosition { target_id: publication.registration_id(), counter_id });

        self.clients_proxy.available_image(&ImageReady {
            correlation_id: publication.registration_id(),
            session_id: publication.session_id(),
            stream_id: publication.stream_id(),
            subscription_registration_id: link.registration_id,
            subscriber_position_counter_id: counter_id,
            log_file: self
                .context
                .publication_log_path(publication.registration_id())
                .to_string_lossy()
                .into_owned(),
            source_identity: "aqueduct-spy".to_string(),
        });
    }

    /// New publications pick up any live spy subscriptions on their channel.
    fn link_spies_to_publication(&mut self, publication: &Arc<NetworkPublication>) {
        let matching: Vec<i64> = self
            .subscription_links
            .iter()
            .filter(|link| {
                link.kind == SubscriptionKind::Spy &&
                    link.stream_id == publication.stream_id() &&
                    link.canonical == publication.endpoint().canonical()
            })
            .map(|link| link.registration_id)
            .collect();
        for registration_id in matching {
            let Some(mut link) = self.take_link(registration_id) else { continue };
            self.link_spy(&mut link, publication);
            self.subscription_links.push(link);
        }
    }

    fn on_remove_subscription(&mut self, msg: &RemoveMessage, now: Nanos) {
        self.ensure_client(msg.client_id, now);
        let Some(index) = self
            .subscription_links
            .iter()
            .position(|link| link.registration_id == msg.registration_id)
        else {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::UnknownSubscription,
                &format!("unknown subscription: {}", msg.registration_id),
            );
            return;
        };

        let link = self.subscription_links.swap_remove(index);
        self.unlink_subscription(&link);
        self.clients_proxy.operation_succeeded(msg.correlation_id);
    }

    fn unlink_subscription(&mut self, link: &SubscriptionLink) {
        for position in &link.positions {
            match link.kind {
                SubscriptionKind::Network => {
                    if let Some(image) =
                        self.images.iter().find(|i| i.correlation_id() == position.target_id)
                    {
                        image.remove_subscriber_position(link.registration_id);
                    }
                }
                SubscriptionKind::Ipc => {
                    if let Some(publication) = self
                        .ipc_publications
                        .iter()
                        .find(|p| p.registration_id() == position.target_id)
                    {
                        publication.remove_subscriber_position(link.registration_id);
                    }
                }
                SubscriptionKind::Spy => {
                    if let Some(publication) = self
                        .publications
                        .iter()
                        .find(|p| p.registration_id() == position.target_id)
                    {
                        publication.remove_spy_position(position.counter_id);
                    }
                }
            }
            self.counters_manager.free(position.counter_id);
        }

        if let Some(endpoint) = &link.endpoint {
            self.receiver_proxy.send(ReceiverCommand::RemoveSubscription {
                endpoint: endpoint.clone(),
                stream_id: link.stream_id,
            });
            if endpoint.decref() == 0 {
                self.receive_endpoints.remove(link.canonical.as_str());
                self.receiver_proxy.send(ReceiverCommand::CloseEndpoint(endpoint.clone()));
                self.counters_manager.free(endpoint.status_counter_id());
            }
        }
    }

    // ---- destinations ---------------------------------------------------

    fn on_destination(&mut self, msg: &DestinationMessage, add: bool, now: Nanos) {
        self.ensure_client(msg.client_id, now);

        let Some(link) = self
            .publication_links
            .iter()
            .find(|link| link.registration_id == msg.registration_id)
        else {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::UnknownPublication,
                &format!("unknown publication: {}", msg.registration_id),
            );
            return;
        };
        let PublicationTarget::Network(publication) = &link.target else {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::Generic,
                "destinations are not supported on ipc publications",
            );
            return;
        };
        let endpoint = publication.endpoint().clone();

        if !endpoint.is_manual_control() {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::Generic,
                "control channel does not allow manual control",
            );
            return;
        }

        let addr = ChannelUri::parse(&msg.channel)
            .ok()
            .and_then(|uri| uri.endpoint)
            .and_then(|e| e.to_socket_addrs().ok())
            .and_then(|mut addrs| addrs.next());
        let Some(addr) = addr else {
            self.clients_proxy.on_error(
                msg.correlation_id,
                ErrorCode::InvalidChannel,
                &format!("cannot resolve destination: {}", msg.channel),
            );
            return;
        };

        self.sender_proxy.send(if add {
            SenderCommand::AddDestination { endpoint, addr }
        } else {
            SenderCommand::RemoveDestination { endpoint, addr }
        });
        self.clients_proxy.operation_succeeded(msg.correlation_id);
    }

    // ---- images ---------------------------------------------------------

    fn on_create_publication_image(
        &mut self,
        endpoint: &Arc<ReceiveChannelEndpoint>,
        setup: &SetupFrame,
        control_addr: SocketAddr,
        src_addr: SocketAddr,
        now: Nanos,
    ) {
        let term_length = setup.term_length as usize;
        if descriptor::check_term_length(term_length).is_err() {
            increment(&self.system.invalid_packets);
            return;
        }

        // a racing second setup election must not create a twin image
        let duplicate = self.images.iter().any(|image| {
            image.session_id() == setup.session_id &&
                image.stream_id() == setup.stream_id &&
                image.endpoint().canonical() == endpoint.canonical() &&
                image.state() == ImageState::Active
        });
        if duplicate {
            return;
        }

        // reliability is a property of the subscriptions driving this image
        let Some(reliable) = self
            .subscription_links
            .iter()
            .find(|link| {
                link.kind == SubscriptionKind::Network &&
                    link.stream_id == setup.stream_id &&
                    link.canonical == endpoint.canonical()
            })
            .map(|link| link.reliable)
        else {
            return;
        };

        let correlation_id = self.to_driver.next_correlation_id();
        let log = match LogBuffers::create(self.context.image_log_path(correlation_id), term_length)
        {
            Ok(log) => log,
            Err(e) => {
                self.record_error(now, &format!("cannot allocate image log buffer: {e}"));
                return;
            }
        };
        log.initialize(
            setup.initial_term_id,
            setup.active_term_id,
            setup.mtu_length as usize,
            setup.session_id,
            setup.stream_id,
            correlation_id,
        );
        let index = descriptor::index_by_term(setup.initial_term_id, setup.active_term_id);
        log.raw_tail_atomic(index).store(
            descriptor::pack_raw_tail(setup.active_term_id, setup.term_offset as usize),
            std::sync::atomic::Ordering::Release,
        );

        let label = format!("{} {} {}", correlation_id, setup.session_id, setup.stream_id);
        let Ok(hwm_id) = self
            .counters_manager
            .allocate(RECEIVER_HWM_TYPE_ID, &format!("rcv-hwm: {label}"))
        else {
            self.record_error(now, "counters exhausted while creating image");
            return;
        };
        let Ok(rebuild_id) = self
            .counters_manager
            .allocate(RECEIVER_POSITION_TYPE_ID, &format!("rcv-pos: {label}"))
        else {
            self.counters_manager.free(hwm_id);
            self.record_error(now, "counters exhausted while creating image");
            return;
        };

        let params = ImageParams {
            correlation_id,
            session_id: setup.session_id,
            stream_id: setup.stream_id,
            initial_term_id: setup.initial_term_id,
            active_term_id: setup.active_term_id,
            term_offset: setup.term_offset as usize,
            term_length,
            mtu_length: setup.mtu_length as usize,
            source_identity: src_addr.to_string(),
            control_addr,
            is_reliable: reliable,
        };
        let image = Arc::new(PublicationImage::new(
            &params,
            log,
            endpoint.clone(),
            self.counters_manager.position(hwm_id),
            self.counters_manager.position(rebuild_id),
            self.system,
            &self.context,
            now,
        ));

        let subscriptions: Vec<i64> = self
            .subscription_links
            .iter()
            .filter(|link| {
                link.kind == SubscriptionKind::Network &&
                    link.stream_id == setup.stream_id &&
                    link.canonical == endpoint.canonical()
            })
            .map(|link| link.registration_id)
            .collect();
        for registration_id in subscriptions {
            let Some(mut link) = self.take_link(registration_id) else { continue };
            self.link_subscriber_to_image(&mut link, &image);
            self.subscription_links.push(link);
        }

        self.receiver_proxy.send(ReceiverCommand::NewImage(image.clone()));
        self.images.push(image);

        debug!(
            correlation_id,
            session_id = setup.session_id,
            stream_id = setup.stream_id,
            source = %src_addr,
            "publication image created"
        );
    }

    // ---- timer sweep ----------------------------------------------------

    fn on_timer(&mut self, now: Nanos) {
        self.to_driver.set_consumer_heartbeat_time(now.as_millis_u64() as i64);
        self.check_blocked_ring(now);
        self.sweep_clients(now);
        self.sweep_publications(now);
        self.sweep_ipc_publications(now);
        self.sweep_images(now);
    }

    fn check_blocked_ring(&mut self, now: Nanos) {
        let consumer = self.to_driver.consumer_position();
        if consumer != self.last_consumer_position {
            self.last_consumer_position = consumer;
            self.time_of_last_consumer_move = now;
            return;
        }
        if self.to_driver.producer_position() > consumer &&
            now.saturating_sub(self.time_of_last_consumer_move) >
                self.context.client_liveness_timeout_ns &&
            self.to_driver.unblock()
        {
            increment(&self.system.unblocked_commands);
            info!("unblocked stuck command ring producer");
        }
    }

    fn sweep_clients(&mut self, now: Nanos) {
        let mut timed_out = Vec::new();
        self.clients.retain(|client| {
            if now > client.deadline {
                timed_out.push((client.client_id, client.heartbeat.id()));
                false
            } else {
                true
            }
        });

        for (client_id, heartbeat_counter_id) in timed_out {
            increment(&self.system.client_timeouts);
            info!(client_id, "client timed out, reaping resources");

            let publication_links: Vec<usize> = self
                .publication_links
                .iter()
                .enumerate()
                .filter(|(_, link)| link.client_id == client_id)
                .map(|(i, _)| i)
                .collect();
            for index in publication_links.into_iter().rev() {
                let link = self.publication_links.swap_remove(index);
                match link.target {
                    PublicationTarget::Network(publication) => publication.decref(now),
                    PublicationTarget::Ipc(publication) => publication.decref(now),
                }
            }

            let subscription_links: Vec<usize> = self
                .subscription_links
                .iter()
                .enumerate()
                .filter(|(_, link)| link.client_id == client_id)
                .map(|(i, _)| i)
                .collect();
            for index in subscription_links.into_iter().rev() {
                let link = self.subscription_links.swap_remove(index);
                self.unlink_subscription(&link);
            }

            self.counters_manager.free(heartbeat_counter_id);
        }
    }

    fn sweep_publications(&mut self, now: Nanos) {
        for publication in &self.publications {
            publication.on_time_event(now);
            if publication.state() == PublicationState::Closing &&
                !publication.sender_remove_requested()
            {
                publication.mark_sender_remove_requested();
                self.sender_proxy.send(SenderCommand::RemovePublication(publication.clone()));
            }
        }

        let retired: Vec<Arc<NetworkPublication>> = self
            .publications
            .iter()
            .filter(|p| p.has_reached_end_of_life())
            .cloned()
            .collect();
        for publication in retired {
            self.publications.retain(|p| !Arc::ptr_eq(p, &publication));
            for counter_id in publication.free_counter_ids() {
                self.counters_manager.free(counter_id);
            }
            let endpoint = publication.endpoint().clone();
            if endpoint.decref() == 0 {
                self.send_endpoints.remove(endpoint.canonical());
                self.sender_proxy.send(SenderCommand::CloseEndpoint(endpoint.clone()));
                self.counters_manager.free(endpoint.status_counter_id());
            }
            publication.close_resources();
            debug!(registration_id = publication.registration_id(), "publication removed");
        }
    }

    fn sweep_ipc_publications(&mut self, now: Nanos) {
        for publication in &self.ipc_publications {
            publication.on_time_event(now);
        }
        let retired: Vec<Arc<IpcPublication>> = self
            .ipc_publications
            .iter()
            .filter(|p| p.has_reached_end_of_life())
            .cloned()
            .collect();
        for publication in retired {
            self.ipc_publications.retain(|p| !Arc::ptr_eq(p, &publication));
            for counter_id in publication.free_counter_ids() {
                self.counters_manager.free(counter_id);
            }
            publication.close_resources();
            debug!(registration_id = publication.registration_id(), "ipc publication removed");
        }
    }

    fn sweep_images(&mut self, now: Nanos) {
        for image in &self.images {
            image.on_time_event(now);
        }

        let inactive: Vec<Arc<PublicationImage>> = self
            .images
            .iter()
            .filter(|i| i.state() == ImageState::Inactive && !i.unavailable_sent())
            .cloned()
            .collect();
        for image in inactive {
            increment(&self.system.images_unavailable);
            let subscriptions: Vec<(i64, String)> = self
                .subscription_links
                .iter()
                .filter(|link| link.positions.iter().any(|p| p.target_id == image.correlation_id()))
                .map(|link| (link.registration_id, link.channel.clone()))
                .collect();
            for (subscription_registration_id, channel) in subscriptions {
                self.clients_proxy.unavailable_image(&ImageMessage {
                    correlation_id: image.correlation_id(),
                    subscription_registration_id,
                    stream_id: image.stream_id(),
                    channel,
                });
            }
            image.begin_linger(now, self.context.client_liveness_timeout_ns);
            debug!(correlation_id = image.correlation_id(), "image unavailable");
        }

        let expired: Vec<Arc<PublicationImage>> = self
            .images
            .iter()
            .filter(|i| i.linger_expired(now))
            .cloned()
            .collect();
        for image in expired {
            image.retire();
            self.images.retain(|i| !Arc::ptr_eq(i, &image));
            self.receiver_proxy.send(ReceiverCommand::RemoveImage(image.clone()));

            for link in &mut self.subscription_links {
                link.positions.retain(|p| p.target_id != image.correlation_id());
            }
            for counter_id in image.subscriber_counter_ids() {
                self.counters_manager.free(counter_id);
            }
            self.counters_manager.free(image.hwm_counter_id());
            self.counters_manager.free(image.rebuild_counter_id());
            image.close_resources();
            debug!(correlation_id = image.correlation_id(), "image removed");
        }
    }
}

impl Agent for DriverConductor {
    fn do_work(&mut self) -> usize {
        self.do_conductor_work()
    }

    fn on_close(&mut self) {
        for publication in &self.publications {
            publication.close_resources();
        }
        for publication in &self.ipc_publications {
            publication.close_resources();
        }
        for image in &self.images {
            image.close_resources();
        }
        info!("conductor closed");
    }

    fn name(&self) -> &'static str {
        "conductor"
    }
}
