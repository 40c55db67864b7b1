use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use aqueduct_concurrent::{ManyToOneQueue, OneToOneQueue};
use aqueduct_protocol::SetupFrame;

use crate::{
    image::PublicationImage,
    publication::NetworkPublication,
    system_counters::{SystemCounters, increment},
    udp::{ReceiveChannelEndpoint, SendChannelEndpoint},
};

/// Conductor to sender instructions.
pub enum SenderCommand {
    RegisterEndpoint(Arc<SendChannelEndpoint>),
    CloseEndpoint(Arc<SendChannelEndpoint>),
    NewPublication(Arc<NetworkPublication>),
    RemovePublication(Arc<NetworkPublication>),
    AddDestination { endpoint: Arc<SendChannelEndpoint>, addr: SocketAddr },
    RemoveDestination { endpoint: Arc<SendChannelEndpoint>, addr: SocketAddr },
}

/// Conductor to receiver instructions.
pub enum ReceiverCommand {
    RegisterEndpoint(Arc<ReceiveChannelEndpoint>),
    CloseEndpoint(Arc<ReceiveChannelEndpoint>),
    AddSubscription { endpoint: Arc<ReceiveChannelEndpoint>, stream_id: i32 },
    RemoveSubscription { endpoint: Arc<ReceiveChannelEndpoint>, stream_id: i32 },
    NewImage(Arc<PublicationImage>),
    RemoveImage(Arc<PublicationImage>),
}

/// Sender and receiver to conductor events.
pub enum ConductorCommand {
    /// Receiver elected a SETUP for a subscribed stream with no image yet.
    CreatePublicationImage {
        endpoint: Arc<ReceiveChannelEndpoint>,
        setup: SetupFrame,
        control_addr: SocketAddr,
        src_addr: SocketAddr,
    },
}

/// Single-producer proxy over a bounded queue. A full queue is counted and
/// the command retried on the next duty cycle instead of blocking the agent.
pub struct CommandProxy<T> {
    queue: Arc<OneToOneQueue<T>>,
    pending: VecDeque<T>,
    counters: SystemCounters,
}

impl<T> CommandProxy<T> {
    pub fn new(queue: Arc<OneToOneQueue<T>>, counters: SystemCounters) -> Self {
        Self { queue, pending: VecDeque::new(), counters }
    }

    pub fn send(&mut self, command: T) {
        self.pending.push_back(command);
        self.flush();
    }

    /// Retries anything the queue rejected. Returns the number drained.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(command) = self.pending.pop_front() {
            match self.queue.offer(command) {
                Ok(()) => flushed += 1,
                Err(command) => {
                    increment(&self.counters.command_queue_overflows);
                    self.pending.push_front(command);
                    break;
                }
            }
        }
        flushed
    }
}

pub type SenderProxy = CommandProxy<SenderCommand>;
pub type ReceiverProxy = CommandProxy<ReceiverCommand>;

/// Many-producer proxy for posting events up to the conductor; each agent
/// owns one with its private retry queue.
pub struct ConductorProxy {
    queue: Arc<ManyToOneQueue<ConductorCommand>>,
    pending: VecDeque<ConductorCommand>,
    counters: SystemCounters,
}

impl ConductorProxy {
    pub fn new(queue: Arc<ManyToOneQueue<ConductorCommand>>, counters: SystemCounters) -> Self {
        Self { queue, pending: VecDeque::new(), counters }
    }

    pub fn send(&mut self, command: ConductorCommand) {
        self.pending.push_back(command);
        self.flush();
    }

    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(command) = self.pending.pop_front() {
            match self.queue.offer(command) {
                Ok(()) => flushed += 1,
                Err(command) => {
                    increment(&self.counters.command_queue_overflows);
                    self.pending.push_front(command);
                    break;
                }
            }
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use aqueduct_concurrent::{COUNTER_LENGTH, CountersManager, METADATA_LENGTH};

    use super::*;

    fn counters(meta: &mut Vec<u8>, values: &mut Vec<u8>) -> (SystemCounters, CountersManager) {
        let mut manager = CountersManager::new(meta.as_mut_ptr(), meta.len(), values.as_mut_ptr());
        (crate::system_counters::SystemCounters::allocate(&mut manager).unwrap(), manager)
    }

    #[test]
    fn retries_when_queue_full() {
        let mut meta = vec![0u8; 32 * METADATA_LENGTH];
        let mut values = vec![0u8; 32 * COUNTER_LENGTH];
        let (system, manager) = counters(&mut meta, &mut values);

        let queue: Arc<OneToOneQueue<u32>> = Arc::new(OneToOneQueue::with_capacity(2));
        let mut proxy = CommandProxy::new(queue.clone(), system);

        proxy.send(1);
        proxy.send(2);
        proxy.send(3); // overflows, retried later
        assert_eq!(
            manager.reader().counter_value(system.command_queue_overflows.id()),
            1
        );

        assert_eq!(queue.poll(), Some(1));
        assert_eq!(proxy.flush(), 1);
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
    }
}
