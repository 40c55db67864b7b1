use aqueduct_concurrent::{CountersError, CountersManager, Position};

/// Driver-wide counters, allocated once at startup so their ids are stable
/// for external tooling.
#[derive(Clone, Copy, Debug)]
pub struct SystemCounters {
    pub bytes_sent: Position,
    pub bytes_received: Position,
    pub naks_sent: Position,
    pub naks_received: Position,
    pub status_messages_sent: Position,
    pub status_messages_received: Position,
    pub heartbeats_sent: Position,
    pub heartbeats_received: Position,
    pub retransmits_sent: Position,
    pub flow_control_under_runs: Position,
    pub flow_control_over_runs: Position,
    pub invalid_packets: Position,
    pub errors: Position,
    pub short_sends: Position,
    pub client_timeouts: Position,
    pub unblocked_publications: Position,
    pub unblocked_commands: Position,
    pub back_pressured: Position,
    pub images_unavailable: Position,
    pub command_queue_overflows: Position,
}

const SYSTEM_COUNTER_TYPE_ID: i32 = 0;

impl SystemCounters {
    pub fn allocate(manager: &mut CountersManager) -> Result<Self, CountersError> {
        let mut allocate = |label: &str| -> Result<Position, CountersError> {
            let id = manager.allocate(SYSTEM_COUNTER_TYPE_ID, label)?;
            Ok(manager.position(id))
        };

        Ok(Self {
            bytes_sent: allocate("Bytes sent")?,
            bytes_received: allocate("Bytes received")?,
            naks_sent: allocate("NAKs sent")?,
            naks_received: allocate("NAKs received")?,
            status_messages_sent: allocate("Status Messages sent")?,
            status_messages_received: allocate("Status Messages received")?,
            heartbeats_sent: allocate("Heartbeats sent")?,
            heartbeats_received: allocate("Heartbeats received")?,
            retransmits_sent: allocate("Retransmits sent")?,
            flow_control_under_runs: allocate("Flow control under runs")?,
            flow_control_over_runs: allocate("Flow control over runs")?,
            invalid_packets: allocate("Invalid packets")?,
            errors: allocate("Errors")?,
            short_sends: allocate("Short sends")?,
            client_timeouts: allocate("Client liveness timeouts")?,
            unblocked_publications: allocate("Unblocked publications")?,
            unblocked_commands: allocate("Unblocked control commands")?,
            back_pressured: allocate("Back pressure events")?,
            images_unavailable: allocate("Images gone unavailable")?,
            command_queue_overflows: allocate("Command queue overflows")?,
        })
    }
}

#[inline]
pub fn increment(counter: &Position) {
    counter.set_ordered(counter.get() + 1);
}

#[inline]
pub fn add(counter: &Position, amount: i64) {
    counter.set_ordered(counter.get() + amount);
}

#[cfg(test)]
mod tests {
    use aqueduct_concurrent::{COUNTER_LENGTH, METADATA_LENGTH};

    use super::*;

    #[test]
    fn allocates_stable_ids() {
        let mut meta = vec![0u8; 64 * METADATA_LENGTH];
        let mut values = vec![0u8; 64 * COUNTER_LENGTH];
        let mut manager = CountersManager::new(meta.as_mut_ptr(), meta.len(), values.as_mut_ptr());

        let counters = SystemCounters::allocate(&mut manager).unwrap();
        assert_eq!(counters.bytes_sent.id(), 0);
        increment(&counters.unblocked_publications);
        increment(&counters.unblocked_publications);
        assert_eq!(
            manager.reader().counter_value(counters.unblocked_publications.id()),
            2
        );

        let mut labels = Vec::new();
        manager.reader().for_each(|_, _, label, _| labels.push(label.to_string()));
        assert!(labels.contains(&"Unblocked publications".to_string()));
    }
}
