use std::path::PathBuf;

use aqueduct_concurrent::IdleStrategy;
use aqueduct_timing::{ClockSource, Nanos};
use tracing::warn;

/// How the three driver agents are mapped onto threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// One thread per agent.
    #[default]
    Dedicated,
    /// Sender and receiver share a thread, the conductor gets its own.
    SharedNetwork,
    /// All three agents on one thread.
    Shared,
}

impl ThreadingMode {
    fn from_env(value: &str) -> Option<Self> {
        match value {
            "dedicated" => Some(ThreadingMode::Dedicated),
            "shared-network" => Some(ThreadingMode::SharedNetwork),
            "shared" => Some(ThreadingMode::Shared),
            _ => None,
        }
    }
}

/// Driver configuration. Defaults follow the protocol timeouts; everything
/// is overridable programmatically and the operational knobs additionally
/// via `AQUEDUCT_*` environment variables.
#[derive(Clone, Debug)]
pub struct DriverContext {
    pub dir: PathBuf,
    pub threading_mode: ThreadingMode,
    pub conductor_idle: IdleStrategy,
    pub sender_idle: IdleStrategy,
    pub receiver_idle: IdleStrategy,

    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counters_metadata_buffer_length: usize,
    pub counters_values_buffer_length: usize,
    pub error_log_buffer_length: usize,

    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub mtu_length: usize,
    pub initial_window_length: usize,
    pub publication_term_window_length: usize,
    pub socket_rcvbuf_length: usize,
    pub socket_sndbuf_length: usize,

    pub timer_interval_ns: Nanos,
    pub client_liveness_timeout_ns: Nanos,
    pub image_liveness_timeout_ns: Nanos,
    pub publication_unblock_timeout_ns: Nanos,
    pub publication_setup_timeout_ns: Nanos,
    pub publication_heartbeat_timeout_ns: Nanos,
    pub status_message_timeout_ns: Nanos,
    pub nak_unicast_delay_ns: Nanos,
    pub nak_multicast_max_delay_ns: Nanos,
    pub retransmit_linger_timeout_ns: Nanos,
    pub publication_linger_timeout_ns: Nanos,
    pub publication_connection_timeout_ns: Nanos,
    pub flow_control_receiver_timeout_ns: Nanos,

    pub command_drain_limit: usize,
    pub dir_delete_on_start: bool,
    pub clock: ClockSource,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            dir: aqueduct_utils::directories::driver_dir("aqueduct"),
            threading_mode: ThreadingMode::default(),
            conductor_idle: IdleStrategy::default_backoff(),
            sender_idle: IdleStrategy::default_backoff(),
            receiver_idle: IdleStrategy::default_backoff(),

            to_driver_buffer_length: 1024 * 1024,
            to_clients_buffer_length: 1024 * 1024,
            counters_metadata_buffer_length: 1024 * aqueduct_concurrent::METADATA_LENGTH,
            counters_values_buffer_length: 1024 * aqueduct_concurrent::COUNTER_LENGTH,
            error_log_buffer_length: 1024 * 1024,

            term_buffer_length: 1024 * 1024,
            ipc_term_buffer_length: 1024 * 1024,
            mtu_length: 1408,
            initial_window_length: 128 * 1024,
            publication_term_window_length: 0,
            socket_rcvbuf_length: 128 * 1024,
            socket_sndbuf_length: 0,

            timer_interval_ns: Nanos::from_secs(1),
            client_liveness_timeout_ns: Nanos::from_secs(5),
            image_liveness_timeout_ns: Nanos::from_secs(10),
            publication_unblock_timeout_ns: Nanos::from_secs(10),
            publication_setup_timeout_ns: Nanos::from_millis(100),
            publication_heartbeat_timeout_ns: Nanos::from_millis(100),
            status_message_timeout_ns: Nanos::from_millis(200),
            nak_unicast_delay_ns: Nanos::ZERO,
            nak_multicast_max_delay_ns: Nanos::from_millis(60),
            retransmit_linger_timeout_ns: Nanos::from_millis(60),
            publication_linger_timeout_ns: Nanos::from_secs(5),
            publication_connection_timeout_ns: Nanos::from_secs(5),
            flow_control_receiver_timeout_ns: Nanos::from_secs(2),

            command_drain_limit: 10,
            dir_delete_on_start: false,
            clock: ClockSource::default(),
        }
    }
}

impl DriverContext {
    /// Applies `AQUEDUCT_*` environment overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut context = Self::default();

        if let Ok(dir) = std::env::var("AQUEDUCT_DIR") {
            context.dir = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("AQUEDUCT_THREADING_MODE") {
            match ThreadingMode::from_env(&mode) {
                Some(m) => context.threading_mode = m,
                None => warn!(%mode, "unknown threading mode, keeping default"),
            }
        }
        if let Ok(v) = std::env::var("AQUEDUCT_TERM_LENGTH") {
            match v.parse() {
                Ok(length) => context.term_buffer_length = length,
                Err(_) => warn!(%v, "unparseable term length, keeping default"),
            }
        }
        if let Ok(v) = std::env::var("AQUEDUCT_CLIENT_LIVENESS_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => context.client_liveness_timeout_ns = Nanos::from_millis(ms),
                Err(_) => warn!(%v, "unparseable client liveness timeout, keeping default"),
            }
        }
        if std::env::var("AQUEDUCT_DIR_DELETE_ON_START").is_ok_and(|v| v == "true" || v == "1") {
            context.dir_delete_on_start = true;
        }

        context
    }

    #[inline]
    pub fn control_file_path(&self) -> PathBuf {
        self.dir.join("aqueduct.cnc")
    }

    #[inline]
    pub fn publication_log_path(&self, registration_id: i64) -> PathBuf {
        self.dir.join("publications").join(format!("{registration_id}.logbuffer"))
    }

    #[inline]
    pub fn image_log_path(&self, correlation_id: i64) -> PathBuf {
        self.dir.join("images").join(format!("{correlation_id}.logbuffer"))
    }

    /// `min(term_length / 2, configured)`: no consumer may fall more than
    /// half a term behind.
    pub fn term_window_length(&self, term_length: usize) -> usize {
        let half = term_length / 2;
        if self.publication_term_window_length == 0 {
            half
        } else {
            std::cmp::min(half, self.publication_term_window_length)
        }
    }

    pub fn initial_receiver_window(&self, term_length: usize) -> usize {
        std::cmp::min(self.initial_window_length, term_length / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_window_clamps_to_half_term() {
        let mut context = DriverContext::default();
        assert_eq!(context.term_window_length(128 * 1024), 64 * 1024);
        context.publication_term_window_length = 16 * 1024;
        assert_eq!(context.term_window_length(128 * 1024), 16 * 1024);
        context.publication_term_window_length = 1024 * 1024;
        assert_eq!(context.term_window_length(128 * 1024), 64 * 1024);
    }

    #[test]
    fn receiver_window_clamps() {
        let context = DriverContext::default();
        assert_eq!(context.initial_receiver_window(64 * 1024), 32 * 1024);
        assert_eq!(context.initial_receiver_window(1024 * 1024), 128 * 1024);
    }
}
