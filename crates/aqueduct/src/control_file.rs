use aqueduct_concurrent::{
    BroadcastTransmitter, CountersManager, ManyToOneRingBuffer, MappedRegion, broadcast,
    ringbuffer,
};
use aqueduct_utils::{CACHE_LINE_LENGTH, align};

use crate::{DriverError, context::DriverContext, error_log::DistinctErrorLog};

/// Version tag stamped into the control file header. Bumped whenever the
/// layout changes; clients with a different tag must not attach.
pub const CONTROL_FILE_VERSION: i32 = 0x0001_0000;

/// Packed little-endian header:
///
/// ```text
/// 0        4              8               12                16              20             24
/// | version | to_driver_len | to_clients_len | counters_md_len | counters_v_len | error_log_len | liveness_ns |
/// ```
///
/// Buffers follow, each aligned to twice the cache line length.
const VERSION_OFFSET: usize = 0;
const TO_DRIVER_LENGTH_OFFSET: usize = 4;
const TO_CLIENTS_LENGTH_OFFSET: usize = 8;
const COUNTERS_METADATA_LENGTH_OFFSET: usize = 12;
const COUNTERS_VALUES_LENGTH_OFFSET: usize = 16;
const ERROR_LOG_LENGTH_OFFSET: usize = 20;
const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 24;

pub const CONTROL_FILE_HEADER_LENGTH: usize = 2 * CACHE_LINE_LENGTH;

const BUFFER_ALIGNMENT: usize = 2 * CACHE_LINE_LENGTH;

/// The single memory-mapped rendezvous between the driver and its clients:
/// command ring in, response broadcast out, counters and the error log.
pub struct ControlFile {
    region: MappedRegion,
    to_driver_length: usize,
    to_clients_length: usize,
    counters_metadata_length: usize,
    counters_values_length: usize,
    error_log_length: usize,
}

impl ControlFile {
    pub fn total_length(context: &DriverContext) -> usize {
        CONTROL_FILE_HEADER_LENGTH +
            align(context.to_driver_buffer_length + ringbuffer::TRAILER_LENGTH, BUFFER_ALIGNMENT) +
            align(context.to_clients_buffer_length + broadcast::TRAILER_LENGTH, BUFFER_ALIGNMENT) +
            align(context.counters_metadata_buffer_length, BUFFER_ALIGNMENT) +
            align(context.counters_values_buffer_length, BUFFER_ALIGNMENT) +
            align(context.error_log_buffer_length, BUFFER_ALIGNMENT)
    }

    /// Creates and stamps a fresh control file. Any stale file at the path is
    /// replaced.
    pub fn create(context: &DriverContext) -> Result<Self, DriverError> {
        let region = MappedRegion::create(context.control_file_path(), Self::total_length(context))?;
        let file = Self {
            region,
            to_driver_length: context.to_driver_buffer_length + ringbuffer::TRAILER_LENGTH,
            to_clients_length: context.to_clients_buffer_length + broadcast::TRAILER_LENGTH,
            counters_metadata_length: context.counters_metadata_buffer_length,
            counters_values_length: context.counters_values_buffer_length,
            error_log_length: context.error_log_buffer_length,
        };

        let ptr = file.region.ptr();
        unsafe {
            (ptr.add(TO_DRIVER_LENGTH_OFFSET) as *mut i32).write(file.to_driver_length as i32);
            (ptr.add(TO_CLIENTS_LENGTH_OFFSET) as *mut i32).write(file.to_clients_length as i32);
            (ptr.add(COUNTERS_METADATA_LENGTH_OFFSET) as *mut i32)
                .write(file.counters_metadata_length as i32);
            (ptr.add(COUNTERS_VALUES_LENGTH_OFFSET) as *mut i32)
                .write(file.counters_values_length as i32);
            (ptr.add(ERROR_LOG_LENGTH_OFFSET) as *mut i32).write(file.error_log_length as i32);
            (ptr.add(CLIENT_LIVENESS_TIMEOUT_OFFSET) as *mut i64)
                .write(context.client_liveness_timeout_ns.0 as i64);
            // version last: clients treat it as the ready flag
            (ptr.add(VERSION_OFFSET) as *mut i32).write(CONTROL_FILE_VERSION);
        }

        Ok(file)
    }

    /// Attaches to an existing control file. A version mismatch is fatal.
    pub fn open(context: &DriverContext) -> Result<Self, DriverError> {
        let region = MappedRegion::open(context.control_file_path())?;
        let ptr = region.ptr();
        let version = unsafe { (ptr.add(VERSION_OFFSET) as *const i32).read() };
        if version != CONTROL_FILE_VERSION {
            return Err(DriverError::ControlFileVersion(version, CONTROL_FILE_VERSION));
        }
        unsafe {
            Ok(Self {
                to_driver_length: (ptr.add(TO_DRIVER_LENGTH_OFFSET) as *const i32).read() as usize,
                to_clients_length: (ptr.add(TO_CLIENTS_LENGTH_OFFSET) as *const i32).read()
                    as usize,
                counters_metadata_length: (ptr.add(COUNTERS_METADATA_LENGTH_OFFSET) as *const i32)
                    .read() as usize,
                counters_values_length: (ptr.add(COUNTERS_VALUES_LENGTH_OFFSET) as *const i32)
                    .read() as usize,
                error_log_length: (ptr.add(ERROR_LOG_LENGTH_OFFSET) as *const i32).read() as usize,
                region,
            })
        }
    }

    pub fn client_liveness_timeout_ns(&self) -> i64 {
        unsafe { (self.region.ptr().add(CLIENT_LIVENESS_TIMEOUT_OFFSET) as *const i64).read() }
    }

    fn to_driver_offset(&self) -> usize {
        CONTROL_FILE_HEADER_LENGTH
    }

    fn to_clients_offset(&self) -> usize {
        self.to_driver_offset() + align(self.to_driver_length, BUFFER_ALIGNMENT)
    }

    fn counters_metadata_offset(&self) -> usize {
        self.to_clients_offset() + align(self.to_clients_length, BUFFER_ALIGNMENT)
    }

    fn counters_values_offset(&self) -> usize {
        self.counters_metadata_offset() + align(self.counters_metadata_length, BUFFER_ALIGNMENT)
    }

    fn error_log_offset(&self) -> usize {
        self.counters_values_offset() + align(self.counters_values_length, BUFFER_ALIGNMENT)
    }

    pub fn to_driver_ring(&self) -> Result<ManyToOneRingBuffer, DriverError> {
        Ok(ManyToOneRingBuffer::new(
            unsafe { self.region.ptr().add(self.to_driver_offset()) },
            self.to_driver_length,
        )?)
    }

    pub fn to_clients_transmitter(&self) -> Result<BroadcastTransmitter, DriverError> {
        Ok(BroadcastTransmitter::new(
            unsafe { self.region.ptr().add(self.to_clients_offset()) },
            self.to_clients_length,
        )?)
    }

    pub fn to_clients_receiver(&self) -> Result<aqueduct_concurrent::BroadcastReceiver, DriverError> {
        Ok(aqueduct_concurrent::BroadcastReceiver::new(
            unsafe { self.region.ptr().add(self.to_clients_offset()) },
            self.to_clients_length,
        )?)
    }

    pub fn counters_manager(&self) -> CountersManager {
        CountersManager::new(
            unsafe { self.region.ptr().add(self.counters_metadata_offset()) },
            self.counters_metadata_length,
            unsafe { self.region.ptr().add(self.counters_values_offset()) },
        )
    }

    pub fn counters_reader(&self) -> aqueduct_concurrent::CountersReader {
        aqueduct_concurrent::CountersReader::new(
            unsafe { self.region.ptr().add(self.counters_metadata_offset()) },
            self.counters_metadata_length,
            unsafe { self.region.ptr().add(self.counters_values_offset()) },
        )
    }

    pub fn error_log(&self) -> DistinctErrorLog {
        DistinctErrorLog::new(
            unsafe { self.region.ptr().add(self.error_log_offset()) },
            self.error_log_length,
        )
    }

    pub fn unlink(&self) {
        self.region.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(dir: &std::path::Path) -> DriverContext {
        DriverContext {
            dir: dir.to_path_buf(),
            to_driver_buffer_length: 64 * 1024,
            to_clients_buffer_length: 64 * 1024,
            counters_metadata_buffer_length: 64 * aqueduct_concurrent::METADATA_LENGTH,
            counters_values_buffer_length: 64 * aqueduct_concurrent::COUNTER_LENGTH,
            error_log_buffer_length: 64 * 1024,
            ..DriverContext::default()
        }
    }

    #[test]
    fn create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let created = ControlFile::create(&context).unwrap();
        let ring = created.to_driver_ring().unwrap();
        ring.write(1, b"ping").unwrap();

        let opened = ControlFile::open(&context).unwrap();
        assert_eq!(
            opened.client_liveness_timeout_ns(),
            context.client_liveness_timeout_ns.0 as i64
        );
        let ring2 = opened.to_driver_ring().unwrap();
        let mut got = Vec::new();
        ring2.read(4, |t, msg| got.push((t, msg.to_vec())));
        assert_eq!(got, vec![(1, b"ping".to_vec())]);
        created.unlink();
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());

        let created = ControlFile::create(&context).unwrap();
        unsafe { (created.region.ptr() as *mut i32).write(0x0bad_0000) };

        assert!(matches!(
            ControlFile::open(&context),
            Err(DriverError::ControlFileVersion(0x0bad_0000, CONTROL_FILE_VERSION))
        ));
        created.unlink();
    }

    #[test]
    fn broadcast_and_counters_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let control = ControlFile::create(&context).unwrap();

        let tx = control.to_clients_transmitter().unwrap();
        let mut rx = control.to_clients_receiver().unwrap();
        tx.transmit(3, b"resp").unwrap();
        let mut seen = None;
        rx.receive(|t, m| seen = Some((t, m.to_vec()))).unwrap();
        assert_eq!(seen, Some((3, b"resp".to_vec())));

        let mut counters = control.counters_manager();
        let id = counters.allocate(1, "test").unwrap();
        counters.position(id).set_ordered(9);
        assert_eq!(counters.reader().counter_value(id), 9);
        control.unlink();
    }
}
