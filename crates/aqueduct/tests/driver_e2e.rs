use std::time::{Duration, Instant};

use aqueduct::{DriverContext, MediaDriver, control_file::ControlFile};
use aqueduct_logbuffer::{HeaderWriter, LogBuffers, TermAppender, frame};
use aqueduct_protocol::{
    ImageReady, PublicationMessage, PublicationReady, SubscriptionMessage, command_type,
    response_type,
};

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn wait_for<T>(deadline: Duration, mut poll: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(value) = poll() {
            return value;
        }
        assert!(start.elapsed() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Full loopback flow: publication and subscription on one driver, frames
/// appended into the publication log come out in the image log after the
/// setup election, status-message handshake and UDP send.
#[test]
fn loopback_publish_subscribe() {
    let dir = tempfile::tempdir().unwrap();
    let context = DriverContext {
        dir: dir.path().to_path_buf(),
        term_buffer_length: 64 * 1024,
        to_driver_buffer_length: 64 * 1024,
        to_clients_buffer_length: 64 * 1024,
        counters_metadata_buffer_length: 256 * aqueduct_concurrent::METADATA_LENGTH,
        counters_values_buffer_length: 256 * aqueduct_concurrent::COUNTER_LENGTH,
        error_log_buffer_length: 64 * 1024,
        client_liveness_timeout_ns: aqueduct_timing::Nanos::from_secs(30),
        ..DriverContext::default()
    };

    let driver = MediaDriver::launch(context.clone()).unwrap();

    let control = ControlFile::open(&context).unwrap();
    let ring = control.to_driver_ring().unwrap();
    let mut responses = control.to_clients_receiver().unwrap();

    let port = free_udp_port();
    let channel = format!("aqueduct:udp?endpoint=127.0.0.1:{port}");

    // add publication
    let pub_correlation = ring.next_correlation_id();
    let mut buf = Vec::new();
    PublicationMessage {
        client_id: 1,
        correlation_id: pub_correlation,
        stream_id: 10,
        channel: channel.clone(),
    }
    .encode(&mut buf);
    ring.write(command_type::ADD_PUBLICATION, &buf).unwrap();

    let publication: PublicationReady = wait_for(Duration::from_secs(5), || {
        let mut found = None;
        while responses
            .receive(|t, msg| {
                if t == response_type::ON_PUBLICATION_READY {
                    let ready = PublicationReady::decode(msg).unwrap();
                    if ready.correlation_id == pub_correlation {
                        found = Some(ready);
                    }
                }
            })
            .unwrap_or(false)
        {}
        found
    });

    // add subscription on the same channel
    let sub_correlation = ring.next_correlation_id();
    let mut buf = Vec::new();
    SubscriptionMessage {
        client_id: 1,
        correlation_id: sub_correlation,
        stream_id: 10,
        channel: channel.clone(),
    }
    .encode(&mut buf);
    ring.write(command_type::ADD_SUBSCRIPTION, &buf).unwrap();

    // the sender's periodic SETUP elects an image for the subscription
    let image: ImageReady = wait_for(Duration::from_secs(5), || {
        let mut found = None;
        while responses
            .receive(|t, msg| {
                if t == response_type::ON_AVAILABLE_IMAGE {
                    let ready = ImageReady::decode(msg).unwrap();
                    if ready.subscription_registration_id == sub_correlation {
                        found = Some(ready);
                    }
                }
            })
            .unwrap_or(false)
        {}
        found
    });
    assert_eq!(image.session_id, publication.session_id);

    // publish three frames straight into the term log, like a client would
    let pub_log = LogBuffers::open(&publication.log_file, context.term_buffer_length).unwrap();
    let header = HeaderWriter::new(publication.session_id, 10);
    let index = pub_log.active_partition_index();
    {
        let appender =
            TermAppender::new(pub_log.term_ptr(index), pub_log.term_length(), pub_log.raw_tail_atomic(index));
        for payload in [b"first".as_slice(), b"second", b"third"] {
            assert!(appender.append_unfragmented(&header, payload, 0) >= 0);
        }
    }

    // the frames arrive in the image log once flow control opens the window
    let image_log = LogBuffers::open(&image.log_file, context.term_buffer_length).unwrap();
    let image_index = image_log.active_partition_index();
    wait_for(Duration::from_secs(5), || {
        let mut offset = 0;
        let mut frames = 0;
        while frames < 3 {
            let length = frame::frame_length_volatile(image_log.term_ptr(image_index), offset);
            if length <= 0 {
                return None;
            }
            frames += 1;
            offset += aqueduct_utils::align(length as usize, frame::FRAME_ALIGNMENT);
        }
        Some(())
    });

    let term_ptr = image_log.term_ptr(image_index);
    let first_length = frame::frame_length_volatile(term_ptr, 0) as usize;
    assert_eq!(first_length, frame::HEADER_LENGTH + 5);
    let payload = unsafe {
        std::slice::from_raw_parts(term_ptr.add(frame::HEADER_LENGTH), first_length - frame::HEADER_LENGTH)
    };
    assert_eq!(payload, b"first");

    driver.shutdown();
}
