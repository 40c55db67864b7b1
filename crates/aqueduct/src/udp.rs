use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::{Mutex, atomic::{AtomicI32, Ordering}},
};

use aqueduct_protocol::{ChannelUri, ControlMode};
use mio::net::UdpSocket;
use tracing::warn;

use crate::{DriverError, context::DriverContext};

fn resolve(address: &str) -> Result<SocketAddr, DriverError> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| DriverError::UnresolvedAddress(address.to_string()))
}

fn set_socket_buf_size(socket: &UdpSocket, option: libc::c_int, size: usize) {
    use std::os::fd::AsRawFd;
    let size = size as libc::c_int;
    unsafe {
        let code = libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            std::ptr::addr_of!(size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if code != 0 {
            warn!(%code, size, "couldn't set socket buffer size");
        }
    }
}

/// Shared outbound UDP socket for every publication on one canonical
/// channel. The sender agent polls it for status messages, NAKs and RTT
/// probes coming back from receivers.
pub struct SendChannelEndpoint {
    canonical: String,
    socket: UdpSocket,
    default_destination: Option<SocketAddr>,
    is_manual_control: bool,
    destinations: Mutex<Vec<SocketAddr>>,
    status_counter_id: i32,
    ref_count: AtomicI32,
}

impl SendChannelEndpoint {
    pub fn create(
        uri: &ChannelUri,
        context: &DriverContext,
        status_counter_id: i32,
    ) -> Result<Self, DriverError> {
        let socket =
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        if context.socket_sndbuf_length > 0 {
            set_socket_buf_size(&socket, libc::SO_SNDBUF, context.socket_sndbuf_length);
        }

        let is_manual_control = uri.control_mode == ControlMode::Manual;
        let default_destination = match &uri.endpoint {
            Some(endpoint) if !is_manual_control => {
                let addr = resolve(endpoint)?;
                if let (SocketAddr::V4(v4), Some(ttl)) = (addr, uri.ttl) {
                    if v4.ip().is_multicast() {
                        let _ = socket.set_ttl(ttl as u32);
                    }
                }
                Some(addr)
            }
            _ => None,
        };

        Ok(Self {
            canonical: uri.canonical_form(),
            socket,
            default_destination,
            is_manual_control,
            destinations: Mutex::new(Vec::new()),
            status_counter_id,
            ref_count: AtomicI32::new(0),
        })
    }

    #[inline]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[inline]
    pub fn status_counter_id(&self) -> i32 {
        self.status_counter_id
    }

    #[inline]
    pub fn is_manual_control(&self) -> bool {
        self.is_manual_control
    }

    #[inline]
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn incref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decref(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn add_destination(&self, addr: SocketAddr) {
        let mut destinations = self.destinations.lock().unwrap_or_else(|e| e.into_inner());
        if !destinations.contains(&addr) {
            destinations.push(addr);
        }
    }

    pub fn remove_destination(&self, addr: SocketAddr) {
        let mut destinations = self.destinations.lock().unwrap_or_else(|e| e.into_inner());
        destinations.retain(|d| *d != addr);
    }

    /// Sends one datagram to the channel destination, or fans out to every
    /// manual destination. Returns the short-send count: how many
    /// destinations accepted fewer bytes than requested.
    pub fn send(&self, buf: &[u8]) -> usize {
        let mut short_sends = 0;
        match self.default_destination {
            Some(addr) => {
                if !send_all(&self.socket, buf, addr) {
                    short_sends += 1;
                }
            }
            None => {
                let destinations = self.destinations.lock().unwrap_or_else(|e| e.into_inner());
                for addr in destinations.iter() {
                    if !send_all(&self.socket, buf, *addr) {
                        short_sends += 1;
                    }
                }
            }
        }
        short_sends
    }
}

fn send_all(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> bool {
    match socket.send_to(buf, addr) {
        Ok(sent) if sent == buf.len() => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(e) => {
            warn!(?addr, "udp send failed: {e}");
            false
        }
    }
}

/// Shared inbound UDP socket for every subscription on one canonical
/// channel. Owned by the conductor's endpoint map, polled by the receiver.
pub struct ReceiveChannelEndpoint {
    canonical: String,
    socket: UdpSocket,
    status_counter_id: i32,
    ref_count: AtomicI32,
}

impl ReceiveChannelEndpoint {
    pub fn create(
        uri: &ChannelUri,
        context: &DriverContext,
        status_counter_id: i32,
    ) -> Result<Self, DriverError> {
        let endpoint = uri.endpoint.as_deref().unwrap_or("0.0.0.0:0");
        let addr = resolve(endpoint)?;

        let socket = if uri.is_multicast() {
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            let socket = UdpSocket::bind(bind_addr)?;
            if let SocketAddr::V4(v4) = addr {
                socket.join_multicast_v4(v4.ip(), &Ipv4Addr::UNSPECIFIED)?;
            }
            socket
        } else {
            UdpSocket::bind(addr)?
        };

        if context.socket_rcvbuf_length > 0 {
            set_socket_buf_size(&socket, libc::SO_RCVBUF, context.socket_rcvbuf_length);
        }

        Ok(Self {
            canonical: uri.canonical_form(),
            socket,
            status_counter_id,
            ref_count: AtomicI32::new(0),
        })
    }

    #[inline]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[inline]
    pub fn status_counter_id(&self) -> i32 {
        self.status_counter_id
    }

    #[inline]
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn incref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decref(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Control-plane send back toward the source (status messages, NAKs,
    /// RTT replies).
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> bool {
        send_all(&self.socket, buf, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_uri(s: &str) -> ChannelUri {
        ChannelUri::parse(s).unwrap()
    }

    #[test]
    fn unicast_send_receive_roundtrip() {
        let context = DriverContext::default();
        let recv = ReceiveChannelEndpoint::create(
            &test_uri("aqueduct:udp?endpoint=127.0.0.1:0"),
            &context,
            1,
        )
        .unwrap();
        let bound = recv.socket().local_addr().unwrap();

        let uri = test_uri(&format!("aqueduct:udp?endpoint=127.0.0.1:{}", bound.port()));
        let send = SendChannelEndpoint::create(&uri, &context, 2).unwrap();

        assert_eq!(send.send(b"hello"), 0);

        let mut buf = [0u8; 64];
        let (len, from) = loop {
            match recv.socket().recv_from(&mut buf) {
                Ok(ok) => break ok,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::hint::spin_loop(),
                Err(e) => panic!("{e}"),
            }
        };
        assert_eq!(&buf[..len], b"hello");

        // and the receive side can answer to the source
        assert!(recv.send_to(b"sm", from));
    }

    #[test]
    fn manual_control_fans_out() {
        let context = DriverContext::default();
        let recv_a = ReceiveChannelEndpoint::create(
            &test_uri("aqueduct:udp?endpoint=127.0.0.1:0"),
            &context,
            1,
        )
        .unwrap();
        let recv_b = ReceiveChannelEndpoint::create(
            &test_uri("aqueduct:udp?endpoint=127.0.0.1:0"),
            &context,
            1,
        )
        .unwrap();

        let send = SendChannelEndpoint::create(
            &test_uri("aqueduct:udp?control=127.0.0.1:0|control-mode=manual"),
            &context,
            2,
        )
        .unwrap();
        assert!(send.is_manual_control());
        send.add_destination(recv_a.socket().local_addr().unwrap());
        send.add_destination(recv_b.socket().local_addr().unwrap());

        assert_eq!(send.send(b"mdc"), 0);

        for recv in [&recv_a, &recv_b] {
            let mut buf = [0u8; 16];
            let len = loop {
                match recv.socket().recv_from(&mut buf) {
                    Ok((len, _)) => break len,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::hint::spin_loop(),
                    Err(e) => panic!("{e}"),
                }
            };
            assert_eq!(&buf[..len], b"mdc");
        }
    }

    #[test]
    fn refcounts() {
        let context = DriverContext::default();
        let endpoint = ReceiveChannelEndpoint::create(
            &test_uri("aqueduct:udp?endpoint=127.0.0.1:0"),
            &context,
            1,
        )
        .unwrap();
        assert_eq!(endpoint.incref(), 1);
        assert_eq!(endpoint.incref(), 2);
        assert_eq!(endpoint.decref(), 1);
        assert_eq!(endpoint.decref(), 0);
    }
}
