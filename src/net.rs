//! # Socket Transport
//!
//! The blocking socket layer used by the workers. [`NetTransport`] builds
//! sockets with `socket2` and hands them out as [`SocketHandle`]s, which are
//! cheap to clone and shared between the two directions of a reverse or
//! full-duplex test. Both directions operate on `&TcpStream`/`&UdpSocket`, so
//! one direction can read while the other writes.
//!
//! ## Wire format
//!
//! - **Test header**: a bincode-encoded [`TestHeader`] sent by the client
//!   once after connect. TCP prefixes it with a big-endian `u32` length; UDP
//!   sends it as the first datagram.
//! - **Payload frames**: every buffer starts with a big-endian `i64`
//!   sequence number and a big-endian `u64` send timestamp (ns since the
//!   epoch). A negative sequence number marks the end of a UDP stream.
//! - **Acks**: in write-ack tests the receiver answers each complete buffer
//!   with the running byte total as a big-endian `u64`.

use crate::config::{Protocol, TestConfig, TestMode};
use crate::error::{Result, TestError};
use crate::utils::validate_buffer_len;
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Size of the payload frame header.
pub const FRAME_HEADER_LEN: usize = 16;

/// Size of a write-ack message.
pub const ACK_LEN: usize = 8;

/// Largest encoded test header accepted from a peer.
const MAX_HEADER_LEN: usize = 4096;

/// Largest datagram the UDP acceptor reads.
const MAX_DATAGRAM: usize = 65536;

/// Test parameters the client announces to the listener
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestHeader {
    pub reverse: bool,
    pub bidir: bool,
    pub write_ack: bool,
    /// Listener connects back and transmits while receiving
    pub dual_test: bool,
    /// Listener connects back and transmits after receiving
    pub tradeoff: bool,
    /// Port of the client's own listener for connect-back tests
    pub listen_port: u16,
    pub mode: TestMode,
    pub buf_len: u32,
    pub tx_holdback: Option<Duration>,
}

impl TestHeader {
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            reverse: config.flags.reverse,
            bidir: config.flags.bidir,
            write_ack: config.flags.write_ack,
            dual_test: config.flags.dual_test,
            tradeoff: config.flags.tradeoff,
            listen_port: config.port,
            mode: config.mode,
            buf_len: u32::try_from(config.buf_len).unwrap_or(u32::MAX),
            tx_holdback: config.tx_holdback,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Check the values a peer controls before any worker acts on them.
    ///
    /// The buffer length sizes the receive buffer and the write-ack step,
    /// so it gets the same bounds as a locally configured `--len`. A
    /// connect-back test needs a port to connect to.
    ///
    /// ## Returns
    ///
    /// `TestError::Socket` with `InvalidData` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        validate_buffer_len(self.buf_len as usize).map_err(|e| invalid_header(e.to_string()))?;
        if (self.dual_test || self.tradeoff) && self.listen_port == 0 {
            return Err(invalid_header("connect-back test without a listen port".to_string()));
        }
        Ok(())
    }
}

fn invalid_header(reason: String) -> TestError {
    TestError::Socket(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid test header: {}", reason),
    ))
}

/// Write the frame header into the front of `buf`.
pub fn encode_frame(buf: &mut [u8], seq: i64, sent_ns: u64) {
    buf[..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..FRAME_HEADER_LEN].copy_from_slice(&sent_ns.to_be_bytes());
}

/// Read the frame header from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> Option<(i64, u64)> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut seq = [0u8; 8];
    let mut sent = [0u8; 8];
    seq.copy_from_slice(&buf[..8]);
    sent.copy_from_slice(&buf[8..FRAME_HEADER_LEN]);
    Some((i64::from_be_bytes(seq), u64::from_be_bytes(sent)))
}

/// Shared handle to a connected socket
#[derive(Debug, Clone)]
pub enum SocketHandle {
    Tcp(Arc<TcpStream>),
    Udp(Arc<UdpSocket>),
}

impl SocketHandle {
    pub fn protocol(&self) -> Protocol {
        match self {
            SocketHandle::Tcp(_) => Protocol::Tcp,
            SocketHandle::Udp(_) => Protocol::Udp,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketHandle::Tcp(s) => s.peer_addr(),
            SocketHandle::Udp(s) => s.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketHandle::Tcp(s) => s.local_addr(),
            SocketHandle::Udp(s) => s.local_addr(),
        }
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("local {} connected with {}", local, peer),
            _ => "unconnected socket".to_string(),
        }
    }

    /// Read bytes (TCP) or one datagram (UDP).
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketHandle::Tcp(s) => (&**s).read(buf),
            SocketHandle::Udp(s) => s.recv(buf),
        }
    }

    /// Write the whole buffer (TCP) or send it as one datagram (UDP).
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketHandle::Tcp(s) => {
                (&**s).write_all(buf)?;
                Ok(buf.len())
            }
            SocketHandle::Udp(s) => s.send(buf),
        }
    }

    /// Close the sending direction; a no-op for UDP.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            SocketHandle::Tcp(s) => s.shutdown(Shutdown::Write),
            SocketHandle::Udp(_) => Ok(()),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            SocketHandle::Tcp(s) => s.set_read_timeout(timeout),
            SocketHandle::Udp(s) => s.set_read_timeout(timeout),
        }
    }

    /// Announce the test parameters to the listener.
    pub fn send_header(&self, header: &TestHeader) -> Result<()> {
        let bytes = header.encode()?;
        match self {
            SocketHandle::Tcp(s) => {
                let mut stream = &**s;
                stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
                stream.write_all(&bytes)?;
            }
            SocketHandle::Udp(s) => {
                s.send(&bytes)?;
            }
        }
        Ok(())
    }

    /// Send a write-ack carrying the running byte total.
    pub fn send_ack(&self, total: u64) -> io::Result<()> {
        self.write(&total.to_be_bytes()).map(|_| ())
    }
}

fn read_tcp_header(stream: &TcpStream) -> Result<TestHeader> {
    let mut stream = stream;
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_HEADER_LEN {
        return Err(TestError::Socket(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("test header too large: {} bytes", len),
        )));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    let header = TestHeader::decode(&bytes)?;
    header.validate()?;
    Ok(header)
}

/// A connection handed over by an [`Acceptor`]
#[derive(Debug)]
pub struct Accepted {
    pub socket: SocketHandle,
    pub header: TestHeader,
    pub peer: SocketAddr,
}

/// Source of incoming tests for a listener
pub trait Acceptor: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Block until the next test arrives and its header has been read.
    fn accept(&mut self) -> Result<Accepted>;
}

/// Blocking connect/listen interface used by the workers
pub trait Transport: Send + Sync {
    /// Connect to the record's peer.
    ///
    /// The target comes from [`TestConfig::target_addr`], including the
    /// per-stream address offset. A configured bind address is used as the
    /// local source.
    ///
    /// ## Returns
    ///
    /// - `Ok(SocketHandle)`: a connected TCP stream or a connected UDP socket
    /// - `Err(TestError::Socket)`: resolution, bind or connect failed
    fn connect(&self, config: &TestConfig) -> Result<SocketHandle>;

    /// Bind the record's listen address and return an acceptor for tests.
    fn listen(&self, config: &TestConfig) -> Result<Box<dyn Acceptor>>;
}

/// Kernel sockets built with socket2
#[derive(Debug, Clone, Copy, Default)]
pub struct NetTransport;

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn resolve(config: &TestConfig) -> Result<SocketAddr> {
    config.target_addr().map_err(|e| {
        TestError::Socket(io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))
    })
}

fn bind_local(socket: &Socket, config: &TestConfig, target: &SocketAddr) -> Result<()> {
    let ip = match config.bind.as_deref() {
        Some(bind) => bind.parse::<IpAddr>().map_err(|e| {
            TestError::Socket(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?,
        None => unspecified_for(target),
    };
    socket.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    Ok(())
}

fn udp_listen_socket(addr: &SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(*addr))?;
    Ok(socket.into())
}

impl Transport for NetTransport {
    fn connect(&self, config: &TestConfig) -> Result<SocketHandle> {
        let target = resolve(config)?;
        match config.protocol {
            Protocol::Tcp => {
                let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(socket2::Protocol::TCP))?;
                socket.set_nodelay(true)?;
                if config.bind.is_some() {
                    bind_local(&socket, config, &target)?;
                }
                socket.connect(&SockAddr::from(target))?;
                let stream: TcpStream = socket.into();
                debug!("TCP connected to {}", target);
                Ok(SocketHandle::Tcp(Arc::new(stream)))
            }
            Protocol::Udp => {
                let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(socket2::Protocol::UDP))?;
                bind_local(&socket, config, &target)?;
                socket.connect(&SockAddr::from(target))?;
                let udp: UdpSocket = socket.into();
                debug!("UDP connected to {}", target);
                Ok(SocketHandle::Udp(Arc::new(udp)))
            }
        }
    }

    fn listen(&self, config: &TestConfig) -> Result<Box<dyn Acceptor>> {
        let addr = config.listen_addr().map_err(|e| {
            TestError::Socket(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        match config.protocol {
            Protocol::Tcp => {
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(addr))?;
                socket.listen(128)?;
                let listener: TcpListener = socket.into();
                Ok(Box::new(TcpAcceptor { listener }))
            }
            Protocol::Udp => {
                let socket = udp_listen_socket(&addr)?;
                let bound = socket.local_addr()?;
                Ok(Box::new(UdpAcceptor { bound, socket }))
            }
        }
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

impl Acceptor for TcpAcceptor {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&mut self) -> Result<Accepted> {
        let (stream, peer) = self.listener.accept()?;
        if let Err(e) = SockRef::from(&stream).set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let header = read_tcp_header(&stream)?;
        Ok(Accepted {
            socket: SocketHandle::Tcp(Arc::new(stream)),
            header,
            peer,
        })
    }
}

/// Datagram acceptor
///
/// The bound socket becomes the test socket once the header datagram
/// arrives; a fresh socket is then bound to the same address for the next
/// test.
struct UdpAcceptor {
    bound: SocketAddr,
    socket: UdpSocket,
}

impl Acceptor for UdpAcceptor {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.bound)
    }

    fn accept(&mut self) -> Result<Accepted> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf)?;
            let header = match TestHeader::decode(&buf[..n]).and_then(|h| h.validate().map(|_| h)) {
                Ok(header) => header,
                Err(e) => {
                    debug!("ignoring {} byte datagram from {}: {}", n, peer, e);
                    continue;
                }
            };
            self.socket.connect(peer)?;
            let next = udp_listen_socket(&self.bound)?;
            let test_socket = std::mem::replace(&mut self.socket, next);
            return Ok(Accepted {
                socket: SocketHandle::Udp(Arc::new(test_socket)),
                header,
                peer,
            });
        }
    }
}
