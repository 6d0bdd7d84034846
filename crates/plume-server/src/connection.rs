//! Physical connection state.
//!
//! A `Connection` owns the socket, the read buffer and the protocol state of
//! one physical link. Durable client state (subscriptions, inflight table,
//! will) lives on the `Session` it binds to after CONNECT.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;
use rustls::ServerConnection;

use plume_core::error::Result;
use plume_core::packet::{self, Packet};

use crate::conn_handle::ConnHandle;
use crate::session::Session;

/// The accepted byte stream: the bare TCP socket, or a rustls session over
/// it when the connection came in on the TLS listener. All actual I/O runs
/// through `Connection`, which matches on the variant at each use site;
/// this type only hands out the raw socket for poll registration.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    pub fn tcp(socket: TcpStream) -> Self {
        Stream::Tcp(socket)
    }

    pub fn tls(session: ServerConnection, socket: TcpStream) -> Self {
        Stream::Tls(Box::new(rustls::StreamOwned::new(session, socket)))
    }

    /// The raw socket, for registering with and deregistering from the
    /// worker's poll.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Stream::Tcp(socket) => socket,
            Stream::Tls(tls) => tls.get_mut(),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(socket) => socket.as_raw_fd(),
            Stream::Tls(tls) => tls.get_ref().as_raw_fd(),
        }
    }
}

/// Connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nothing received yet; only CONNECT is legal.
    Init,
    /// CONNECT is being processed.
    Connecting,
    /// Handshake done.
    Connected,
    /// Tear down at the next cleanup pass.
    Closed,
}

const INITIAL_READ_BUFFER: usize = 1024;
const READ_BUFFER_SHRINK_THRESHOLD: usize = 64 * 1024;

pub struct Connection {
    pub token: Token,
    pub stream: Stream,
    pub remote_addr: SocketAddr,
    pub state: ConnState,
    /// Bound after a successful handshake.
    pub session: Option<Arc<Session>>,
    /// Negotiated keep-alive in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Set when the client sent DISCONNECT; suppresses the will.
    pub graceful_disconnect: bool,
    /// Peer closed its end; buffered packets still get processed first.
    pub eof: bool,
    /// Last time any packet arrived (read deadline is 1.5x keep-alive).
    pub last_packet_time: Instant,
    /// Last time bytes went out (send-side PINGREQ timer).
    pub last_write_time: Instant,
    /// Broker-initiated PINGREQs not yet answered with PINGRESP.
    pub ping_counter: u8,

    read_buf: Vec<u8>,
    read_pos: usize,

    /// Shared write handle; other threads deliver through this.
    pub handle: Arc<ConnHandle>,
}

impl Connection {
    pub fn new(
        token: Token,
        stream: Stream,
        remote_addr: SocketAddr,
        worker_id: usize,
        epoll_fd: RawFd,
    ) -> Self {
        let socket_fd = stream.raw_fd();
        let handle = Arc::new(ConnHandle::new(worker_id, epoll_fd, socket_fd, token));

        Self {
            token,
            stream,
            remote_addr,
            state: ConnState::Init,
            session: None,
            keep_alive: 0,
            graceful_disconnect: false,
            eof: false,
            last_packet_time: Instant::now(),
            last_write_time: Instant::now(),
            ping_counter: 0,
            read_buf: vec![0u8; INITIAL_READ_BUFFER],
            read_pos: 0,
            handle,
        }
    }

    /// Read from the socket into the buffer. TLS connections read decrypted
    /// plaintext; rustls drives its handshake inside these reads.
    /// Returns Ok(true) if data is available, Ok(false) if it would block.
    pub fn read(&mut self) -> Result<bool> {
        loop {
            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            let spare = &mut self.read_buf[self.read_pos..];
            let read = match &mut self.stream {
                Stream::Tcp(socket) => socket.read(spare),
                Stream::Tls(tls) => tls.read(spare),
            };

            match read {
                Ok(0) => {
                    // Peer closed. Any buffered bytes (e.g. a trailing
                    // DISCONNECT) still get processed before teardown.
                    self.eof = true;
                    return Ok(self.read_pos > 0);
                }
                Ok(n) => {
                    self.read_pos += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.read_pos > 0);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decode the next packet from the read buffer, if complete.
    pub fn decode_packet(&mut self, max_packet_size: usize) -> Result<Option<Packet>> {
        if self.read_pos == 0 {
            return Ok(None);
        }

        let data = &self.read_buf[..self.read_pos];
        match packet::decode_packet(data, max_packet_size)? {
            Some((pkt, consumed)) => {
                self.read_buf.copy_within(consumed..self.read_pos, 0);
                self.read_pos -= consumed;
                Ok(Some(pkt))
            }
            None => Ok(None),
        }
    }

    pub fn queue_control_packet(&self, pkt: &Packet) -> io::Result<()> {
        self.handle.queue_control_packet(pkt)
    }

    /// Drain the write buffer to the socket (plaintext through rustls for
    /// TLS connections).
    pub fn flush(&mut self) -> Result<bool> {
        let flushed = match &mut self.stream {
            Stream::Tcp(socket) => self.handle.flush(socket),
            Stream::Tls(tls) => self.handle.flush(&mut **tls),
        };

        match flushed {
            Ok(done) => {
                self.last_write_time = Instant::now();
                Ok(done)
            }
            Err(e) if e.kind() == io::ErrorKind::WriteZero => {
                self.state = ConnState::Closed;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shrink a read buffer that ballooned for one oversized packet.
    pub fn maybe_shrink_read_buffer(&mut self) {
        if self.read_pos == 0 && self.read_buf.len() > READ_BUFFER_SHRINK_THRESHOLD {
            self.read_buf = vec![0u8; INITIAL_READ_BUFFER];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn loopback_socket() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let std_stream = StdTcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        // Keep the listener alive for the rest of the process: dropping it
        // while the accepted connection still sits in the backlog causes
        // the kernel to reset it out from under the client socket.
        std::mem::forget(listener);
        TcpStream::from_std(std_stream)
    }

    #[test]
    fn test_stream_raw_fd_matches_socket() {
        let socket = loopback_socket();
        let fd = socket.as_raw_fd();

        let stream = Stream::tcp(socket);
        assert_eq!(stream.raw_fd(), fd);
    }

    #[test]
    fn test_stream_socket_mut_reaches_the_connection() {
        let mut stream = Stream::tcp(loopback_socket());

        // the handle used for poll (de)registration is the live socket
        assert!(stream.socket_mut().peer_addr().is_ok());
    }
}
