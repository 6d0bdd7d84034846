//! Worker thread driving a subset of physical connections.
//!
//! Each worker owns a mio Poll, reads and decodes inbound packets, runs the
//! per-connection state machine, flushes outbound buffers and sweeps
//! keep-alive deadlines. Cross-thread deliveries land directly in a
//! connection's write handle; the control channel carries only new
//! connections and shutdown.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::Receiver;
use mio::{Events, Interest, Poll, Token};

use plume_core::error::{Error, ProtocolError, Result};
use plume_core::packet::{Packet, Publish, QoS};

use crate::config::Config;
use crate::connection::{ConnState, Connection, Stream};
use crate::engine::Engine;
use crate::inflight::{Opaque, Phase};
use crate::session::Session;
use crate::shared::SharedStateHandle;
use crate::util::RateLimitedCounter;

/// Control messages; publish delivery bypasses channels entirely.
pub enum WorkerMsg {
    NewConn {
        stream: Stream,
        addr: SocketAddr,
    },
    Shutdown,
}

/// Unanswered broker-side PINGREQ probes tolerated before closing.
const PING_PROBE_LIMIT: u8 = 2;

/// Starting token for connections within this worker.
const CONN_START: usize = 1;

pub struct Worker {
    pub id: usize,
    poll: Poll,
    epoll_fd: i32,
    conns: AHashMap<Token, Connection>,
    next_token: usize,
    engine: Arc<Engine>,
    shared: SharedStateHandle,
    rx: Receiver<WorkerMsg>,
    config: Arc<Config>,
    drop_log: RateLimitedCounter,
}

impl Worker {
    pub fn new(
        id: usize,
        engine: Arc<Engine>,
        rx: Receiver<WorkerMsg>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let epoll_fd = poll.as_raw_fd();
        let shared = Arc::clone(engine.shared());

        Ok(Self {
            id,
            poll,
            epoll_fd,
            conns: AHashMap::new(),
            next_token: CONN_START,
            engine,
            shared,
            rx,
            config,
            drop_log: RateLimitedCounter::new(Duration::from_secs(10)),
        })
    }

    /// Run the worker event loop until shutdown.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if !self.run_once()? {
                return Ok(());
            }
        }
    }

    /// One iteration of the event loop. Returns false on shutdown.
    pub fn run_once(&mut self) -> Result<bool> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, Some(Duration::from_millis(10)))?;

        for event in events.iter() {
            let token = event.token();

            if event.is_error() || event.is_write_closed() {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.state = ConnState::Closed;
                }
                continue;
            }

            // A half-close may still carry buffered packets (a trailing
            // DISCONNECT in particular), so read before tearing down.
            if event.is_readable() || event.is_read_closed() {
                self.handle_readable(token)?;
            }
            if event.is_writable() {
                self.handle_writable(token)?;
            }
        }

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                WorkerMsg::NewConn { stream, addr } => {
                    let token = self.accept_conn(stream, addr)?;
                    // Edge-triggered: bytes that arrived before registration
                    // fire no event, so do an initial read.
                    self.handle_readable(token)?;
                }
                WorkerMsg::Shutdown => {
                    for conn in self.conns.values_mut() {
                        conn.state = ConnState::Closed;
                    }
                    self.cleanup_conns();
                    return Ok(false);
                }
            }
        }

        self.sweep_keepalive();
        self.cleanup_conns();

        Ok(true)
    }

    fn accept_conn(&mut self, mut stream: Stream, addr: SocketAddr) -> Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(stream.socket_mut(), token, Interest::READABLE)?;

        let conn = Connection::new(token, stream, addr, self.id, self.epoll_fd);
        self.conns.insert(token, conn);
        self.shared.metrics.increment_sockets_opened();

        Ok(token)
    }

    fn session_of(&self, token: Token) -> Option<Arc<Session>> {
        self.conns.get(&token).and_then(|c| c.session.clone())
    }

    fn handle_readable(&mut self, token: Token) -> Result<()> {
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            match conn.read() {
                Ok(true) => {}
                Ok(false) => {
                    if conn.eof {
                        conn.state = ConnState::Closed;
                    }
                    return Ok(());
                }
                Err(_) => {
                    conn.state = ConnState::Closed;
                    return Ok(());
                }
            }
        }

        loop {
            let packet = {
                let Some(conn) = self.conns.get_mut(&token) else {
                    return Ok(());
                };
                if conn.state == ConnState::Closed {
                    return Ok(());
                }
                match conn.decode_packet(self.config.limits.max_packet_size) {
                    Ok(Some(pkt)) => {
                        conn.last_packet_time = Instant::now();
                        pkt
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("decode error from {}: {}", conn.remote_addr, e);
                        conn.state = ConnState::Closed;
                        return Ok(());
                    }
                }
            };
            self.shared.metrics.add_msgs_received(1);

            // Protocol handling never panics out of a connection: a panic is
            // caught here, logged, and only this connection goes down.
            let outcome = catch_unwind(AssertUnwindSafe(|| self.handle_packet(token, packet)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if let Some(conn) = self.conns.get_mut(&token) {
                        log::debug!("closing {}: {}", conn.remote_addr, e);
                        conn.state = ConnState::Closed;
                    }
                    return Ok(());
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    log::error!("panic handling packet on {:?}: {}", token, msg);
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.state = ConnState::Closed;
                    }
                    return Ok(());
                }
            }
        }

        // EOF after the buffered packets: a close without DISCONNECT, so
        // the will fires
        if let Some(conn) = self.conns.get_mut(&token) {
            if conn.eof && conn.state != ConnState::Closed {
                conn.state = ConnState::Closed;
            }
        }

        Ok(())
    }

    fn handle_writable(&mut self, token: Token) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&token) else {
            return Ok(());
        };

        if conn.handle.is_close_requested() {
            conn.state = ConnState::Closed;
            return Ok(());
        }

        if conn.flush().is_err() {
            conn.state = ConnState::Closed;
        }

        Ok(())
    }

    /// Per-packet state machine while connected; anything but CONNECT
    /// beforehand (or a second CONNECT) is a protocol error.
    fn handle_packet(&mut self, token: Token, packet: Packet) -> Result<()> {
        let Some(state) = self.conns.get(&token).map(|c| c.state) else {
            return Ok(());
        };

        match packet {
            Packet::Connect(connect) => {
                if state != ConnState::Init {
                    // MQTT-3.1.0-2
                    return Err(ProtocolError::SecondConnect.into());
                }
                let engine = Arc::clone(&self.engine);
                let conn = self.conns.get_mut(&token).expect("state was just read");
                conn.state = ConnState::Connecting;
                if engine.handshake(conn, connect)? {
                    conn.state = ConnState::Connected;
                } else {
                    // refusal CONNACK is queued; close without a will
                    conn.graceful_disconnect = true;
                    conn.state = ConnState::Closed;
                }
            }

            // MQTT-3.1.0-1
            _ if state != ConnState::Connected => {
                return Err(ProtocolError::FirstPacketNotConnect.into());
            }

            Packet::Publish(publish) => self.handle_publish(token, publish)?,

            Packet::Puback { packet_id } => {
                if let Some(session) = self.session_of(token) {
                    session.outgoing().unref(packet_id);
                }
            }

            Packet::Pubrec { packet_id } => {
                if let Some(session) = self.session_of(token) {
                    session
                        .outgoing()
                        .transition(packet_id, Phase::AwaitRec, Phase::AwaitComp);
                }
                if let Some(conn) = self.conns.get(&token) {
                    conn.queue_control_packet(&Packet::Pubrel { packet_id })?;
                }
            }

            Packet::Pubrel { packet_id } => {
                if let Some(conn) = self.conns.get(&token) {
                    conn.queue_control_packet(&Packet::Pubcomp { packet_id })?;
                }
                // deliver-once: drops the AWAIT_REL guard entry
                if let Some(session) = self.session_of(token) {
                    session.outgoing().unref(packet_id);
                }
            }

            Packet::Pubcomp { packet_id } => {
                if let Some(session) = self.session_of(token) {
                    session.outgoing().unref(packet_id);
                }
            }

            Packet::Subscribe(sub) => {
                let session = self
                    .session_of(token)
                    .ok_or_else(|| Error::Internal("SUBSCRIBE without a session".into()))?;
                self.engine.subscribe(&session, sub)?;
            }

            Packet::Unsubscribe(unsub) => {
                let session = self
                    .session_of(token)
                    .ok_or_else(|| Error::Internal("UNSUBSCRIBE without a session".into()))?;
                self.engine.unsubscribe(&session, unsub)?;
            }

            Packet::Pingreq => {
                if let Some(conn) = self.conns.get(&token) {
                    conn.queue_control_packet(&Packet::Pingresp)?;
                }
            }

            Packet::Pingresp => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.ping_counter = conn.ping_counter.saturating_sub(1);
                }
            }

            Packet::Disconnect => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.graceful_disconnect = true;
                    conn.state = ConnState::Closed;
                }
            }

            // server-to-client packets have no business arriving here
            Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback(_) => {
                log::debug!("ignoring unexpected packet on {:?}", token);
            }
        }

        Ok(())
    }

    fn handle_publish(&mut self, token: Token, publish: Publish) -> Result<()> {
        let session = self
            .session_of(token)
            .ok_or_else(|| Error::Internal("PUBLISH without a session".into()))?;

        match publish.qos {
            QoS::AtMostOnce => {
                self.engine.dispatch_publish(Some(&session), publish)?;
            }

            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| ProtocolError::MalformedPacket("qos1 without id".into()))?;
                self.engine.dispatch_publish(Some(&session), publish)?;
                if let Some(conn) = self.conns.get(&token) {
                    conn.queue_control_packet(&Packet::Puback { packet_id })?;
                }
            }

            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| ProtocolError::MalformedPacket("qos2 without id".into()))?;

                // A resend of an identifier still awaiting PUBREL is the
                // same application message: ack again, deliver once.
                let duplicate = session.outgoing().phase(packet_id) == Some(Phase::AwaitRel);
                if !duplicate {
                    let registered = session.outgoing().register(
                        packet_id,
                        publish.clone(),
                        1,
                        Opaque::None,
                        Phase::AwaitRel,
                    );
                    if !registered {
                        log::warn!(
                            "inbound qos2 identifier {} collides with an outbound entry for {:?}",
                            packet_id,
                            session.client_id()
                        );
                    }
                    if let Err(e) = self.engine.dispatch_publish(Some(&session), publish) {
                        if registered {
                            session.outgoing().remove(packet_id);
                        }
                        return Err(e);
                    }
                }
                if let Some(conn) = self.conns.get(&token) {
                    conn.queue_control_packet(&Packet::Pubrec { packet_id })?;
                }
            }
        }

        Ok(())
    }

    /// Keep-alive deadlines: reads must arrive within 1.5x the negotiated
    /// interval; an idle outbound side sends PINGREQ probes and gives up
    /// after `PING_PROBE_LIMIT` unanswered ones.
    fn sweep_keepalive(&mut self) {
        let now = Instant::now();
        for conn in self.conns.values_mut() {
            if conn.state == ConnState::Connected && conn.keep_alive > 0 {
                let interval = Duration::from_secs(conn.keep_alive as u64);
                let read_deadline = interval + interval / 2;

                if now.duration_since(conn.last_packet_time) > read_deadline {
                    log::debug!(
                        "keep-alive timeout for {} ({}s elapsed)",
                        conn.remote_addr,
                        now.duration_since(conn.last_packet_time).as_secs()
                    );
                    // counts as Timeout: the will fires
                    conn.state = ConnState::Closed;
                } else if now.duration_since(conn.last_write_time) >= interval {
                    if conn.ping_counter >= PING_PROBE_LIMIT {
                        conn.state = ConnState::Closed;
                    } else if conn.queue_control_packet(&Packet::Pingreq).is_ok() {
                        conn.ping_counter += 1;
                        conn.last_write_time = now;
                    }
                }
            }
            conn.maybe_shrink_read_buffer();
        }
    }

    /// Tear down closed connections; wills and session lifecycle run in the
    /// engine.
    fn cleanup_conns(&mut self) {
        if self.conns.values().all(|c| c.state != ConnState::Closed) {
            return;
        }

        let closed: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state == ConnState::Closed)
            .map(|(t, _)| *t)
            .collect();

        let mut dropped = 0u64;
        for token in closed {
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = self
                    .poll
                    .registry()
                    .deregister(conn.stream.socket_mut());
                // unblocks fan-out writers waiting on this connection
                conn.handle.request_close();
                if conn.handle.has_pending_writes() {
                    dropped += 1;
                }
                self.engine.connection_closed(&mut conn);
            }
        }

        if dropped > 0 {
            if let Some(total) = self.drop_log.increment_by(dropped) {
                log::warn!(
                    "worker {}: dropped buffered output of {} closing connections",
                    self.id,
                    total
                );
            }
        }
    }
}
