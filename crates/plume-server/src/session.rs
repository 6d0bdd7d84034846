//! Logical sessions.
//!
//! A session is the durable endpoint for one client id. It owns the
//! subscription set, the outgoing inflight table and the will message, and
//! binds to at most one physical connection at a time. Non-clean sessions
//! outlive their connection: outbound publishes park on a bounded offline
//! queue while detached and outstanding QoS 1/2 entries are replayed dup=1
//! on reattach.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use plume_core::error::{Error, Result};
use plume_core::packet::{self, Packet, Publish, QoS, Will};

use crate::conn_handle::ConnHandle;
use crate::inflight::{MessageTable, Opaque, Phase};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No bound connection (fresh, or detached and waiting for a reconnect).
    Init,
    Connecting,
    Connected,
    /// Destroyed; kept only until the last reference drops.
    Closed,
}

/// Outcome of routing an outbound publish through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Serialized to the bound connection; Some(id) when QoS > 0.
    Sent(Option<u16>),
    /// No bound connection; parked on the offline queue.
    Parked,
}

struct SessionInner {
    state: SessionState,
    conn: Option<Arc<ConnHandle>>,
    /// filter -> granted QoS. One representation, one owner.
    subscriptions: HashMap<String, QoS>,
    will: Option<Will>,
    keep_alive: u16,
    /// Publishes awaiting a reconnect, oldest first.
    offline: VecDeque<Publish>,
}

pub struct Session {
    client_id: Arc<str>,
    guid: AtomicU64,
    clean_session: AtomicBool,
    offline_limit: usize,
    inner: Mutex<SessionInner>,
    outgoing: MessageTable,
}

impl Session {
    pub fn new(client_id: &str, guid: u64, offline_limit: usize) -> Self {
        Self {
            client_id: Arc::from(client_id),
            guid: AtomicU64::new(guid),
            clean_session: AtomicBool::new(true),
            offline_limit,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                conn: None,
                subscriptions: HashMap::new(),
                will: None,
                keep_alive: 0,
                offline: VecDeque::new(),
            }),
            outgoing: MessageTable::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_id_arc(&self) -> Arc<str> {
        Arc::clone(&self.client_id)
    }

    pub fn guid(&self) -> u64 {
        self.guid.load(Ordering::Relaxed)
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session.load(Ordering::Relaxed)
    }

    pub fn set_clean_session(&self, clean: bool) {
        self.clean_session.store(clean, Ordering::Relaxed);
    }

    pub fn outgoing(&self) -> &MessageTable {
        &self.outgoing
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn keep_alive(&self) -> u16 {
        self.inner.lock().keep_alive
    }

    pub fn set_keep_alive(&self, secs: u16) {
        self.inner.lock().keep_alive = secs;
    }

    /// Bind a physical connection, most-recent-wins. Returns the displaced
    /// prior connection, which the caller closes as a protocol error.
    pub fn attach(&self, conn: Arc<ConnHandle>) -> Option<Arc<ConnHandle>> {
        let mut inner = self.inner.lock();
        let prior = inner.conn.replace(conn);
        inner.state = SessionState::Connected;
        prior
    }

    /// Unbind, but only if `conn` is still the bound connection (a takeover
    /// may already have replaced it).
    pub fn detach(&self, conn: &Arc<ConnHandle>) -> bool {
        let mut inner = self.inner.lock();
        match &inner.conn {
            Some(bound) if Arc::ptr_eq(bound, conn) => {
                inner.conn = None;
                inner.state = SessionState::Init;
                true
            }
            _ => false,
        }
    }

    pub fn is_bound(&self, conn: &Arc<ConnHandle>) -> bool {
        matches!(&self.inner.lock().conn, Some(bound) if Arc::ptr_eq(bound, conn))
    }

    /// Tear the session down for destruction.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        inner.conn = None;
        inner.subscriptions.clear();
        inner.offline.clear();
        inner.will = None;
        drop(inner);
        self.outgoing.clean();
    }

    /// Reset durable state for a clean-session CONNECT over an existing
    /// session. A fresh guid marks it as a different logical incarnation.
    pub fn reset(&self, new_guid: u64) {
        let mut inner = self.inner.lock();
        inner.subscriptions.clear();
        inner.offline.clear();
        inner.will = None;
        drop(inner);
        self.outgoing.clean();
        self.guid.store(new_guid, Ordering::Relaxed);
    }

    // --- will message ---

    pub fn set_will(&self, will: Option<Will>) {
        self.inner.lock().will = will;
    }

    /// Take the will for publication; it can only be taken once.
    pub fn take_will(&self) -> Option<Will> {
        self.inner.lock().will.take()
    }

    // --- subscriptions ---

    /// Record a subscription. Returns false when the (client, filter) pair
    /// already exists (the duplicate is not re-added).
    pub fn subscribe_filter(&self, filter: &str, qos: QoS) -> bool {
        let mut inner = self.inner.lock();
        match inner.subscriptions.get(filter) {
            Some(existing) if *existing == qos => false,
            Some(_) => {
                // re-subscribe at a different QoS replaces the grant
                inner.subscriptions.insert(filter.to_string(), qos);
                false
            }
            None => {
                inner.subscriptions.insert(filter.to_string(), qos);
                true
            }
        }
    }

    pub fn unsubscribe_filter(&self, filter: &str) -> bool {
        self.inner.lock().subscriptions.remove(filter).is_some()
    }

    pub fn subscribed_topics(&self) -> Vec<(String, QoS)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect()
    }

    // --- outbound paths ---

    /// Route a non-publish packet to the bound connection. Dropped while
    /// detached (only publishes park on the offline queue).
    pub fn write_packet(&self, pkt: &Packet) -> Result<()> {
        let conn = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.conn) {
                (SessionState::Connected, Some(conn)) => Arc::clone(conn),
                _ => return Ok(()),
            }
        };
        conn.queue_control_packet(pkt).map_err(Error::Io)
    }

    /// Route an outbound publish. For QoS > 0 a fresh identifier is drawn
    /// from the outgoing table and the entry registered before the bytes are
    /// serialized. Without a bound connection the publish parks on the
    /// offline queue (bounded, drop-oldest).
    pub fn write_publish(
        &self,
        mut publish: Publish,
        opaque: Opaque,
        block: bool,
    ) -> Result<WriteOutcome> {
        let conn = {
            let mut inner = self.inner.lock();
            let connected =
                inner.state == SessionState::Connected && inner.conn.is_some();
            if !connected {
                if inner.offline.len() >= self.offline_limit {
                    inner.offline.pop_front();
                }
                inner.offline.push_back(publish);
                return Ok(WriteOutcome::Parked);
            }
            Arc::clone(inner.conn.as_ref().unwrap())
        };

        let id = if publish.qos != QoS::AtMostOnce {
            let id = self.outgoing.new_id()?;
            publish.packet_id = Some(id);
            let phase = match publish.qos {
                QoS::AtLeastOnce => Phase::AwaitAck,
                _ => Phase::AwaitRec,
            };
            self.outgoing.register(id, publish.clone(), 1, opaque, phase);
            Some(id)
        } else {
            None
        };

        match conn.queue_publish(&publish, block) {
            Ok(()) => Ok(WriteOutcome::Sent(id)),
            Err(e) => {
                if let Some(id) = id {
                    self.outgoing.remove(id);
                }
                Err(Error::Io(e))
            }
        }
    }

    /// Retransmit an already-registered publish (dup replay, qos1 retry).
    /// No new identifier, no new entry; the pre-encoded bytes go through the
    /// raw path. Skipped while detached.
    pub fn retransmit(&self, publish: &Publish) -> Result<()> {
        let conn = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.conn) {
                (SessionState::Connected, Some(conn)) => Arc::clone(conn),
                _ => return Ok(()),
            }
        };
        let mut bytes = Vec::with_capacity(publish.topic.len() + publish.payload.len() + 8);
        packet::encode_publish(publish, &mut bytes);
        conn.write_raw(&bytes).map_err(Error::Io)
    }

    /// Replay every outstanding entry to the bound connection in
    /// first-assigned-identifier order: sender-phase publishes go out again
    /// as dup=1, entries already past PUBREC continue with PUBREL.
    pub fn replay_outstanding(&self) {
        for (id, mut publish, phase) in self.outgoing.outstanding() {
            match phase {
                Phase::AwaitAck | Phase::AwaitRec => {
                    publish.dup = true;
                    publish.packet_id = Some(id);
                    if let Err(e) = self.retransmit(&publish) {
                        log::warn!("replay to {:?} failed: {}", &*self.client_id, e);
                    }
                }
                Phase::AwaitComp => {
                    let _ = self.write_packet(&Packet::Pubrel { packet_id: id });
                }
                // inbound qos2 guard entries are not replayed
                Phase::AwaitRel => {}
            }
        }
    }

    /// Drain the offline queue for re-dispatch through the normal write
    /// path (fresh identifiers).
    pub fn drain_offline(&self) -> Vec<Publish> {
        self.inner.lock().offline.drain(..).collect()
    }

    #[cfg(test)]
    pub fn offline_len(&self) -> usize {
        self.inner.lock().offline.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mio::Token;

    fn publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: Bytes::from_static(b"t"),
            packet_id: None,
            payload: Bytes::from_static(b"p"),
        }
    }

    fn handle(id: usize) -> Arc<ConnHandle> {
        // Dummy fds; no I/O happens in these tests.
        Arc::new(ConnHandle::new(0, -1, -1, Token(id)))
    }

    #[test]
    fn test_offline_queue_bounded_drop_oldest() {
        let session = Session::new("c1", 1, 3);
        for i in 0..5u8 {
            let mut p = publish(QoS::AtMostOnce);
            p.payload = Bytes::copy_from_slice(&[i]);
            assert_eq!(
                session.write_publish(p, Opaque::None, false).unwrap(),
                WriteOutcome::Parked
            );
        }
        assert_eq!(session.offline_len(), 3);
        let drained = session.drain_offline();
        // the two oldest were dropped
        assert_eq!(drained[0].payload[0], 2);
        assert_eq!(drained[2].payload[0], 4);
    }

    #[test]
    fn test_attach_most_recent_wins() {
        let session = Session::new("c1", 1, 10);
        let first = handle(1);
        let second = handle(2);

        assert!(session.attach(Arc::clone(&first)).is_none());
        let displaced = session.attach(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(session.is_bound(&second));

        // detach by the displaced link is a no-op
        assert!(!session.detach(&first));
        assert!(session.detach(&second));
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn test_write_publish_registers_qos1() {
        let session = Session::new("c1", 1, 10);
        session.attach(handle(1));

        let outcome = session
            .write_publish(publish(QoS::AtLeastOnce), Opaque::None, false)
            .unwrap();
        let WriteOutcome::Sent(Some(id)) = outcome else {
            panic!("expected a registered send, got {:?}", outcome);
        };
        assert_eq!(session.outgoing().phase(id), Some(Phase::AwaitAck));

        // PUBACK completes the chain
        assert!(session.outgoing().unref(id));
        assert!(session.outgoing().is_empty());
    }

    #[test]
    fn test_qos0_not_tracked() {
        let session = Session::new("c1", 1, 10);
        session.attach(handle(1));

        let outcome = session
            .write_publish(publish(QoS::AtMostOnce), Opaque::None, false)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Sent(None));
        assert!(session.outgoing().is_empty());
    }

    #[test]
    fn test_subscription_set_dedup() {
        let session = Session::new("c1", 1, 10);
        assert!(session.subscribe_filter("a/+", QoS::AtLeastOnce));
        assert!(!session.subscribe_filter("a/+", QoS::AtLeastOnce));
        assert!(!session.subscribe_filter("a/+", QoS::ExactlyOnce));
        assert_eq!(session.subscribed_topics().len(), 1);
        assert!(session.unsubscribe_filter("a/+"));
        assert!(!session.unsubscribe_filter("a/+"));
    }

    #[test]
    fn test_reset_clears_durable_state() {
        let session = Session::new("c1", 7, 10);
        session.subscribe_filter("x", QoS::AtMostOnce);
        session.set_will(Some(Will {
            topic: "bye".into(),
            message: b"gone".to_vec(),
            qos: QoS::AtMostOnce,
            retain: false,
        }));
        let _ = session.write_publish(publish(QoS::AtLeastOnce), Opaque::None, false);

        session.reset(8);
        assert_eq!(session.guid(), 8);
        assert!(session.subscribed_topics().is_empty());
        assert!(session.take_will().is_none());
        assert!(session.outgoing().is_empty());
        assert_eq!(session.offline_len(), 0);
    }
}
