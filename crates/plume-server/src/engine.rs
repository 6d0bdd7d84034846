//! Engine / dispatcher.
//!
//! Owns the session table, the subscription matcher and the retained store,
//! and drives the CONNECT handshake, subscription changes and publish
//! fan-out. Fan-out is asynchronous: matched deliveries are queued to a pool
//! of worker threads which push into each target session. Items for one
//! client always hash onto the same queue, so per-subscriber order follows
//! the engine's decision order.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet, RandomState};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use plume_core::error::{ProtocolError, Result};
use plume_core::packet::{
    validate_filter, validate_topic, Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback,
    Subscribe, Unsuback, Unsubscribe,
};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connection::Connection;
use crate::inflight::{MessageTable, Opaque, Phase};
use crate::session::{Session, WriteOutcome};
use crate::shared::SharedStateHandle;
use crate::subscription::SubscribeSet;

/// Retransmit interval of the qos1 retry coordinator.
const RETRY_INTERVAL: Duration = Duration::from_secs(20);

/// Overall horizon after which the coordinator abandons remaining targets.
const RETRY_HORIZON: Duration = Duration::from_secs(60);

/// One delivery headed for one session, carried on a fan-out queue.
struct FanoutItem {
    session: Arc<Session>,
    publish: Publish,
    opaque: Opaque,
}

pub struct Engine {
    shared: SharedStateHandle,
    config: Arc<Config>,
    /// Engine-level outgoing table: one refcounted entry per qos>0 publish,
    /// drained as the per-target ack chains complete.
    outgoing: Arc<MessageTable>,
    fanout_txs: Vec<Sender<FanoutItem>>,
    auth: Arc<dyn Authenticator>,
    guid_counter: AtomicU64,
    hasher: RandomState,
}

impl Engine {
    pub fn new(
        shared: SharedStateHandle,
        config: Arc<Config>,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let outgoing = Arc::new(MessageTable::new());

        // Sender-side completion: when the fan-out of a qos2 publish fully
        // acknowledges, finish the publisher's own ack chain with PUBCOMP.
        // If the publisher already completed it via PUBREL this is a no-op.
        outgoing.set_on_finish(Box::new(|_id, msg, opaque| {
            if msg.qos != QoS::ExactlyOnce {
                return;
            }
            let Opaque::Sender { session } = opaque else {
                return;
            };
            let (Some(session), Some(sender_id)) = (session.upgrade(), msg.packet_id) else {
                return;
            };
            if session.outgoing().phase(sender_id) == Some(Phase::AwaitRel) {
                session.outgoing().remove(sender_id);
                let _ = session.write_packet(&Packet::Pubcomp {
                    packet_id: sender_id,
                });
            }
        }));

        let workers = if config.server.fanout_workers == 0 {
            num_cpus::get()
        } else {
            config.server.fanout_workers
        };

        let mut fanout_txs = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = bounded(config.server.queue_size);
            fanout_txs.push(tx);
            let shared = Arc::clone(&shared);
            let outgoing = Arc::clone(&outgoing);
            thread::Builder::new()
                .name(format!("fanout-{}", id))
                .spawn(move || fanout_loop(rx, shared, outgoing))
                .expect("spawn fan-out worker");
        }

        Arc::new(Self {
            shared,
            config,
            outgoing,
            fanout_txs,
            auth,
            guid_counter: AtomicU64::new(1),
            hasher: RandomState::new(),
        })
    }

    pub fn shared(&self) -> &SharedStateHandle {
        &self.shared
    }

    /// Publishes whose engine-level ack chains are still open.
    pub fn inflight_count(&self) -> usize {
        self.outgoing.len()
    }

    fn next_guid(&self) -> u64 {
        self.guid_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a session and wire its completion hook into the engine table.
    pub fn create_session(&self, client_id: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(
            client_id,
            self.next_guid(),
            self.config.session.offline_queue,
        ));

        let engine_outgoing = Arc::clone(&self.outgoing);
        session
            .outgoing()
            .set_on_finish(Box::new(move |_id, _msg, opaque| match opaque {
                Opaque::Fanout { engine_id } => {
                    engine_outgoing.unref(*engine_id);
                }
                Opaque::Retry { tx, client_id } => {
                    let _ = tx.try_send(Arc::clone(client_id));
                }
                _ => {}
            }));

        session
    }

    /// CONNECT handshake. Returns Ok(false) when the client was refused
    /// (CONNACK with the refusal code is already queued).
    pub fn handshake(&self, conn: &mut Connection, connect: Connect) -> Result<bool> {
        if let Err(code) = self.auth.authenticate(&connect, conn.remote_addr) {
            conn.queue_control_packet(&Packet::Connack(Connack {
                session_present: false,
                code,
            }))?;
            log::debug!(
                "refused client {:?} from {}: {:?}",
                connect.client_id,
                conn.remote_addr,
                code
            );
            return Ok(false);
        }

        if connect.client_id.is_empty() {
            conn.queue_control_packet(&Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::IdentifierRejected,
            }))?;
            return Ok(false);
        }

        conn.keep_alive = if connect.keep_alive == 0 {
            self.config.session.default_keep_alive
        } else {
            connect.keep_alive.min(self.config.session.max_keep_alive)
        };

        let existing = self.shared.sessions.get(&connect.client_id);

        // MQTT-3.2.2-2: session present iff a stored non-clean session
        // for this client id survives into this connection.
        let session_present = !connect.clean_session
            && existing.as_ref().is_some_and(|s| !s.clean_session());

        // CONNACK must be the first packet on the wire.
        conn.queue_control_packet(&Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
        }))?;

        let session = match existing {
            Some(session) => {
                if connect.clean_session {
                    // the stored state is discarded before attach
                    self.shared
                        .subscriptions
                        .write()
                        .remove_client(session.client_id());
                    session.reset(self.next_guid());
                }
                session
            }
            None => {
                let session = self.create_session(&connect.client_id);
                self.shared.sessions.set(&connect.client_id, Arc::clone(&session));
                session
            }
        };

        session.set_clean_session(connect.clean_session);
        session.set_keep_alive(conn.keep_alive);
        session.set_will(connect.will.clone());

        if let Some(prior) = session.attach(Arc::clone(&conn.handle)) {
            // most-recent-wins: the stale link goes down as a protocol error
            if !Arc::ptr_eq(&prior, &conn.handle) {
                log::info!(
                    "client {:?} reconnected, closing the previous connection",
                    connect.client_id
                );
                prior.request_close();
            }
        }
        conn.session = Some(Arc::clone(&session));

        if session_present {
            session.replay_outstanding();
            for parked in session.drain_offline() {
                if let Err(e) = session.write_publish(parked, Opaque::None, false) {
                    log::debug!(
                        "offline delivery to {:?} failed: {}",
                        session.client_id(),
                        e
                    );
                }
            }
        }

        self.shared.metrics.client_connected();
        log::debug!(
            "client {:?} connected (clean_session={}, session_present={}, keep_alive={}s)",
            connect.client_id,
            connect.clean_session,
            session_present,
            conn.keep_alive
        );
        Ok(true)
    }

    /// SUBSCRIBE: grant requested QoS per filter, reply SUBACK, then replay
    /// matching retained messages for every filter new to this client.
    pub fn subscribe(&self, session: &Arc<Session>, sub: Subscribe) -> Result<()> {
        let mut return_codes = Vec::with_capacity(sub.topics.len());
        let mut new_filters = Vec::new();

        for (filter, requested) in &sub.topics {
            let valid = validate_filter(filter).is_ok()
                && validate_topic(
                    filter.as_bytes(),
                    self.config.limits.max_topic_length,
                    self.config.limits.max_topic_levels,
                )
                .is_ok();
            if !valid {
                return_codes.push(0x80);
                continue;
            }

            let is_new = session.subscribe_filter(filter, *requested);
            // insert also refreshes the granted QoS of a replaced filter
            self.shared.subscriptions.write().subscribe(
                filter,
                SubscribeSet {
                    filter: Arc::from(filter.as_str()),
                    client_id: session.client_id_arc(),
                    qos: *requested,
                },
            );
            if is_new {
                new_filters.push((filter.clone(), *requested));
            }
            // granted = requested; duplicates keep their code but skip replay
            return_codes.push(*requested as u8);
        }

        session.write_packet(&Packet::Suback(Suback {
            packet_id: sub.packet_id,
            return_codes,
        }))?;

        // Retained delivery happens at the granted QoS (not the stored one),
        // each message with a fresh identifier from this subscriber's table.
        for (filter, granted) in new_filters {
            for retained in self.shared.retained.matching(&filter) {
                let publish = Publish {
                    dup: false,
                    qos: granted,
                    retain: true,
                    topic: retained.topic,
                    packet_id: None,
                    payload: retained.payload,
                };
                if let Err(e) = session.write_publish(publish, Opaque::None, false) {
                    log::debug!(
                        "retained replay to {:?} failed: {}",
                        session.client_id(),
                        e
                    );
                }
            }
        }

        Ok(())
    }

    pub fn unsubscribe(&self, session: &Arc<Session>, unsub: Unsubscribe) -> Result<()> {
        for filter in &unsub.topics {
            self.shared
                .subscriptions
                .write()
                .unsubscribe(filter, session.client_id());
            session.unsubscribe_filter(filter);
        }
        session.write_packet(&Packet::Unsuback(Unsuback {
            packet_id: unsub.packet_id,
        }))
    }

    /// Dispatch a publish to every matching subscriber.
    ///
    /// Retained handling runs first (empty retained payload deletes the
    /// entry and is not delivered). Targets are deduplicated to one copy per
    /// client; each copy is downgraded to min(publish QoS, granted QoS).
    pub fn dispatch_publish(&self, sender: Option<&Arc<Session>>, publish: Publish) -> Result<()> {
        if publish.topic.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic in PUBLISH".into()).into());
        }
        // MQTT-3.3.2-2: topic names carry no wildcards
        if publish.topic.iter().any(|&b| b == b'+' || b == b'#') {
            return Err(
                ProtocolError::MalformedPacket("wildcard in PUBLISH topic".into()).into(),
            );
        }
        validate_topic(
            &publish.topic,
            self.config.limits.max_topic_length,
            self.config.limits.max_topic_levels,
        )?;

        let topic = publish.topic_str().to_string();

        if publish.retain {
            if publish.payload.is_empty() {
                // MQTT-3.3.1-9: clears the retained message, not delivered
                self.shared.retained.remove(&topic)?;
                return Ok(());
            }
            self.shared.retained.store(&publish)?;
        }

        let mut matches = Vec::new();
        self.shared.subscriptions.read().matches(&topic, &mut matches);
        if matches.is_empty() {
            return Ok(());
        }

        // One copy per client. A client with several matching filters gets
        // the first filter's grant; the rest are skipped.
        let mut seen: AHashSet<Arc<str>> = AHashSet::with_capacity(matches.len());
        let mut targets: Vec<(Arc<Session>, QoS)> = Vec::with_capacity(matches.len());
        for set in matches {
            if !seen.insert(Arc::clone(&set.client_id)) {
                continue;
            }
            let Some(session) = self.shared.sessions.get(&set.client_id) else {
                log::debug!("subscriber {:?} has no session, skipping", &*set.client_id);
                continue;
            };
            targets.push((session, publish.qos.min(set.qos)));
        }
        if targets.is_empty() {
            return Ok(());
        }

        if self.config.experimental.qos1 && publish.qos == QoS::AtLeastOnce {
            self.qos1_retry_dispatch(publish, targets);
            return Ok(());
        }

        // Sender-side bookkeeping: one engine-level identifier, refcounted
        // over the ack-producing targets. With experimental.newid the
        // per-client tables carry the tracking alone.
        let mut engine_id = None;
        if publish.qos != QoS::AtMostOnce && !self.config.experimental.newid {
            let acked = targets.iter().filter(|(_, q)| *q != QoS::AtMostOnce).count();
            if acked > 0 {
                match self.outgoing.new_id() {
                    Ok(id) => {
                        let opaque = match sender {
                            Some(s) => Opaque::Sender {
                                session: Arc::downgrade(s),
                            },
                            None => Opaque::None,
                        };
                        let phase = match publish.qos {
                            QoS::AtLeastOnce => Phase::AwaitAck,
                            _ => Phase::AwaitRec,
                        };
                        // keeps the sender's original identifier in `message`
                        self.outgoing.register(id, publish.clone(), acked, opaque, phase);
                        engine_id = Some(id);
                    }
                    Err(e) => {
                        log::warn!("engine identifier space exhausted: {}", e);
                    }
                }
            }
        }

        for (session, qos) in targets {
            let copy = Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };
            let opaque = match (qos, engine_id) {
                (QoS::AtMostOnce, _) | (_, None) => Opaque::None,
                (_, Some(id)) => Opaque::Fanout { engine_id: id },
            };
            let counted = qos != QoS::AtMostOnce && engine_id.is_some();

            let shard =
                self.hasher.hash_one(session.client_id()) as usize % self.fanout_txs.len();
            let item = FanoutItem {
                session,
                publish: copy,
                opaque,
            };
            if self.fanout_txs[shard].send(item).is_err() {
                // shutdown; keep the engine entry's refcount honest
                if counted {
                    if let Some(id) = engine_id {
                        self.outgoing.unref(id);
                    }
                }
            }
        }

        Ok(())
    }

    /// Publish the session's stored will exactly once via the normal path.
    pub fn publish_will(&self, session: &Arc<Session>) {
        let Some(will) = session.take_will() else {
            return;
        };
        log::debug!(
            "publishing will of {:?} on {:?}",
            session.client_id(),
            will.topic
        );
        let publish = Publish {
            dup: false,
            qos: will.qos,
            retain: will.retain,
            topic: Bytes::from(will.topic.into_bytes()),
            packet_id: None,
            payload: Bytes::from(will.message),
        };
        if let Err(e) = self.dispatch_publish(None, publish) {
            log::warn!("will publish failed: {}", e);
        }
    }

    /// Tear-down after a physical connection dies. The will fires only on
    /// abnormal closes; a clean session is destroyed together with its
    /// subscriptions.
    pub fn connection_closed(&self, conn: &mut Connection) {
        let Some(session) = conn.session.take() else {
            return;
        };
        self.shared.metrics.client_disconnected();
        if !session.is_bound(&conn.handle) {
            // a newer connection took the session over; it is theirs now
            return;
        }
        session.detach(&conn.handle);

        if conn.graceful_disconnect {
            // DISCONNECT suppresses the will
            session.take_will();
        } else {
            self.publish_will(&session);
        }

        if session.clean_session() {
            self.shared
                .subscriptions
                .write()
                .remove_client(session.client_id());
            self.shared.sessions.remove(session.client_id());
            session.close();
        }
    }

    /// At-least-once delivery under reconnect: a short-lived coordinator
    /// tracks per-target completion, retransmits untaken targets as dup=1
    /// every `RETRY_INTERVAL` and abandons the rest at `RETRY_HORIZON`.
    /// Targets whose session guid changed mid-flight count as resolved.
    fn qos1_retry_dispatch(&self, publish: Publish, targets: Vec<(Arc<Session>, QoS)>) {
        struct RetryTarget {
            session: Arc<Session>,
            guid: u64,
            publish: Publish,
            id: Option<u16>,
        }

        let shared = Arc::clone(&self.shared);
        let (tx, rx): (Sender<Arc<str>>, Receiver<Arc<str>>) =
            bounded(targets.len().max(16));

        let spawned = thread::Builder::new()
            .name("qos1-retry".into())
            .spawn(move || {
                let mut pending: AHashMap<Arc<str>, RetryTarget> = AHashMap::new();

                for (session, qos) in targets {
                    let copy = Publish {
                        dup: false,
                        qos,
                        retain: false,
                        topic: publish.topic.clone(),
                        packet_id: None,
                        payload: publish.payload.clone(),
                    };

                    if qos == QoS::AtMostOnce {
                        // downgraded to qos0: fire and forget
                        let _ = session.write_publish(copy, Opaque::None, false);
                        continue;
                    }

                    let client_id = session.client_id_arc();
                    let guid = session.guid();
                    let opaque = Opaque::Retry {
                        tx: tx.clone(),
                        client_id: Arc::clone(&client_id),
                    };
                    let id = match session.write_publish(copy.clone(), opaque, false) {
                        Ok(WriteOutcome::Sent(id)) => id,
                        // parked or failed: picked up again at the next tick
                        _ => None,
                    };
                    pending.insert(
                        client_id,
                        RetryTarget {
                            session,
                            guid,
                            publish: copy,
                            id,
                        },
                    );
                }

                let deadline = Instant::now() + RETRY_HORIZON;
                while !pending.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        log::debug!("qos1 retry horizon reached, abandoning {} targets", pending.len());
                        break;
                    }
                    let tick = (now + RETRY_INTERVAL).min(deadline);

                    match rx.recv_deadline(tick) {
                        Ok(client_id) => {
                            pending.remove(&client_id);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            let tx = tx.clone();
                            pending.retain(|client_id, target| {
                                match shared.sessions.get(client_id) {
                                    Some(current) if current.guid() == target.guid => {
                                        if let Some(id) = target.id {
                                            let mut retry = target.publish.clone();
                                            retry.dup = true;
                                            retry.packet_id = Some(id);
                                            let _ = target.session.retransmit(&retry);
                                        } else {
                                            // never registered; try a full send
                                            let opaque = Opaque::Retry {
                                                tx: tx.clone(),
                                                client_id: Arc::clone(client_id),
                                            };
                                            if let Ok(WriteOutcome::Sent(id)) = target
                                                .session
                                                .write_publish(target.publish.clone(), opaque, false)
                                            {
                                                target.id = id;
                                            }
                                        }
                                        true
                                    }
                                    // reconnected as a different incarnation
                                    // or gone entirely: resolved
                                    _ => false,
                                }
                            });
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        if let Err(e) = spawned {
            log::error!("failed to spawn qos1 retry coordinator: {}", e);
        }
    }
}

/// Fan-out worker: drains one queue, pushing deliveries into sessions.
/// Blocks on slow connections rather than dropping; failed or parked qos>0
/// deliveries release their engine-level refcount so the sender's chain can
/// still complete.
fn fanout_loop(rx: Receiver<FanoutItem>, shared: SharedStateHandle, outgoing: Arc<MessageTable>) {
    while let Ok(item) = rx.recv() {
        let engine_ref = match &item.opaque {
            Opaque::Fanout { engine_id } => Some(*engine_id),
            _ => None,
        };

        match item.session.write_publish(item.publish, item.opaque, true) {
            Ok(WriteOutcome::Sent(_)) => {
                shared.metrics.add_msgs_sent(1);
            }
            Ok(WriteOutcome::Parked) => {
                // the ack chain restarts from the offline queue on reconnect
                if let Some(id) = engine_ref {
                    outgoing.unref(id);
                }
            }
            Err(e) => {
                shared.metrics.add_pub_msgs_dropped(1);
                log::debug!("fan-out delivery failed: {}", e);
                if let Some(id) = engine_ref {
                    outgoing.unref(id);
                }
            }
        }
    }
}
