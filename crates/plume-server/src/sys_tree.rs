//! $SYS broker statistics.
//!
//! Workers bump lock-free counters on the hot path; the maintenance tick
//! formats and publishes them under `$SYS/broker/...` through the normal
//! dispatch path as qos0, retain-cleared messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use plume_core::packet::{Publish, QoS};

use crate::engine::Engine;

/// Static topic strings.
pub mod topics {
    pub const VERSION: &str = "$SYS/broker/version";
    pub const UPTIME: &str = "$SYS/broker/uptime";
    pub const TIME: &str = "$SYS/broker/time";

    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
    pub const CLIENTS_MAXIMUM: &str = "$SYS/broker/clients/maximum";

    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const MESSAGES_INFLIGHT: &str = "$SYS/broker/messages/inflight";
    pub const MESSAGES_DROPPED: &str = "$SYS/broker/messages/publish/dropped";

    pub const RETAINED_COUNT: &str = "$SYS/broker/retained messages/count";
    pub const SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";
}

/// Global broker counters. Updated by workers, read by the maintenance tick.
pub struct BrokerMetrics {
    pub msgs_received: AtomicU64,
    pub msgs_sent: AtomicU64,
    pub pub_msgs_dropped: AtomicU64,
    pub clients_connected: AtomicU64,
    pub clients_maximum: AtomicU64,
    pub connections_total: AtomicU64,
    pub sockets_opened: AtomicU64,
}

impl BrokerMetrics {
    pub const fn new() -> Self {
        Self {
            msgs_received: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            pub_msgs_dropped: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            clients_maximum: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            sockets_opened: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_msgs_received(&self, n: u64) {
        self.msgs_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_msgs_sent(&self, n: u64) {
        self.msgs_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_pub_msgs_dropped(&self, n: u64) {
        self.pub_msgs_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_sockets_opened(&self) {
        self.sockets_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let current = self.clients_connected.fetch_add(1, Ordering::Relaxed) + 1;
        let mut max = self.clients_maximum.load(Ordering::Relaxed);
        while current > max {
            match self.clients_maximum.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }

    #[inline]
    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the `$SYS/broker/...` tree at the configured interval.
pub struct SysPublisher {
    engine: Arc<Engine>,
    started: Instant,
}

impl SysPublisher {
    pub fn new(engine: Arc<Engine>) -> Self {
        let publisher = Self {
            engine,
            started: Instant::now(),
        };
        publisher.emit(topics::VERSION, env!("CARGO_PKG_VERSION"));
        publisher
    }

    pub fn publish(&self) {
        let shared = self.engine.shared();
        let m = &shared.metrics;

        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.emit(topics::UPTIME, &self.started.elapsed().as_secs().to_string());
        self.emit(topics::TIME, &unix_now.to_string());
        self.emit(
            topics::CLIENTS_CONNECTED,
            &m.clients_connected.load(Ordering::Relaxed).to_string(),
        );
        self.emit(topics::CLIENTS_TOTAL, &shared.sessions.len().to_string());
        self.emit(
            topics::CLIENTS_MAXIMUM,
            &m.clients_maximum.load(Ordering::Relaxed).to_string(),
        );
        self.emit(
            topics::MESSAGES_RECEIVED,
            &m.msgs_received.load(Ordering::Relaxed).to_string(),
        );
        self.emit(
            topics::MESSAGES_SENT,
            &m.msgs_sent.load(Ordering::Relaxed).to_string(),
        );
        self.emit(
            topics::MESSAGES_INFLIGHT,
            &self.engine.inflight_count().to_string(),
        );
        self.emit(
            topics::MESSAGES_DROPPED,
            &m.pub_msgs_dropped.load(Ordering::Relaxed).to_string(),
        );
        self.emit(topics::RETAINED_COUNT, &shared.retained.len().to_string());
        self.emit(
            topics::SUBSCRIPTIONS_COUNT,
            &shared.subscriptions.read().count().to_string(),
        );
    }

    fn emit(&self, topic: &'static str, value: &str) {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Bytes::from_static(topic.as_bytes()),
            packet_id: None,
            payload: Bytes::copy_from_slice(value.as_bytes()),
        };
        if let Err(e) = self.engine.dispatch_publish(None, publish) {
            log::debug!("$SYS publish on {} failed: {}", topic, e);
        }
    }
}
