//! Refcounted inflight message table.
//!
//! One table per session tracks outbound QoS 1/2 publishes (and inbound
//! QoS 2 publishes awaiting PUBREL) by packet identifier. Entries carry a
//! refcount so a single engine-level identifier can fan out to several
//! subscribers; when the count reaches zero the finish hook runs and the
//! entry is dropped.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use plume_core::error::{Error, Result};
use plume_core::packet::Publish;

use crate::session::Session;

/// Where an entry sits in its acknowledgement chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// QoS 1 sender: waiting for PUBACK.
    AwaitAck,
    /// QoS 2 sender: waiting for PUBREC.
    AwaitRec,
    /// QoS 2 sender: PUBREL sent, waiting for PUBCOMP.
    AwaitComp,
    /// QoS 2 receiver: waiting for PUBREL (deliver-once guard).
    AwaitRel,
}

/// Completion handle attached to an entry, consumed by the finish hook.
#[derive(Clone)]
pub enum Opaque {
    None,
    /// Completion decrements the engine-level refcounted entry.
    Fanout { engine_id: u16 },
    /// Completion notifies a qos1 retry coordinator with the client id.
    Retry {
        tx: Sender<Arc<str>>,
        client_id: Arc<str>,
    },
    /// The publishing session, for the sender-side PUBCOMP on fan-out
    /// completion of a qos2 publish.
    Sender { session: Weak<Session> },
}

pub struct InflightEntry {
    pub message: Publish,
    pub refcount: usize,
    pub opaque: Opaque,
    pub phase: Phase,
    /// Assignment order, for replay in first-assigned-identifier order.
    seq: u64,
}

type FinishHook = Box<dyn Fn(u16, &Publish, &Opaque) + Send + Sync>;

struct TableInner {
    entries: AHashMap<u16, InflightEntry>,
    next_id: u16,
    next_seq: u64,
}

pub struct MessageTable {
    inner: Mutex<TableInner>,
    on_finish: RwLock<Option<FinishHook>>,
}

impl MessageTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: AHashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
            on_finish: RwLock::new(None),
        }
    }

    /// Install the hook invoked when an entry's refcount reaches zero.
    pub fn set_on_finish(&self, hook: FinishHook) {
        *self.on_finish.write() = Some(hook);
    }

    /// Allocate the next free identifier, cycling through [1, 65535] and
    /// skipping identifiers still in use. Fails when the table is full.
    pub fn new_id(&self) -> Result<u16> {
        let mut inner = self.inner.lock();
        for _ in 0..u16::MAX {
            let id = inner.next_id;
            inner.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !inner.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Full("packet identifier space exhausted"))
    }

    /// Record a message pending acknowledgement. Returns false (leaving the
    /// existing entry untouched) if the identifier is already tracked.
    pub fn register(
        &self,
        id: u16,
        message: Publish,
        refcount: usize,
        opaque: Opaque,
        phase: Phase,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id,
            InflightEntry {
                message,
                refcount,
                opaque,
                phase,
                seq,
            },
        );
        true
    }

    /// Move an entry between phases (e.g. AwaitRec -> AwaitComp on PUBREC).
    pub fn transition(&self, id: u16, from: Phase, to: Phase) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.phase == from => {
                entry.phase = to;
                true
            }
            _ => false,
        }
    }

    /// Decrement an entry's refcount. At zero the entry is removed and the
    /// finish hook runs (outside the table lock). Returns true if the entry
    /// completed.
    pub fn unref(&self, id: u16) -> bool {
        let finished = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&id) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    if entry.refcount == 0 {
                        inner.entries.remove(&id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        match finished {
            Some(entry) => {
                if let Some(hook) = self.on_finish.read().as_ref() {
                    hook(id, &entry.message, &entry.opaque);
                }
                true
            }
            None => false,
        }
    }

    /// Drop an entry without running the finish hook.
    pub fn remove(&self, id: u16) -> Option<Publish> {
        self.inner.lock().entries.remove(&id).map(|e| e.message)
    }

    pub fn get(&self, id: u16) -> Option<Publish> {
        self.inner.lock().entries.get(&id).map(|e| e.message.clone())
    }

    pub fn phase(&self, id: u16) -> Option<Phase> {
        self.inner.lock().entries.get(&id).map(|e| e.phase)
    }

    /// Drop every entry.
    pub fn clean(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.next_id = 1;
    }

    /// Outstanding entries in first-assigned-identifier order, for replay
    /// after a reconnect.
    pub fn outstanding(&self) -> Vec<(u16, Publish, Phase)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, e)| (e.seq, *id, e.message.clone(), e.phase))
            .collect();
        entries.sort_by_key(|(seq, ..)| *seq);
        entries
            .into_iter()
            .map(|(_, id, msg, phase)| (id, msg, phase))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use plume_core::packet::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publish(qos: QoS, id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: Bytes::from_static(b"t"),
            packet_id: id,
            payload: Bytes::from_static(b"p"),
        }
    }

    #[test]
    fn test_new_id_cycles_and_skips_used() {
        let table = MessageTable::new();
        table.register(1, publish(QoS::AtLeastOnce, Some(1)), 1, Opaque::None, Phase::AwaitAck);
        table.register(2, publish(QoS::AtLeastOnce, Some(2)), 1, Opaque::None, Phase::AwaitAck);

        // ids 1 and 2 are live, so allocation starts at 3
        assert_eq!(table.new_id().unwrap(), 3);
        assert_eq!(table.new_id().unwrap(), 4);
    }

    #[test]
    fn test_full_table_errors() {
        let table = MessageTable::new();
        for id in 1..=u16::MAX {
            assert!(table.register(id, publish(QoS::AtLeastOnce, Some(id)), 1, Opaque::None, Phase::AwaitAck));
        }
        assert!(matches!(table.new_id(), Err(Error::Full(_))));
    }

    #[test]
    fn test_refcount_runs_hook_at_zero() {
        let table = Arc::new(MessageTable::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        table.set_on_finish(Box::new(move |_, _, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        table.register(7, publish(QoS::AtLeastOnce, Some(7)), 2, Opaque::None, Phase::AwaitAck);
        assert!(!table.unref(7));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.unref(7));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());

        // unref on an unknown id is a no-op
        assert!(!table.unref(7));
    }

    #[test]
    fn test_register_is_insert_only() {
        let table = MessageTable::new();
        assert!(table.register(3, publish(QoS::ExactlyOnce, Some(3)), 1, Opaque::None, Phase::AwaitRel));
        assert!(!table.register(3, publish(QoS::AtLeastOnce, Some(3)), 1, Opaque::None, Phase::AwaitAck));
        assert_eq!(table.phase(3), Some(Phase::AwaitRel));
    }

    #[test]
    fn test_get_and_remove() {
        let table = MessageTable::new();
        table.register(9, publish(QoS::AtLeastOnce, Some(9)), 1, Opaque::None, Phase::AwaitAck);

        assert_eq!(table.get(9).unwrap().packet_id, Some(9));
        assert!(table.get(10).is_none());

        // remove drops the entry without running the finish hook
        assert!(table.remove(9).is_some());
        assert!(table.get(9).is_none());
    }

    #[test]
    fn test_transition_checks_phase() {
        let table = MessageTable::new();
        table.register(4, publish(QoS::ExactlyOnce, Some(4)), 1, Opaque::None, Phase::AwaitRec);
        assert!(!table.transition(4, Phase::AwaitAck, Phase::AwaitComp));
        assert!(table.transition(4, Phase::AwaitRec, Phase::AwaitComp));
        assert_eq!(table.phase(4), Some(Phase::AwaitComp));
    }

    #[test]
    fn test_outstanding_in_assignment_order() {
        let table = MessageTable::new();
        for id in [5u16, 2, 9] {
            table.register(id, publish(QoS::AtLeastOnce, Some(id)), 1, Opaque::None, Phase::AwaitAck);
        }
        let ids: Vec<u16> = table.outstanding().into_iter().map(|(id, ..)| id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
    }

    #[test]
    fn test_clean_resets() {
        let table = MessageTable::new();
        table.register(1, publish(QoS::AtLeastOnce, Some(1)), 1, Opaque::None, Phase::AwaitAck);
        table.clean();
        assert!(table.is_empty());
        assert_eq!(table.new_id().unwrap(), 1);
    }
}
