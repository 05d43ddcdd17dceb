//! Pending request/response correlation.
//!
//! Every correlated request gets a single-resolution slot. Registering a new
//! slot under a key that already has one abandons the old slot: its
//! [`PendingReply`] reports [`ReplyState::Abandoned`] and never resolves.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use perfkit_core::{Error, Result};

/// Observed state of a pending reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyState<T> {
    /// Not resolved yet
    Pending,
    /// Resolved; the value has been taken out of the handle
    Ready(T),
    /// Replaced by a newer request, torn down, or already taken
    Abandoned,
}

/// Caller-side handle of a correlated request.
///
/// Poll with [`PendingReply::try_take`] from a tick loop, or `.await` it; an
/// abandoned reply resolves the future with [`Error::Abandoned`].
#[derive(Debug)]
pub struct PendingReply<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> PendingReply<T> {
    fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Take the value if it has arrived.
    pub fn try_take(&mut self) -> ReplyState<T> {
        match self.rx.try_recv() {
            Ok(value) => ReplyState::Ready(value),
            Err(TryRecvError::Empty) => ReplyState::Pending,
            Err(TryRecvError::Closed) => ReplyState::Abandoned,
        }
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Abandoned))
    }
}

/// At most one outstanding slot per key.
#[derive(Debug)]
pub struct PendingTable<K, T> {
    slots: HashMap<K, oneshot::Sender<T>>,
}

impl<K: Hash + Eq + std::fmt::Debug, T> PendingTable<K, T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Open a slot for `key`, abandoning any unresolved slot it replaces.
    pub fn register(&mut self, key: K) -> PendingReply<T> {
        let (tx, reply) = PendingReply::channel();
        if let Some(previous) = self.slots.get(&key) {
            if !previous.is_closed() {
                debug!("Abandoning pending request: key={:?}", key);
            }
        }
        self.slots.insert(key, tx);
        reply
    }

    /// Resolve the slot for `key`. Returns `false` if there was none.
    pub fn resolve<Q>(&mut self, key: &Q, value: T) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.slots.remove(key) {
            // A dropped handle means the caller lost interest; the slot is
            // still consumed.
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Whether `key` has an unresolved slot.
    pub fn is_pending<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.contains_key(key)
    }

    /// Number of unresolved slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no unresolved slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Abandon every slot. Returns how many were open.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }
}

impl<K: Hash + Eq + std::fmt::Debug, T> Default for PendingTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single outstanding slot tagged with a monotonically increasing sequence.
#[derive(Debug)]
pub struct SequencedSlot<T> {
    last_seq: u64,
    current: Option<(u64, oneshot::Sender<T>)>,
}

impl<T> SequencedSlot<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            last_seq: 0,
            current: None,
        }
    }

    /// Allocate the next sequence number and open its slot, abandoning the
    /// previous one.
    pub fn issue(&mut self) -> (u64, PendingReply<T>) {
        self.last_seq += 1;
        let (tx, reply) = PendingReply::channel();
        if let Some((seq, _)) = self.current.replace((self.last_seq, tx)) {
            debug!("Superseding pending request: seq={}", seq);
        }
        (self.last_seq, reply)
    }

    /// Resolve if `seq` is the outstanding sequence. Stale sequences return
    /// `false` and leave the slot untouched.
    pub fn resolve(&mut self, seq: u64, value: T) -> bool {
        match self.current.take() {
            Some((current, tx)) if current == seq => {
                let _ = tx.send(value);
                true
            }
            other => {
                self.current = other;
                false
            }
        }
    }

    /// Sequence number of the outstanding request.
    pub fn current_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|(seq, _)| *seq)
    }

    /// Last sequence number handed out.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Abandon the outstanding request, if any.
    pub fn abandon(&mut self) -> bool {
        self.current.take().is_some()
    }
}

impl<T> Default for SequencedSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_resolve() {
        let mut table: PendingTable<String, u32> = PendingTable::new();
        let mut reply = table.register("frame".to_string());
        assert_eq!(reply.try_take(), ReplyState::Pending);
        assert!(table.is_pending("frame"));

        assert!(table.resolve("frame", 7));
        assert_eq!(reply.try_take(), ReplyState::Ready(7));
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_replace_abandons_previous() {
        let mut table: PendingTable<String, u32> = PendingTable::new();
        let mut first = table.register("X".to_string());
        let mut second = table.register("X".to_string());
        assert_eq!(table.len(), 1);

        assert_eq!(first.try_take(), ReplyState::Abandoned);
        assert!(table.resolve("X", 1));
        assert_eq!(second.try_take(), ReplyState::Ready(1));
        assert_eq!(first.try_take(), ReplyState::Abandoned);
    }

    #[test]
    fn test_table_resolve_without_slot() {
        let mut table: PendingTable<String, u32> = PendingTable::new();
        assert!(!table.resolve("missing", 1));
    }

    #[test]
    fn test_table_abandon_all() {
        let mut table: PendingTable<&'static str, u32> = PendingTable::new();
        let mut a = table.register("a");
        let mut b = table.register("b");
        assert_eq!(table.abandon_all(), 2);
        assert_eq!(a.try_take(), ReplyState::Abandoned);
        assert_eq!(b.try_take(), ReplyState::Abandoned);
    }

    #[test]
    fn test_sequenced_slot_only_latest_resolves() {
        let mut slot: SequencedSlot<&'static str> = SequencedSlot::new();
        let (seq1, mut first) = slot.issue();
        let (seq2, mut second) = slot.issue();
        assert!(seq2 > seq1);
        assert_eq!(slot.current_seq(), Some(seq2));

        assert!(!slot.resolve(seq1, "stale"));
        assert_eq!(slot.current_seq(), Some(seq2));
        assert_eq!(first.try_take(), ReplyState::Abandoned);

        assert!(slot.resolve(seq2, "fresh"));
        assert_eq!(second.try_take(), ReplyState::Ready("fresh"));
        assert_eq!(slot.current_seq(), None);
    }

    #[test]
    fn test_sequenced_slot_abandon() {
        let mut slot: SequencedSlot<u8> = SequencedSlot::new();
        let (seq, mut reply) = slot.issue();
        assert!(slot.abandon());
        assert!(!slot.resolve(seq, 1));
        assert_eq!(reply.try_take(), ReplyState::Abandoned);
        assert_eq!(slot.last_seq(), seq);
    }

    #[tokio::test]
    async fn test_await_resolved_reply() {
        let mut table: PendingTable<u32, String> = PendingTable::new();
        let reply = table.register(1);
        table.resolve(&1, "done".to_string());
        assert_eq!(reply.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_await_abandoned_reply() {
        let mut table: PendingTable<u32, String> = PendingTable::new();
        let reply = table.register(1);
        let _newer = table.register(1);
        assert!(matches!(reply.await, Err(Error::Abandoned)));
    }
}
