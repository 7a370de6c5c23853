//! One-shot future surfaces for PaceMaker coordination.
//!
//! PaceMakers drive leader rotation off protocol milestones without
//! polling: each surface hands out receivers that resolve on the next
//! occurrence of its milestone. Resolution happens only on the engine
//! thread; a receiver whose milestone never occurs simply stays pending.

use kestrel_types::Hash;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// A list of one-shot subscribers to a single milestone.
///
/// Each [`subscribe`](Waiter::subscribe) returns a fresh receiver;
/// [`resolve`](Waiter::resolve) fires every outstanding receiver once and
/// leaves the waiter empty for the next round of subscriptions.
#[derive(Debug, Default)]
pub struct Waiter {
    senders: Vec<oneshot::Sender<Hash>>,
}

impl Waiter {
    pub fn subscribe(&mut self) -> oneshot::Receiver<Hash> {
        let (tx, rx) = oneshot::channel();
        self.senders.push(tx);
        rx
    }

    pub fn resolve(&mut self, value: Hash) {
        for sender in self.senders.drain(..) {
            // A dropped receiver is a listener that stopped caring.
            let _ = sender.send(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// The four coordination surfaces of the engine.
#[derive(Debug, Default)]
pub struct Waiters {
    /// Per-block: resolves when the block gains a quorum certificate.
    qc_finish: HashMap<Hash, Waiter>,
    /// Resolves on the next outbound proposal.
    propose: Waiter,
    /// Resolves on the next validated incoming proposal.
    receive_proposal: Waiter,
    /// Resolves on any `bqc` advance.
    bqc_update: Waiter,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_qc_finish(&mut self, blk_hash: Hash) -> oneshot::Receiver<Hash> {
        self.qc_finish.entry(blk_hash).or_default().subscribe()
    }

    pub fn resolve_qc_finish(&mut self, blk_hash: Hash) {
        if let Some(mut waiter) = self.qc_finish.remove(&blk_hash) {
            waiter.resolve(blk_hash);
        }
    }

    pub fn subscribe_propose(&mut self) -> oneshot::Receiver<Hash> {
        self.propose.subscribe()
    }

    pub fn resolve_propose(&mut self, blk_hash: Hash) {
        self.propose.resolve(blk_hash);
    }

    pub fn subscribe_receive_proposal(&mut self) -> oneshot::Receiver<Hash> {
        self.receive_proposal.subscribe()
    }

    pub fn resolve_receive_proposal(&mut self, blk_hash: Hash) {
        self.receive_proposal.resolve(blk_hash);
    }

    pub fn subscribe_bqc_update(&mut self) -> oneshot::Receiver<Hash> {
        self.bqc_update.subscribe()
    }

    pub fn resolve_bqc_update(&mut self, blk_hash: Hash) {
        self.bqc_update.resolve(blk_hash);
    }
}
