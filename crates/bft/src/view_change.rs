//! View-change bookkeeping: blame collection and status notifies.
//!
//! The blame path is how this protocol regains liveness: replicas that
//! perceive a stalled leader sign a `Blame` for the current view, `2f+1`
//! distinct blames aggregate into a `BlameNotify`, and its receipt
//! advances the view. During the change each replica reports its highest
//! quorum certificate in a `Notify`; the next leader bundles `f + 1` of
//! those into its first proposal as the status certificate.
//!
//! This struct owns the collection state; the decisions that touch chain
//! state (view advance, timer cancellation) stay in the engine.

use kestrel_messages::{Blame, BlameNotify, Notify};
use kestrel_types::{
    blame_proof_hash, KeyPair, PartialCert, ReplicaConfig, ReplicaId, View,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::aggregate::PartialSet;

/// Blame aggregation and status-notify collection.
#[derive(Debug)]
pub struct ViewChangeState {
    config: Arc<ReplicaConfig>,

    /// Pending blame sets, keyed by blamed view.
    blame_sets: HashMap<View, PartialSet>,

    /// Views this replica has already signed a blame for.
    blamed_views: HashSet<View>,

    /// Blames currently out for signature verification.
    pending_blames: HashSet<(View, ReplicaId)>,

    /// Status notifies gathered since the last view change.
    status_notifies: Vec<Notify>,

    /// Whether a view change is waiting for status notifies.
    collecting_status: bool,
}

impl ViewChangeState {
    pub fn new(config: Arc<ReplicaConfig>) -> Self {
        Self {
            config,
            blame_sets: HashMap::new(),
            blamed_views: HashSet::new(),
            pending_blames: HashSet::new(),
            status_notifies: Vec::new(),
            collecting_status: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Blames
    // ═══════════════════════════════════════════════════════════════════

    /// Sign a blame for a view.
    ///
    /// Ed25519 is deterministic, so re-signing for a rebroadcast yields
    /// the identical message.
    pub fn make_blame(&self, id: ReplicaId, keypair: &KeyPair, view: View) -> Blame {
        let cert = PartialCert::create(keypair, id, blame_proof_hash(view));
        Blame {
            blamer: id,
            view,
            cert,
        }
    }

    /// Record that this replica blamed `view`. True on the first call.
    pub fn record_own_blame(&mut self, view: View) -> bool {
        self.blamed_views.insert(view)
    }

    /// Gate a received blame before delegating signature verification.
    ///
    /// Filters stale views, unknown blamers, duplicates and blames
    /// already out for verification.
    pub fn should_verify_blame(&mut self, blame: &Blame, current_view: View) -> bool {
        if blame.view < current_view {
            trace!(view = blame.view, current_view, "stale blame");
            return false;
        }
        if !self.config.contains(blame.blamer) {
            warn!(blamer = %blame.blamer, "blame from unknown replica");
            return false;
        }
        if self
            .blame_sets
            .get(&blame.view)
            .is_some_and(|set| set.contains(blame.blamer))
        {
            trace!(blamer = %blame.blamer, view = blame.view, "duplicate blame");
            return false;
        }
        self.pending_blames.insert((blame.view, blame.blamer))
    }

    /// Count a verified blame. Returns the blame quorum the moment it
    /// completes, and `None` before and after.
    pub fn add_blame(&mut self, blame: Blame) -> Option<BlameNotify> {
        self.pending_blames.remove(&(blame.view, blame.blamer));

        let view = blame.view;
        let set = self
            .blame_sets
            .entry(view)
            .or_insert_with(|| PartialSet::new(blame_proof_hash(view)));
        if !set.add(blame.cert) {
            return None;
        }

        debug!(
            view,
            blames = set.count(),
            needed = self.config.quorum_size(),
            "blame added"
        );

        if !set.has_quorum(&self.config) {
            return None;
        }
        match set.build_qc(&self.config) {
            Ok(qc) => {
                // Drop the set so a straggler blame cannot re-trigger.
                self.blame_sets.remove(&view);
                Some(BlameNotify { view, qc })
            }
            Err(err) => {
                warn!(view, error = %err, "failed to build blame quorum");
                None
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Status Notifies
    // ═══════════════════════════════════════════════════════════════════

    /// Begin a fresh status collection for a new view.
    pub fn start_status_collection(&mut self) {
        self.collecting_status = true;
        self.status_notifies.clear();
    }

    /// Collect a verified notify while a view change is in flight.
    pub fn collect_notify(&mut self, notify: Notify) {
        if self.collecting_status && self.status_notifies.len() < self.config.nmajority() {
            self.status_notifies.push(notify);
        }
    }

    /// Hand out the status certificate exactly once, when complete.
    pub fn take_status_cert(&mut self) -> Option<Vec<Notify>> {
        if self.status_notifies.len() < self.config.nmajority() {
            return None;
        }
        self.collecting_status = false;
        let mut notifies = std::mem::take(&mut self.status_notifies);
        notifies.truncate(self.config.nmajority());
        Some(notifies)
    }

    /// Forget state for views at or below `view` after an advance.
    pub fn cleanup(&mut self, view: View) {
        self.blame_sets.retain(|&v, _| v > view);
        self.blamed_views.retain(|&v| v > view);
        self.pending_blames.retain(|&(v, _)| v > view);
    }
}
