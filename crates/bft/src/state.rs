//! The replica consensus state machine.
//!
//! Single-threaded by discipline: exactly one logical engine thread owns
//! this struct and everything it reaches. Verification pools and timers
//! run elsewhere and talk back through events.

use kestrel_core::{Action, Event, OutboundMessage, StateMachine};
use kestrel_messages::{Finality, Proposal, Vote};
use kestrel_types::{
    vote_proof_hash, Block, BlockRef, BlockStore, Hash, Height, KeyPair, PartialCert, QuorumCert,
    ReplicaConfig, ReplicaId, View,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};

use crate::aggregate::PartialSet;
use crate::view_change::ViewChangeState;
use crate::waiters::Waiters;

/// Drop counters surfaced to the host.
///
/// The engine never errors outward on bad input; it counts and moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStats {
    /// Inputs that failed parsing-level or structural checks.
    pub dropped_malformed: u64,
    /// Inputs whose certificates failed verification.
    pub dropped_invalid: u64,
    /// Inputs that were valid but superseded (old views, certified blocks).
    pub dropped_stale: u64,
}

/// The replica state machine.
///
/// # State Machine Flow
///
/// 1. **Proposal received** → verify, adopt embedded certificates, vote
///    if the safety rule allows, arm the 2Δ commit timer
/// 2. **Vote received** → collect partials, form a QC at `2f + 1`
/// 3. **QC formed** → advance `bqc`, commit timer-expired ancestors
/// 4. **Commit timeout** → record the synchrony observation, retry commit
/// 5. **Blame quorum** → advance the view, emit status notifies
pub struct ConsensusCore {
    // ═══════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════
    id: ReplicaId,
    keypair: KeyPair,
    config: Arc<ReplicaConfig>,
    store: Arc<BlockStore>,

    // ═══════════════════════════════════════════════════════════════════
    // Chain State
    // ═══════════════════════════════════════════════════════════════════
    /// The genesis block, installed at construction.
    genesis: BlockRef,
    /// Block with the highest known quorum certificate.
    bqc: BlockRef,
    /// Last executed block.
    bexec: BlockRef,
    /// Height of the highest block voted for.
    vheight: Height,
    /// Height of the highest block a notify was emitted for.
    nheight: Height,
    /// Current view, advanced by the blame path.
    view: View,
    /// DAG leaves, ordered by height.
    tails: BTreeSet<(Height, Hash)>,
    /// Blocks this engine has taken through delivery bookkeeping.
    delivered: HashSet<Hash>,

    // ═══════════════════════════════════════════════════════════════════
    // Certification
    // ═══════════════════════════════════════════════════════════════════
    /// Pending vote sets, keyed by block hash.
    vote_sets: HashMap<Hash, PartialSet>,
    /// Quorum certificates observed per block (from votes, embedded
    /// certificates or notifies). The stored blocks stay immutable.
    certified: HashMap<Hash, QuorumCert>,
    /// Blocks whose 2Δ commit timer has fired.
    expired_timers: HashSet<Hash>,

    // ═══════════════════════════════════════════════════════════════════
    // Pending Verification (dedup against double-delegation)
    // ═══════════════════════════════════════════════════════════════════
    pending_proposals: HashSet<Hash>,
    pending_votes: HashSet<(Hash, ReplicaId)>,

    // ═══════════════════════════════════════════════════════════════════
    // View Change
    // ═══════════════════════════════════════════════════════════════════
    /// Blame aggregation and status-notify collection.
    view_change: ViewChangeState,

    // ═══════════════════════════════════════════════════════════════════
    // Coordination & Switches
    // ═══════════════════════════════════════════════════════════════════
    waiters: Waiters,
    /// Force the vote decision negative (some PaceMakers want negative
    /// quorum evidence).
    neg_vote: bool,
    stats: CoreStats,
}

impl ConsensusCore {
    /// Create the state machine with genesis installed.
    pub fn new(
        id: ReplicaId,
        keypair: KeyPair,
        config: Arc<ReplicaConfig>,
        store: Arc<BlockStore>,
    ) -> Self {
        let genesis = store
            .add_blk(Block::genesis())
            .expect("genesis always admits");

        let mut certified = HashMap::new();
        certified.insert(genesis.hash(), QuorumCert::genesis(&genesis.hash()));

        let mut tails = BTreeSet::new();
        tails.insert((0, genesis.hash()));

        let mut delivered = HashSet::new();
        delivered.insert(genesis.hash());

        info!(replica = %id, genesis = %genesis.hash().short(), "installed genesis");

        let view_change = ViewChangeState::new(config.clone());

        Self {
            id,
            keypair,
            config,
            store,
            bqc: genesis.clone(),
            bexec: genesis.clone(),
            genesis,
            vheight: 0,
            nheight: 0,
            view: 0,
            tails,
            delivered,
            vote_sets: HashMap::new(),
            certified,
            expired_timers: HashSet::new(),
            pending_proposals: HashSet::new(),
            pending_votes: HashSet::new(),
            view_change,
            waiters: Waiters::new(),
            neg_vote: false,
            stats: CoreStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn config(&self) -> &Arc<ReplicaConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn genesis(&self) -> &BlockRef {
        &self.genesis
    }

    /// Block with the highest known quorum certificate.
    pub fn bqc(&self) -> &BlockRef {
        &self.bqc
    }

    /// Last executed block.
    pub fn bexec(&self) -> &BlockRef {
        &self.bexec
    }

    pub fn vheight(&self) -> Height {
        self.vheight
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn stats(&self) -> CoreStats {
        self.stats
    }

    /// Current DAG leaves, lowest height first.
    pub fn tails(&self) -> Vec<BlockRef> {
        self.tails
            .iter()
            .filter_map(|(_, hash)| self.store.find_blk(hash))
            .collect()
    }

    /// The quorum certificate observed for a block, if any.
    pub fn certificate_for(&self, blk_hash: &Hash) -> Option<&QuorumCert> {
        self.certified.get(blk_hash)
    }

    /// Force the vote decision negative.
    pub fn set_neg_vote(&mut self, neg_vote: bool) {
        self.neg_vote = neg_vote;
    }

    // ═══════════════════════════════════════════════════════════════════
    // PaceMaker Coordination Surfaces
    // ═══════════════════════════════════════════════════════════════════

    /// Resolves when the block gains a quorum certificate. Resolves
    /// immediately if it already has one.
    pub fn async_qc_finish(&mut self, blk_hash: Hash) -> oneshot::Receiver<Hash> {
        if self.certified.contains_key(&blk_hash) {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(blk_hash);
            return rx;
        }
        self.waiters.subscribe_qc_finish(blk_hash)
    }

    /// Resolves on the next outbound proposal.
    pub fn async_wait_proposal(&mut self) -> oneshot::Receiver<Hash> {
        self.waiters.subscribe_propose()
    }

    /// Resolves on the next validated incoming proposal.
    pub fn async_wait_receive_proposal(&mut self) -> oneshot::Receiver<Hash> {
        self.waiters.subscribe_receive_proposal()
    }

    /// Resolves on any `bqc` advance.
    pub fn async_bqc_update(&mut self) -> oneshot::Receiver<Hash> {
        self.waiters.subscribe_bqc_update()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════

    /// Admit a block whose ancestors are already delivered.
    ///
    /// The caller (fetch layer) guarantees the primary parent and the
    /// certificate-referenced block are present; invalid blocks are
    /// dropped and the function returns false.
    pub fn on_deliver_blk(&mut self, block: Block) -> bool {
        let blk = match self.store.add_blk(block) {
            Ok(blk) => blk,
            Err(err) => {
                warn!(error = %err, "rejected block at delivery");
                self.stats.dropped_malformed += 1;
                return false;
            }
        };
        self.deliver_ref(&blk)
    }

    /// Delivery bookkeeping for an interned block. Idempotent.
    fn deliver_ref(&mut self, blk: &BlockRef) -> bool {
        if self.delivered.contains(&blk.hash()) {
            return true;
        }

        // The embedded certificate must attest the block it names.
        if let (Some(qc_ref), Some(qc)) = (blk.qc_ref(), blk.qc()) {
            if qc.proof_hash() != vote_proof_hash(qc_ref) {
                warn!(block = %blk.hash().short(), "embedded certificate names a different block");
                self.stats.dropped_malformed += 1;
                return false;
            }
        }

        self.delivered.insert(blk.hash());
        for parent in blk.parents() {
            if let Some(parent_blk) = self.store.find_blk(parent) {
                self.tails.remove(&(parent_blk.height(), *parent));
            }
        }
        self.tails.insert((blk.height(), blk.hash()));

        trace!(block = %blk.hash().short(), height = blk.height(), "delivered block");
        true
    }

    // ═══════════════════════════════════════════════════════════════════
    // Proposals
    // ═══════════════════════════════════════════════════════════════════

    /// Handle a proposal message. Cheap checks here; certificates go to
    /// the verification pool and the rest runs in
    /// [`on_proposal_verified`](Self::on_proposal_verified).
    #[instrument(skip(self, proposal), fields(
        replica = %self.id,
        proposer = %proposal.proposer,
        block = %proposal.blk.hash().short(),
        height = proposal.blk.height(),
    ))]
    pub fn on_receive_proposal(&mut self, proposal: Proposal) -> Vec<Action> {
        if !self.config.contains(proposal.proposer) {
            warn!("proposal from unknown replica");
            self.stats.dropped_malformed += 1;
            return vec![];
        }
        if !self.store.contains(&proposal.blk.hash()) {
            warn!("proposal for an undelivered block");
            self.stats.dropped_malformed += 1;
            return vec![];
        }
        if !self.pending_proposals.insert(proposal.blk.hash()) {
            trace!("proposal already pending verification");
            return vec![];
        }
        vec![Action::VerifyProposal { proposal }]
    }

    /// Continuation of [`on_receive_proposal`](Self::on_receive_proposal)
    /// once the pool reports a verdict.
    pub fn on_proposal_verified(&mut self, proposal: Proposal, valid: bool) -> Vec<Action> {
        self.pending_proposals.remove(&proposal.blk.hash());
        if !valid {
            warn!(
                proposer = %proposal.proposer,
                block = %proposal.blk.hash().short(),
                "proposal failed verification"
            );
            self.stats.dropped_invalid += 1;
            return vec![];
        }
        self.process_proposal(proposal)
    }

    /// Core proposal handling, shared by the network path (after
    /// verification) and the local propose path (our own proposals skip
    /// the pool).
    fn process_proposal(&mut self, proposal: Proposal) -> Vec<Action> {
        let blk = proposal.blk.clone();
        if !self.deliver_ref(&blk) {
            return vec![];
        }

        let mut actions = Vec::new();

        // Status notifies ride along with the first proposal of a view;
        // absorb any higher certificates they carry.
        if let Some(status) = &proposal.status_cert {
            for notify in status.clone() {
                actions.extend(self.absorb_notify(notify));
            }
        }

        // Adopt the certificate chain first so the vote rule sees the
        // freshest bqc.
        actions.extend(self.update(&blk));

        let extends_bqc = self.extends(&blk, &self.bqc.clone());
        let should_vote = blk.height() > self.vheight && extends_bqc && !self.neg_vote;

        if should_vote {
            self.vheight = blk.height();
            let vote = self.create_vote(blk.hash());

            debug!(
                replica = %self.id,
                block = %blk.hash().short(),
                height = blk.height(),
                "voting"
            );

            if proposal.proposer == self.id {
                // Our own proposal: run the vote through the normal path.
                actions.extend(self.on_receive_vote(vote));
            } else {
                actions.push(Action::Send {
                    to: proposal.proposer,
                    message: OutboundMessage::Vote(vote),
                });
            }

            // The 2Δ synchrony observation starts at the vote.
            actions.push(Action::SetCommitTimer {
                blk_hash: blk.hash(),
                height: blk.height(),
                duration: self.config.commit_timeout(),
            });
        } else {
            trace!(
                block = %blk.hash().short(),
                height = blk.height(),
                vheight = self.vheight,
                extends_bqc,
                neg_vote = self.neg_vote,
                "not voting"
            );
        }

        self.waiters.resolve_receive_proposal(blk.hash());
        actions
    }

    /// Sign a vote for a block.
    fn create_vote(&self, blk_hash: Hash) -> Vote {
        let cert = PartialCert::create(&self.keypair, self.id, vote_proof_hash(&blk_hash));
        Vote {
            voter: self.id,
            blk_hash,
            cert,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Certificate-Chain Advancement
    // ═══════════════════════════════════════════════════════════════════

    /// Adopt whatever certificate a block carries for its ancestor.
    fn update(&mut self, blk: &BlockRef) -> Vec<Action> {
        let (Some(qc_ref), Some(qc)) = (blk.qc_ref(), blk.qc()) else {
            return vec![];
        };
        self.observe_certificate(*qc_ref, qc.clone())
    }

    /// Record a quorum certificate over a block and run the chain rules:
    /// adopt as `bqc` if higher, then try to commit below it.
    pub(crate) fn observe_certificate(&mut self, blk_hash: Hash, qc: QuorumCert) -> Vec<Action> {
        let first_seen = !self.certified.contains_key(&blk_hash);
        if first_seen {
            self.certified.insert(blk_hash, qc);
            self.waiters.resolve_qc_finish(blk_hash);
        }

        let Some(blk) = self.store.find_blk(&blk_hash) else {
            // Certificate for a block we have not fetched yet; keep it
            // for when the block arrives.
            return vec![];
        };

        let mut actions = Vec::new();
        if blk.height() > self.bqc.height() {
            debug!(
                replica = %self.id,
                old = self.bqc.height(),
                new = blk.height(),
                block = %blk.hash().short(),
                "bqc advanced"
            );
            self.bqc = blk.clone();
            actions.extend(self.on_bqc_update());
        }
        actions.extend(self.check_commit(&blk));
        actions
    }

    /// Fired on every `bqc` advance: resolve waiters and send the
    /// opportunistic notify.
    fn on_bqc_update(&mut self) -> Vec<Action> {
        let bqc_hash = self.bqc.hash();
        self.waiters.resolve_bqc_update(bqc_hash);

        let mut actions = Vec::new();
        if self.nheight < self.bqc.height() {
            if let Some(qc) = self.certified.get(&bqc_hash) {
                self.nheight = self.bqc.height();
                actions.push(Action::Broadcast {
                    message: OutboundMessage::Notify(kestrel_messages::Notify {
                        blk_hash: bqc_hash,
                        qc: qc.clone(),
                    }),
                });
            }
        }
        actions
    }

    /// Walk `b` up primary-parent links; true iff the walk reaches
    /// `anchor` without descending below it.
    fn extends(&self, blk: &BlockRef, anchor: &BlockRef) -> bool {
        let mut cur = blk.clone();
        while cur.height() > anchor.height() {
            let Some(parent) = cur
                .primary_parent()
                .and_then(|hash| self.store.find_blk(hash))
            else {
                return false;
            };
            cur = parent;
        }
        cur.hash() == anchor.hash()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commit Rule
    // ═══════════════════════════════════════════════════════════════════

    /// Commit the longest timer-expired prefix of the chain between
    /// `bexec` and `from`.
    ///
    /// A block executes only when its 2Δ timer has fired *and* it still
    /// sits on the chain of `bqc`. The walk stops at the first unexpired
    /// block: `bexec` never skips an ancestor.
    fn check_commit(&mut self, from: &BlockRef) -> Vec<Action> {
        let mut chain = Vec::new();
        let mut cur = from.clone();
        while cur.height() > self.bexec.height() {
            chain.push(cur.clone());
            let Some(parent) = cur
                .primary_parent()
                .and_then(|hash| self.store.find_blk(hash))
            else {
                return vec![];
            };
            cur = parent;
        }
        if cur.hash() != self.bexec.hash() {
            // A certified fork that does not extend the executed chain:
            // nothing here may commit.
            warn!(
                from = %from.hash().short(),
                bexec = %self.bexec.hash().short(),
                "certified block does not extend the executed chain"
            );
            return vec![];
        }

        let bqc = self.bqc.clone();
        let mut actions = Vec::new();
        for c in chain.iter().rev() {
            if !self.expired_timers.contains(&c.hash()) {
                break;
            }
            if !self.extends(&bqc, c) {
                break;
            }

            info!(
                replica = %self.id,
                block = %c.hash().short(),
                height = c.height(),
                cmds = c.cmds().len(),
                "committing block"
            );

            for (idx, cmd) in c.cmds().iter().enumerate() {
                actions.push(Action::Decide {
                    finality: Finality::committed(
                        self.id,
                        idx as u32,
                        c.height(),
                        *cmd,
                        c.hash(),
                    ),
                });
            }
            actions.push(Action::StopCommitTimers { height: c.height() });
            self.bexec = c.clone();
        }
        actions
    }

    /// The 2Δ commit timer for a block expired without a conflicting
    /// blame quorum: the synchrony observation holds.
    #[instrument(skip(self), fields(replica = %self.id, block = %blk_hash.short()))]
    pub fn on_commit_timeout(&mut self, blk_hash: Hash) -> Vec<Action> {
        let Some(blk) = self.store.find_blk(&blk_hash) else {
            trace!("commit timeout for unknown block");
            return vec![];
        };
        if blk.height() <= self.bexec.height() {
            trace!("commit timeout for an already-settled height");
            return vec![];
        }
        self.expired_timers.insert(blk_hash);
        let bqc = self.bqc.clone();
        self.check_commit(&bqc)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Vote Aggregation
    // ═══════════════════════════════════════════════════════════════════

    /// Handle a vote message. Signature checks go to the pool; the rest
    /// runs in [`on_vote_verified`](Self::on_vote_verified).
    #[instrument(skip(self, vote), fields(
        replica = %self.id,
        voter = %vote.voter,
        block = %vote.blk_hash.short(),
    ))]
    pub fn on_receive_vote(&mut self, vote: Vote) -> Vec<Action> {
        if !self.config.contains(vote.voter) {
            warn!("vote from unknown replica");
            self.stats.dropped_malformed += 1;
            return vec![];
        }
        if self.certified.contains_key(&vote.blk_hash) {
            // The block already has its certificate; late votes are noise.
            trace!("vote for an already-certified block");
            return vec![];
        }
        if self
            .vote_sets
            .get(&vote.blk_hash)
            .is_some_and(|set| set.contains(vote.voter))
        {
            trace!("duplicate vote");
            return vec![];
        }
        if !self.pending_votes.insert((vote.blk_hash, vote.voter)) {
            trace!("vote already pending verification");
            return vec![];
        }
        vec![Action::VerifyVote { vote }]
    }

    /// Continuation of [`on_receive_vote`](Self::on_receive_vote).
    pub fn on_vote_verified(&mut self, vote: Vote, valid: bool) -> Vec<Action> {
        self.pending_votes.remove(&(vote.blk_hash, vote.voter));
        if !valid {
            warn!(voter = %vote.voter, block = %vote.blk_hash.short(), "vote failed verification");
            self.stats.dropped_invalid += 1;
            return vec![];
        }
        if self.certified.contains_key(&vote.blk_hash) {
            trace!("vote verified after certification, discarding");
            return vec![];
        }

        let set = self
            .vote_sets
            .entry(vote.blk_hash)
            .or_insert_with(|| PartialSet::new(vote_proof_hash(&vote.blk_hash)));
        if !set.add(vote.cert.clone()) {
            return vec![];
        }

        debug!(
            replica = %self.id,
            block = %vote.blk_hash.short(),
            votes = set.count(),
            needed = self.config.quorum_size(),
            "vote added"
        );

        if set.has_quorum(&self.config) {
            match set.build_qc(&self.config) {
                Ok(qc) => {
                    info!(
                        replica = %self.id,
                        block = %vote.blk_hash.short(),
                        "quorum reached, certificate formed"
                    );
                    return vec![Action::EnqueueInternal {
                        event: Event::QuorumCertificateFormed {
                            blk_hash: vote.blk_hash,
                            qc,
                        },
                    }];
                }
                Err(err) => warn!(error = %err, "failed to build certificate"),
            }
        }
        vec![]
    }

    /// A quorum certificate finished forming from votes.
    pub fn on_qc_formed(&mut self, blk_hash: Hash, qc: QuorumCert) -> Vec<Action> {
        self.vote_sets.remove(&blk_hash);
        self.observe_certificate(blk_hash, qc)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════

    /// Build, admit and broadcast a new block.
    ///
    /// `parents` must be non-empty and delivered; the first entry is the
    /// primary parent and must hold a known quorum certificate (the
    /// PaceMaker proposes on the certified frontier).
    #[instrument(skip_all, fields(replica = %self.id, cmds = cmds.len()))]
    pub fn on_propose(
        &mut self,
        cmds: Vec<Hash>,
        parents: &[BlockRef],
        extra: Vec<u8>,
    ) -> Vec<Action> {
        let Some(primary) = parents.first() else {
            debug_assert!(false, "on_propose requires parents");
            return vec![];
        };
        debug_assert!(
            parents.iter().all(|p| self.store.contains(&p.hash())),
            "on_propose requires delivered parents"
        );
        let Some(cert_pblk) = self.certified.get(&primary.hash()).cloned() else {
            warn!(parent = %primary.hash().short(), "cannot propose on an uncertified parent");
            return vec![];
        };
        let bqc_qc = self
            .certified
            .get(&self.bqc.hash())
            .cloned()
            .expect("bqc is always certified");

        let parent_hashes: Vec<Hash> = parents.iter().map(|p| p.hash()).collect();
        let block = match Block::from_parts(
            parent_hashes,
            cmds,
            Some((self.bqc.hash(), bqc_qc)),
            extra,
            primary.height() + 1,
        ) {
            Ok(block) => block,
            Err(err) => {
                warn!(error = %err, "failed to build block");
                return vec![];
            }
        };
        let blk = match self.store.add_blk(block) {
            Ok(blk) => blk,
            Err(err) => {
                warn!(error = %err, "failed to admit own block");
                return vec![];
            }
        };

        info!(
            replica = %self.id,
            block = %blk.hash().short(),
            height = blk.height(),
            "proposing block"
        );

        let status_cert = self.take_status_cert();
        let proposal = Proposal {
            proposer: self.id,
            blk: blk.clone(),
            cert_pblk,
            status_cert,
        };

        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Proposal(proposal.clone()),
        }];
        // Treat our own proposal as locally received; it skips the pool.
        actions.extend(self.process_proposal(proposal));
        self.waiters.resolve_propose(blk.hash());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // View Change: Blames
    // ═══════════════════════════════════════════════════════════════════

    /// The PaceMaker gave up on the current view's leader: sign and
    /// broadcast a blame. Safe to call repeatedly; the blame is only
    /// counted locally once per view.
    #[instrument(skip(self), fields(replica = %self.id, view = self.view))]
    pub fn on_view_timeout(&mut self) -> Vec<Action> {
        let blame = self.view_change.make_blame(self.id, &self.keypair, self.view);

        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Blame(blame.clone()),
        }];
        if self.view_change.record_own_blame(self.view) {
            info!(replica = %self.id, view = self.view, "blaming current view");
            // Count our own blame through the normal path.
            actions.extend(self.on_receive_blame(blame));
        }
        actions
    }

    /// Handle a blame message. Signature checks go to the pool; counting
    /// happens in [`on_blame_verified`](Self::on_blame_verified).
    pub fn on_receive_blame(&mut self, blame: kestrel_messages::Blame) -> Vec<Action> {
        if !self.view_change.should_verify_blame(&blame, self.view) {
            self.stats.dropped_stale += 1;
            return vec![];
        }
        vec![Action::VerifyBlame { blame }]
    }

    /// Continuation of [`on_receive_blame`](Self::on_receive_blame).
    pub fn on_blame_verified(&mut self, blame: kestrel_messages::Blame, valid: bool) -> Vec<Action> {
        if !valid {
            warn!(blamer = %blame.blamer, view = blame.view, "blame failed verification");
            self.stats.dropped_invalid += 1;
            return vec![];
        }
        if blame.view < self.view {
            // The view moved on while the signature was being checked.
            self.stats.dropped_stale += 1;
            return vec![];
        }
        let Some(blame_notify) = self.view_change.add_blame(blame) else {
            return vec![];
        };

        info!(
            replica = %self.id,
            view = blame_notify.view,
            "blame quorum complete, broadcasting"
        );
        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::BlameNotify(blame_notify.clone()),
        }];
        // We aggregated it ourselves; it needs no second verification.
        actions.extend(self.apply_blame_notify(blame_notify));
        actions
    }

    /// Handle a blame-quorum message.
    pub fn on_receive_blamenotify(&mut self, blame_notify: kestrel_messages::BlameNotify) -> Vec<Action> {
        if blame_notify.view < self.view {
            trace!(view = blame_notify.view, current = self.view, "stale blame quorum");
            self.stats.dropped_stale += 1;
            return vec![];
        }
        vec![Action::VerifyBlameNotify { blame_notify }]
    }

    /// Continuation of [`on_receive_blamenotify`](Self::on_receive_blamenotify).
    pub fn on_blamenotify_verified(
        &mut self,
        blame_notify: kestrel_messages::BlameNotify,
        valid: bool,
    ) -> Vec<Action> {
        if !valid {
            warn!(view = blame_notify.view, "blame quorum failed verification");
            self.stats.dropped_invalid += 1;
            return vec![];
        }
        self.apply_blame_notify(blame_notify)
    }

    /// A valid blame quorum for `bn.view`: advance the view, void the
    /// pending synchrony observations, and report our highest certificate
    /// to the next leader.
    fn apply_blame_notify(&mut self, blame_notify: kestrel_messages::BlameNotify) -> Vec<Action> {
        if blame_notify.view < self.view {
            return vec![];
        }

        let old_view = self.view;
        self.view = blame_notify.view + 1;
        self.view_change.cleanup(blame_notify.view);

        info!(
            replica = %self.id,
            old_view,
            new_view = self.view,
            "view advanced by blame quorum"
        );

        // The blame quorum is exactly the conflicting evidence the 2Δ
        // timers were waiting out: nothing still pending may commit in
        // the failed view.
        let bexec_height = self.bexec.height();
        let store = &self.store;
        self.expired_timers.retain(|hash| {
            store
                .find_blk(hash)
                .is_some_and(|blk| blk.height() <= bexec_height)
        });
        let mut actions = vec![Action::StopCommitTimers { height: Height::MAX }];

        // Report our highest certificate; the next leader bundles these
        // as the status certificate of its first proposal.
        self.view_change.start_status_collection();
        if let Some(qc) = self.certified.get(&self.bqc.hash()) {
            let notify = kestrel_messages::Notify {
                blk_hash: self.bqc.hash(),
                qc: qc.clone(),
            };
            self.nheight = self.nheight.max(self.bqc.height());
            self.view_change.collect_notify(notify.clone());
            actions.push(Action::Broadcast {
                message: OutboundMessage::Notify(notify),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // View Change: Status Notifies
    // ═══════════════════════════════════════════════════════════════════

    /// Handle a notify message. The certificate goes to the pool;
    /// absorption happens in [`on_notify_verified`](Self::on_notify_verified).
    pub fn on_receive_notify(&mut self, notify: kestrel_messages::Notify) -> Vec<Action> {
        vec![Action::VerifyNotify { notify }]
    }

    /// Continuation of [`on_receive_notify`](Self::on_receive_notify).
    pub fn on_notify_verified(&mut self, notify: kestrel_messages::Notify, valid: bool) -> Vec<Action> {
        if !valid {
            warn!(block = %notify.blk_hash.short(), "notify failed verification");
            self.stats.dropped_invalid += 1;
            return vec![];
        }
        self.view_change.collect_notify(notify.clone());
        self.absorb_notify(notify)
    }

    /// Adopt whatever a notify's certificate proves.
    fn absorb_notify(&mut self, notify: kestrel_messages::Notify) -> Vec<Action> {
        self.observe_certificate(notify.blk_hash, notify.qc)
    }

    /// Hand out the collected status notifies exactly once.
    fn take_status_cert(&mut self) -> Option<Vec<kestrel_messages::Notify>> {
        self.view_change.take_status_cert()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Pruning
    // ═══════════════════════════════════════════════════════════════════

    /// Drop blocks more than `staleness` below the commit frontier.
    pub fn prune(&mut self, staleness: Height) -> usize {
        let below = self.bexec.height().saturating_sub(staleness);
        let removed = self.store.prune(below);
        if removed > 0 {
            let store = &self.store;
            let delivered = &self.delivered;
            // Certificates and vote sets may be keyed by blocks we have
            // not fetched yet; only forget entries whose block was
            // actually pruned.
            self.certified
                .retain(|hash, _| store.contains(hash) || !delivered.contains(hash));
            self.vote_sets
                .retain(|hash, _| store.contains(hash) || !delivered.contains(hash));
            self.delivered.retain(|hash| store.contains(hash));
            self.expired_timers.retain(|hash| store.contains(hash));
            self.tails.retain(|(height, _)| *height >= below);
            info!(replica = %self.id, below, removed, "pruned history");
        }
        removed
    }
}

impl StateMachine for ConsensusCore {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::ProposalReceived { proposal } => self.on_receive_proposal(proposal),
            Event::VoteReceived { vote } => self.on_receive_vote(vote),
            Event::NotifyReceived { notify } => self.on_receive_notify(notify),
            Event::BlameReceived { blame } => self.on_receive_blame(blame),
            Event::BlameNotifyReceived { blame_notify } => {
                self.on_receive_blamenotify(blame_notify)
            }
            Event::CommitTimeout { blk_hash } => self.on_commit_timeout(blk_hash),
            Event::ViewTimeout => self.on_view_timeout(),
            Event::ProposalVerified { proposal, valid } => {
                self.on_proposal_verified(proposal, valid)
            }
            Event::VoteVerified { vote, valid } => self.on_vote_verified(vote, valid),
            Event::NotifyVerified { notify, valid } => self.on_notify_verified(notify, valid),
            Event::BlameVerified { blame, valid } => self.on_blame_verified(blame, valid),
            Event::BlameNotifyVerified { blame_notify, valid } => {
                self.on_blamenotify_verified(blame_notify, valid)
            }
            Event::QuorumCertificateFormed { blk_hash, qc } => self.on_qc_formed(blk_hash, qc),
        }
    }
}

impl std::fmt::Display for ConsensusCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<replica {} view={} bqc={}@{} bexec={}@{} vheight={} nheight={} tails={}>",
            self.id,
            self.view,
            self.bqc.hash().short(),
            self.bqc.height(),
            self.bexec.hash().short(),
            self.bexec.height(),
            self.vheight,
            self.nheight,
            self.tails.len(),
        )
    }
}

impl std::fmt::Debug for ConsensusCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusCore")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("bqc_height", &self.bqc.height())
            .field("bexec_height", &self.bexec.height())
            .field("vheight", &self.vheight)
            .field("tails", &self.tails.len())
            .field("vote_sets", &self.vote_sets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::KeyType;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn make_env() -> (Vec<KeyPair>, Arc<ReplicaConfig>) {
        let keys: Vec<KeyPair> = (0..4u16)
            .map(|i| KeyPair::from_seed(KeyType::Ed25519, &[i as u8 + 1; 32]))
            .collect();
        let mut config = ReplicaConfig::new(1, Duration::from_millis(100));
        for (i, key) in keys.iter().enumerate() {
            config
                .add_replica(
                    ReplicaId(i as u16),
                    format!("127.0.0.1:{}", 9400 + i).parse().unwrap(),
                    key.public_key(),
                )
                .unwrap();
        }
        (keys, Arc::new(config))
    }

    fn make_core(id: u16, keys: &[KeyPair], config: &Arc<ReplicaConfig>) -> ConsensusCore {
        ConsensusCore::new(
            ReplicaId(id),
            keys[id as usize].clone(),
            config.clone(),
            Arc::new(BlockStore::new()),
        )
    }

    /// Build a proposal for a child of `parent`, certified by `parent_qc`.
    fn make_proposal(
        core: &ConsensusCore,
        proposer: u16,
        parent: &BlockRef,
        parent_qc: QuorumCert,
        tag: u8,
    ) -> Proposal {
        let blk = core
            .store()
            .intern(
                vec![parent.hash()],
                vec![Hash::digest(&[tag])],
                Some((parent.hash(), parent_qc.clone())),
                vec![],
            )
            .unwrap();
        Proposal {
            proposer: ReplicaId(proposer),
            blk,
            cert_pblk: parent_qc,
            status_cert: None,
        }
    }

    fn make_qc_over(blk_hash: &Hash, keys: &[KeyPair], config: &ReplicaConfig) -> QuorumCert {
        let proof = vote_proof_hash(blk_hash);
        let partials: Vec<PartialCert> = keys
            .iter()
            .enumerate()
            .take(config.quorum_size())
            .map(|(i, key)| PartialCert::create(key, ReplicaId(i as u16), proof))
            .collect();
        QuorumCert::aggregate(proof, &partials, config).unwrap()
    }

    fn has_vote_to(actions: &[Action], to: ReplicaId) -> bool {
        actions.iter().any(|a| {
            matches!(a, Action::Send { to: t, message: OutboundMessage::Vote(_) } if *t == to)
        })
    }

    #[traced_test]
    #[test]
    fn test_genesis_state() {
        let (keys, config) = make_env();
        let core = make_core(0, &keys, &config);

        assert_eq!(core.bqc().hash(), core.genesis().hash());
        assert_eq!(core.bexec().hash(), core.genesis().hash());
        assert_eq!(core.vheight(), 0);
        assert_eq!(core.view(), 0);
        assert_eq!(core.tails().len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_votes_for_valid_proposal_and_arms_timer() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        let genesis = core.genesis().clone();

        let proposal = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let actions = core.on_proposal_verified(proposal.clone(), true);

        assert!(has_vote_to(&actions, ReplicaId(0)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetCommitTimer { height: 1, .. })));
        assert_eq!(core.vheight(), 1);
    }

    #[traced_test]
    #[test]
    fn test_stale_proposal_not_voted() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        let genesis = core.genesis().clone();

        let first = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        core.on_proposal_verified(first, true);
        assert_eq!(core.vheight(), 1);

        // A second proposal at the same height arrives; the waiter still
        // resolves but no vote is issued and vheight is untouched.
        let mut rx = core.async_wait_receive_proposal();
        let second = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 2);
        let actions = core.on_proposal_verified(second, true);

        assert!(!has_vote_to(&actions, ReplicaId(0)));
        assert_eq!(core.vheight(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[traced_test]
    #[test]
    fn test_neg_vote_suppresses_vote() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        core.set_neg_vote(true);
        let genesis = core.genesis().clone();

        let proposal = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let actions = core.on_proposal_verified(proposal, true);

        assert!(!has_vote_to(&actions, ReplicaId(0)));
        assert_eq!(core.vheight(), 0);
    }

    #[traced_test]
    #[test]
    fn test_non_extending_proposal_not_voted() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        let genesis = core.genesis().clone();

        // Grow a certified chain to height 1 so bqc moves off genesis.
        let p1 = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let b1 = p1.blk.clone();
        core.on_proposal_verified(p1, true);
        let qc_b1 = make_qc_over(&b1.hash(), &keys, &config);
        core.on_qc_formed(b1.hash(), qc_b1);
        assert_eq!(core.bqc().height(), 1);

        // A fork off genesis at height 1 cannot extend bqc; height 2 via
        // the fork keeps failing the extension walk.
        let fork = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 9);
        let fork_blk = fork.blk.clone();
        core.on_proposal_verified(fork, true);
        assert_eq!(core.vheight(), 1); // no new vote

        let fork_qc = make_qc_over(&fork_blk.hash(), &keys, &config);
        let p2 = make_proposal(&core, 0, &fork_blk, fork_qc, 10);
        let actions = core.on_proposal_verified(p2, true);
        assert!(!has_vote_to(&actions, ReplicaId(0)));
    }

    #[traced_test]
    #[test]
    fn test_vote_aggregation_forms_qc() {
        let (keys, config) = make_env();
        let mut core = make_core(0, &keys, &config);
        let genesis = core.genesis().clone();

        let proposal = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let blk_hash = proposal.blk.hash();
        core.process_proposal(proposal);

        let mut formed = Vec::new();
        for i in 0..3u16 {
            let vote = Vote {
                voter: ReplicaId(i),
                blk_hash,
                cert: PartialCert::create(
                    &keys[i as usize],
                    ReplicaId(i),
                    vote_proof_hash(&blk_hash),
                ),
            };
            let actions = core.on_vote_verified(vote, true);
            formed.extend(actions);
        }

        let qc = formed.iter().find_map(|a| match a {
            Action::EnqueueInternal {
                event: Event::QuorumCertificateFormed { blk_hash: h, qc },
            } if *h == blk_hash => Some(qc.clone()),
            _ => None,
        });
        let qc = qc.expect("quorum certificate should form at 2f+1 votes");
        assert!(qc.verify(&config));
    }

    #[traced_test]
    #[test]
    fn test_vote_after_certification_discarded() {
        let (keys, config) = make_env();
        let mut core = make_core(0, &keys, &config);
        let genesis = core.genesis().clone();

        let proposal = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let blk_hash = proposal.blk.hash();
        core.process_proposal(proposal);
        core.on_qc_formed(blk_hash, make_qc_over(&blk_hash, &keys, &config));

        let vote = Vote {
            voter: ReplicaId(3),
            blk_hash,
            cert: PartialCert::create(&keys[3], ReplicaId(3), vote_proof_hash(&blk_hash)),
        };
        assert!(core.on_receive_vote(vote).is_empty());
    }

    #[traced_test]
    #[test]
    fn test_commit_requires_expired_timer() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        let genesis = core.genesis().clone();

        let p1 = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let b1 = p1.blk.clone();
        core.on_proposal_verified(p1, true);

        // Certificate forms but the 2Δ timer has not fired: no decision.
        let actions = core.on_qc_formed(b1.hash(), make_qc_over(&b1.hash(), &keys, &config));
        assert!(!actions.iter().any(|a| matches!(a, Action::Decide { .. })));
        assert_eq!(core.bexec().height(), 0);

        // Timer fires: the block commits and its timers stop.
        let actions = core.on_commit_timeout(b1.hash());
        let decisions: Vec<&Finality> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Decide { finality } => Some(finality),
                _ => None,
            })
            .collect();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].cmd_height, 1);
        assert_eq!(decisions[0].blk_hash, Some(b1.hash()));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StopCommitTimers { height: 1 })));
        assert_eq!(core.bexec().hash(), b1.hash());
    }

    #[traced_test]
    #[test]
    fn test_bqc_update_resolves_waiters_and_notifies() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);
        let genesis = core.genesis().clone();

        let p1 = make_proposal(&core, 0, &genesis, QuorumCert::genesis(&genesis.hash()), 1);
        let b1 = p1.blk.clone();
        core.on_proposal_verified(p1, true);

        let mut qc_rx = core.async_qc_finish(b1.hash());
        let mut bqc_rx = core.async_bqc_update();

        // b2 carries the certificate for b1; receiving it advances bqc.
        let qc_b1 = make_qc_over(&b1.hash(), &keys, &config);
        let p2 = make_proposal(&core, 0, &b1, qc_b1, 2);
        let actions = core.on_proposal_verified(p2, true);

        assert_eq!(core.bqc().hash(), b1.hash());
        assert_eq!(qc_rx.try_recv().unwrap(), b1.hash());
        assert_eq!(bqc_rx.try_recv().unwrap(), b1.hash());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::Notify(_) })));
    }

    #[traced_test]
    #[test]
    fn test_propose_broadcasts_and_self_votes() {
        let (keys, config) = make_env();
        let mut core = make_core(0, &keys, &config);
        let genesis = core.genesis().clone();

        let mut rx = core.async_wait_proposal();
        let actions = core.on_propose(vec![Hash::digest(b"cmd")], &[genesis], vec![]);

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::Proposal(_) })));
        // Own vote goes through the verification path.
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::VerifyVote { vote } if vote.voter == ReplicaId(0))));
        assert!(rx.try_recv().is_ok());
        assert_eq!(core.vheight(), 1);
    }

    #[traced_test]
    #[test]
    fn test_deliver_rejects_mismatched_certificate() {
        let (keys, config) = make_env();
        let mut core = make_core(0, &keys, &config);
        let genesis = core.genesis().clone();

        // Embedded certificate names a block other than the one the
        // justify field claims.
        let other = core
            .store()
            .intern(vec![genesis.hash()], vec![], None, vec![])
            .unwrap();
        let block = Block::from_parts(
            vec![genesis.hash()],
            vec![],
            Some((other.hash(), QuorumCert::genesis(&genesis.hash()))),
            vec![],
            1,
        )
        .unwrap();

        assert!(!core.on_deliver_blk(block));
        assert_eq!(core.stats().dropped_malformed, 1);
    }

    #[traced_test]
    #[test]
    fn test_prune_drops_history_and_keeps_frontier() {
        let (keys, config) = make_env();
        let mut core = make_core(1, &keys, &config);

        // Drive a chain out to height 6, committing as we go.
        let mut parent = core.genesis().clone();
        let mut parent_qc = QuorumCert::genesis(&parent.hash());
        let mut hashes = vec![parent.hash()];
        for tag in 1..=6u8 {
            let p = make_proposal(&core, 0, &parent, parent_qc.clone(), tag);
            let blk = p.blk.clone();
            core.on_proposal_verified(p, true);
            core.on_commit_timeout(blk.hash());
            parent_qc = make_qc_over(&blk.hash(), &keys, &config);
            core.on_qc_formed(blk.hash(), parent_qc.clone());
            hashes.push(blk.hash());
            parent = blk;
        }
        assert_eq!(core.bexec().height(), 6);

        let removed = core.prune(2);
        assert_eq!(removed, 4); // heights 0..=3

        for (height, hash) in hashes.iter().enumerate() {
            assert_eq!(
                core.store().contains(hash),
                height >= 4,
                "height {}",
                height
            );
        }
    }
}
