//! End-to-end protocol scenarios over a deterministic in-process network.
//!
//! Four replicas (f = 1, quorum of 3) run real engines against a
//! synchronous harness: outbound messages are encoded to wire frames and
//! re-decoded in each receiver's own store, verification actions execute
//! inline, and commit timers fire only when a test says time passed.
//! Every step re-checks the monotonicity invariants of the core.

use kestrel_bft::ConsensusCore;
use kestrel_core::{Action, Event, OutboundMessage, StateMachine};
use kestrel_messages::{
    decode_frame, encode_frame, DecodeContext, Finality, Proposal, ProtocolMessage,
};
use kestrel_types::{
    BlockRef, BlockStore, Hash, Height, KeyPair, KeyType, QuorumCert, ReplicaConfig, ReplicaId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// An encoded message in flight.
struct Envelope {
    from: usize,
    /// `None` broadcasts to everyone but the sender.
    to: Option<usize>,
    frame: Vec<u8>,
}

struct Harness {
    config: Arc<ReplicaConfig>,
    cores: Vec<ConsensusCore>,
    outbox: VecDeque<Envelope>,
    /// Armed commit timers per replica: block hash → height.
    timers: Vec<HashMap<Hash, Height>>,
    decisions: Vec<Vec<Finality>>,
    /// Previous (vheight, bqc height, bexec height, view) per replica,
    /// for monotonicity checks.
    watermarks: Vec<(u32, u32, u32, u32)>,
    /// Swallow opportunistic notifies, for tests that need certificates
    /// to travel only inside blocks.
    drop_notifies: bool,
}

impl Harness {
    fn new(n: u16, nfaulty: usize) -> Self {
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::from_seed(KeyType::Ed25519, &[i as u8 + 1; 32]))
            .collect();
        let mut config = ReplicaConfig::new(nfaulty, Duration::from_millis(100));
        for (i, key) in keys.iter().enumerate() {
            config
                .add_replica(
                    ReplicaId(i as u16),
                    format!("127.0.0.1:{}", 9800 + i).parse().unwrap(),
                    key.public_key(),
                )
                .unwrap();
        }
        let config = Arc::new(config);

        let cores: Vec<ConsensusCore> = (0..n)
            .map(|i| {
                ConsensusCore::new(
                    ReplicaId(i),
                    keys[i as usize].clone(),
                    config.clone(),
                    Arc::new(BlockStore::new()),
                )
            })
            .collect();

        Self {
            config,
            cores,
            outbox: VecDeque::new(),
            timers: vec![HashMap::new(); n as usize],
            decisions: vec![Vec::new(); n as usize],
            watermarks: vec![(0, 0, 0, 0); n as usize],
            drop_notifies: false,
        }
    }

    fn genesis(&self) -> BlockRef {
        self.cores[0].genesis().clone()
    }

    /// Apply one event to a replica, executing every resulting action
    /// (verification inline, messages into the outbox).
    fn apply(&mut self, idx: usize, event: Event) {
        let actions = self.cores[idx].handle(event);
        self.run_actions(idx, actions);
        self.check_invariants(idx);
    }

    fn run_actions(&mut self, idx: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    self.outbox.push_back(Envelope {
                        from: idx,
                        to: None,
                        frame: encode_frame(&message.into_protocol()),
                    });
                }
                Action::Send { to, message } => {
                    self.outbox.push_back(Envelope {
                        from: idx,
                        to: Some(to.0 as usize),
                        frame: encode_frame(&message.into_protocol()),
                    });
                }
                Action::Decide { finality } => self.decisions[idx].push(finality),
                Action::SetCommitTimer {
                    blk_hash, height, ..
                } => {
                    self.timers[idx].insert(blk_hash, height);
                }
                Action::StopCommitTimers { height } => {
                    self.timers[idx].retain(|_, h| *h > height);
                }
                Action::EnqueueInternal { event } => self.apply(idx, event),
                delegated => {
                    let event = self.verify(delegated);
                    self.apply(idx, event);
                }
            }
        }
    }

    /// Inline stand-in for the verification pool.
    fn verify(&self, action: Action) -> Event {
        match action {
            Action::VerifyProposal { proposal } => {
                let valid = proposal.verify(&self.config);
                Event::ProposalVerified { proposal, valid }
            }
            Action::VerifyVote { vote } => {
                let valid = vote.verify(&self.config);
                Event::VoteVerified { vote, valid }
            }
            Action::VerifyNotify { notify } => {
                let valid = notify.verify(&self.config);
                Event::NotifyVerified { notify, valid }
            }
            Action::VerifyBlame { blame } => {
                let valid = blame.verify(&self.config);
                Event::BlameVerified { blame, valid }
            }
            Action::VerifyBlameNotify { blame_notify } => {
                let valid = blame_notify.verify(&self.config);
                Event::BlameNotifyVerified { blame_notify, valid }
            }
            other => panic!("unexpected action {}", other.type_name()),
        }
    }

    /// Drain the network, decoding each frame in the receiver's own
    /// store, exactly as a transport would.
    fn deliver_all(&mut self) {
        while let Some(envelope) = self.outbox.pop_front() {
            let dests: Vec<usize> = match envelope.to {
                Some(to) => vec![to],
                None => (0..self.cores.len()).filter(|&i| i != envelope.from).collect(),
            };
            for dest in dests {
                let store = self.cores[dest].store().clone();
                let ctx = DecodeContext {
                    store: &store,
                    config: &self.config,
                };
                let message = decode_frame(&envelope.frame, &ctx)
                    .unwrap_or_else(|e| panic!("replica {} failed to decode: {}", dest, e));
                if self.drop_notifies && matches!(message, ProtocolMessage::Notify(_)) {
                    continue;
                }
                if let Some(event) = inbound_event(message) {
                    self.apply(dest, event);
                }
            }
        }
    }

    fn propose(&mut self, idx: usize, cmds: Vec<Hash>, parents: &[BlockRef]) -> Hash {
        let actions = self.cores[idx].on_propose(cmds, parents, vec![]);
        // The proposal broadcast is always the first action.
        let proposed = self.cores[idx].tails().last().unwrap().hash();
        self.run_actions(idx, actions);
        self.check_invariants(idx);
        proposed
    }

    /// Simulate 2Δ elapsing for one block at one replica.
    fn fire_commit_timer(&mut self, idx: usize, blk_hash: Hash) {
        if self.timers[idx].remove(&blk_hash).is_some() {
            self.apply(idx, Event::CommitTimeout { blk_hash });
        }
    }

    fn fire_commit_timer_everywhere(&mut self, blk_hash: Hash) {
        for idx in 0..self.cores.len() {
            self.fire_commit_timer(idx, blk_hash);
        }
    }

    fn check_invariants(&mut self, idx: usize) {
        let core = &self.cores[idx];
        let (vheight, bqc, bexec, view) = self.watermarks[idx];
        assert!(core.vheight() >= vheight, "vheight regressed at {}", idx);
        assert!(core.bqc().height() >= bqc, "bqc height regressed at {}", idx);
        assert!(
            core.bexec().height() >= bexec,
            "bexec height regressed at {}",
            idx
        );
        assert!(core.view() >= view, "view regressed at {}", idx);
        assert!(
            core.bexec().height() <= core.bqc().height(),
            "bexec above bqc at {}",
            idx
        );
        self.watermarks[idx] = (
            core.vheight(),
            core.bqc().height(),
            core.bexec().height(),
            core.view(),
        );
    }

    /// Craft a proposal frame without going through a replica's propose
    /// path — the tool of Byzantine-leader tests.
    fn craft_proposal_frame(
        &self,
        proposer: usize,
        parent: &BlockRef,
        parent_qc: QuorumCert,
        cmds: Vec<Hash>,
    ) -> Vec<u8> {
        let store = self.cores[proposer].store();
        let blk = store
            .intern(
                vec![parent.hash()],
                cmds,
                Some((parent.hash(), parent_qc.clone())),
                vec![],
            )
            .unwrap();
        let proposal = Proposal {
            proposer: ReplicaId(proposer as u16),
            blk,
            cert_pblk: parent_qc,
            status_cert: None,
        };
        encode_frame(&ProtocolMessage::Proposal(proposal))
    }

    fn send_frame_to(&mut self, from: usize, dests: &[usize], frame: Vec<u8>) {
        for &dest in dests {
            self.outbox.push_back(Envelope {
                from,
                to: Some(dest),
                frame: frame.clone(),
            });
        }
    }
}

fn inbound_event(message: ProtocolMessage) -> Option<Event> {
    match message {
        ProtocolMessage::Proposal(proposal) => Some(Event::ProposalReceived { proposal }),
        ProtocolMessage::Vote(vote) => Some(Event::VoteReceived { vote }),
        ProtocolMessage::Notify(notify) => Some(Event::NotifyReceived { notify }),
        ProtocolMessage::Blame(blame) => Some(Event::BlameReceived { blame }),
        ProtocolMessage::BlameNotify(blame_notify) => {
            Some(Event::BlameNotifyReceived { blame_notify })
        }
        ProtocolMessage::Finality(_) => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════

/// Happy path: leader 0 proposes b1, everyone votes, the certificate
/// rides in b2, and after 2Δ every replica decides b1's command.
#[traced_test]
#[test]
fn test_happy_path_commit() {
    let mut net = Harness::new(4, 1);
    let genesis = net.genesis();
    let cmd = Hash::digest(b"transfer");

    let b1 = net.propose(0, vec![cmd], &[genesis]);
    net.deliver_all(); // proposal out, votes back, certificate forms at 0
    assert_eq!(net.cores[0].bqc().hash(), b1);

    let b1_ref = net.cores[0].store().find_blk(&b1).unwrap();
    net.propose(0, vec![Hash::digest(b"next")], &[b1_ref]);
    net.deliver_all(); // b2 spreads the certificate for b1

    for core in &net.cores {
        assert_eq!(core.bqc().hash(), b1, "replica {} adopted QC(b1)", core.id());
    }

    // 2Δ passes without a blame quorum.
    net.fire_commit_timer_everywhere(b1);

    for (idx, decided) in net.decisions.iter().enumerate() {
        assert_eq!(decided.len(), 1, "replica {} decided", idx);
        assert_eq!(decided[0].decision, 1);
        assert_eq!(decided[0].cmd_hash, cmd);
        assert_eq!(decided[0].cmd_height, 1);
        assert_eq!(decided[0].blk_hash, Some(b1));
        assert_eq!(net.cores[idx].bexec().hash(), b1);
    }

    // Agreement: no two replicas decided different blocks at a height.
    let first = &net.decisions[0][0];
    for decided in &net.decisions[1..] {
        assert_eq!(decided[0].blk_hash, first.blk_hash);
    }
}

/// Safety under equivocation: a Byzantine leader shows half the network
/// one block and the other half a conflicting one. Neither side reaches
/// quorum and nothing commits.
#[traced_test]
#[test]
fn test_equivocating_leader_cannot_commit() {
    let mut net = Harness::new(4, 1);
    let genesis = net.genesis();
    let genesis_qc = QuorumCert::genesis(&genesis.hash());

    let frame_a = net.craft_proposal_frame(
        0,
        &genesis,
        genesis_qc.clone(),
        vec![Hash::digest(b"pay alice")],
    );
    let frame_b = net.craft_proposal_frame(0, &genesis, genesis_qc, vec![Hash::digest(b"pay bob")]);

    net.send_frame_to(0, &[0, 1], frame_a);
    net.send_frame_to(0, &[2, 3], frame_b);
    net.deliver_all(); // proposals land, votes flow back to the leader

    for core in &net.cores {
        assert_eq!(
            core.bqc().hash(),
            genesis.hash(),
            "no certificate forms from a split vote"
        );
    }
    for decided in &net.decisions {
        assert!(decided.is_empty(), "nothing may commit");
    }
}

/// View change: the leader goes silent, replicas blame, the blame quorum
/// advances every view, and the next leader's first proposal carries the
/// status certificate.
#[traced_test]
#[test]
fn test_blame_view_change() {
    let mut net = Harness::new(4, 1);
    let genesis = net.genesis();

    // PaceMaker timeouts on the three live replicas.
    for idx in [1, 2, 3] {
        net.apply(idx, Event::ViewTimeout);
    }
    net.deliver_all(); // blames cross, quorums form, views advance

    for core in &net.cores {
        assert_eq!(core.view(), 1, "replica {} advanced", core.id());
    }

    // Notifies crossed during delivery; leader 1 opens the new view.
    let actions = net.cores[1].on_propose(vec![Hash::digest(b"resume")], &[genesis], vec![]);
    let proposal = actions
        .iter()
        .find_map(|a| match a {
            Action::Broadcast {
                message: OutboundMessage::Proposal(p),
            } => Some(p.clone()),
            _ => None,
        })
        .expect("proposal broadcast");
    let status = proposal.status_cert.as_ref().expect("status certificate");
    assert_eq!(status.len(), net.config.nmajority());

    net.run_actions(1, actions);
    net.deliver_all();

    // The new-view proposal gathers votes normally.
    assert_eq!(net.cores[1].bqc().hash(), proposal.blk.hash());
}

/// Stale proposal: a block at or below `vheight` draws no vote, but the
/// proposal waiter still resolves.
#[traced_test]
#[test]
fn test_stale_proposal_ignored() {
    let mut net = Harness::new(4, 1);
    let genesis = net.genesis();

    net.propose(0, vec![Hash::digest(b"first")], &[genesis.clone()]);
    net.deliver_all();
    assert_eq!(net.cores[1].vheight(), 1);

    let mut rx = net.cores[1].async_wait_receive_proposal();
    let frame = net.craft_proposal_frame(
        0,
        &genesis,
        QuorumCert::genesis(&genesis.hash()),
        vec![Hash::digest(b"same height again")],
    );
    net.send_frame_to(0, &[1], frame);
    net.deliver_all();

    assert_eq!(net.cores[1].vheight(), 1, "no vote below the watermark");
    assert!(rx.try_recv().is_ok(), "waiter resolves regardless");
}

/// Out-of-order certificate arrival: a child block carrying QC(b1)
/// advances `bqc` and resolves the coordination surfaces exactly once.
#[traced_test]
#[test]
fn test_embedded_certificate_advances_bqc() {
    let mut net = Harness::new(4, 1);
    net.drop_notifies = true; // certificates travel only inside blocks
    let genesis = net.genesis();

    let b1 = net.propose(0, vec![Hash::digest(b"one")], &[genesis]);
    net.deliver_all();

    // Replica 2 subscribes before the certificate reaches it.
    let mut qc_rx = net.cores[2].async_qc_finish(b1);
    let mut bqc_rx = net.cores[2].async_bqc_update();
    assert_eq!(net.cores[2].bqc().height(), 0);

    let b1_ref = net.cores[0].store().find_blk(&b1).unwrap();
    net.propose(0, vec![Hash::digest(b"two")], &[b1_ref]);
    net.deliver_all();

    assert_eq!(net.cores[2].bqc().hash(), b1);
    assert_eq!(qc_rx.try_recv().unwrap(), b1);
    assert_eq!(bqc_rx.try_recv().unwrap(), b1);

    // The next subscription is pending again: the update fired once.
    let mut second = net.cores[2].async_bqc_update();
    assert!(second.try_recv().is_err());
}

/// Pruning: committed history below the staleness window leaves the
/// store; the frontier stays.
#[traced_test]
#[test]
fn test_prune_commits_below_staleness() {
    let mut net = Harness::new(4, 1);

    let mut parent = net.genesis();
    let mut hashes = vec![parent.hash()];
    for tag in 1..=6u8 {
        let blk = net.propose(0, vec![Hash::digest(&[tag])], &[parent.clone()]);
        net.deliver_all();
        net.fire_commit_timer_everywhere(blk);
        hashes.push(blk);
        parent = net.cores[0].store().find_blk(&blk).unwrap();
    }

    // Everything but the tip is committed once its certificate lands.
    assert!(net.cores[0].bexec().height() >= 5);

    let bexec_height = net.cores[0].bexec().height();
    let staleness = 2;
    net.cores[0].prune(staleness);
    let cutoff = bexec_height - staleness;

    for (height, hash) in hashes.iter().enumerate() {
        assert_eq!(
            net.cores[0].store().contains(hash),
            (height as u32) >= cutoff,
            "height {}",
            height
        );
    }

    // Other replicas are untouched.
    assert!(net.cores[1].store().contains(&hashes[0]));
}

/// Monotonic watermarks hold across a mixed run with equivocation and a
/// view change thrown in.
#[traced_test]
#[test]
fn test_watermarks_stay_monotonic_under_churn() {
    let mut net = Harness::new(4, 1);
    let genesis = net.genesis();

    let b1 = net.propose(0, vec![Hash::digest(b"a")], &[genesis.clone()]);
    net.deliver_all();

    // A conflicting fork at height 1 shows up late.
    let frame = net.craft_proposal_frame(
        0,
        &genesis,
        QuorumCert::genesis(&genesis.hash()),
        vec![Hash::digest(b"conflict")],
    );
    net.send_frame_to(0, &[1, 2, 3], frame);
    net.deliver_all();

    // Leader stalls; the others blame.
    for idx in [1, 2, 3] {
        net.apply(idx, Event::ViewTimeout);
    }
    net.deliver_all();

    let b1_ref = net.cores[0].store().find_blk(&b1).unwrap();
    net.propose(0, vec![Hash::digest(b"b")], &[b1_ref]);
    net.deliver_all();
    net.fire_commit_timer_everywhere(b1);

    // The invariant checks in `apply` did the real work; spot-check the
    // final frontier relation.
    for core in &net.cores {
        assert!(core.bexec().height() <= core.bqc().height());
    }
}
