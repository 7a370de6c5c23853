//! The engine loop.
//!
//! One logical thread owns the state machine. The runner drains the
//! event queue, applies each event, and executes the returned actions:
//! network sends go to the host [`Transport`], decisions to the
//! [`DecisionSink`], timers to [`CommitTimers`], verification to the
//! [`VerifierPool`]. Internal events are applied immediately, before any
//! queued external input, preserving causality.

use kestrel_bft::ConsensusCore;
use kestrel_core::{Action, Event, OutboundMessage, StateMachine};
use kestrel_messages::{Finality, ProtocolMessage};
use kestrel_types::ReplicaId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::timers::CommitTimers;
use crate::verifier::{VerifierPool, VerifierPoolConfig, VerifierPoolError};

/// Host-side network egress.
pub trait Transport: Send {
    /// Send to every other replica.
    fn broadcast(&mut self, message: OutboundMessage);
    /// Send to one replica.
    fn send(&mut self, to: ReplicaId, message: OutboundMessage);
}

/// Host-side application output.
pub trait DecisionSink: Send {
    fn decide(&mut self, finality: Finality);
}

/// Map an inbound protocol message to its engine event.
///
/// Returns `None` for messages the engine never ingests (`Finality` is
/// output-only).
pub fn inbound_event(message: ProtocolMessage) -> Option<Event> {
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

/// Drives a [`ConsensusCore`] against host I/O.
pub struct Runner<T: Transport, D: DecisionSink> {
    core: ConsensusCore,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    verifier: VerifierPool,
    timers: CommitTimers,
    transport: T,
    decisions: D,
}

impl<T: Transport, D: DecisionSink> Runner<T, D> {
    /// Wire a runner around an engine.
    pub fn new(
        core: ConsensusCore,
        transport: T,
        decisions: D,
        pool_config: VerifierPoolConfig,
    ) -> Result<Self, VerifierPoolError> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let verifier = VerifierPool::new(pool_config, core.config().clone(), event_tx.clone())?;
        let timers = CommitTimers::new(event_tx.clone());
        Ok(Self {
            core,
            event_tx,
            event_rx,
            verifier,
            timers,
            transport,
            decisions,
        })
    }

    /// The engine under this runner.
    pub fn core(&self) -> &ConsensusCore {
        &self.core
    }

    /// Mutable engine access, for PaceMaker surfaces and delivery.
    pub fn core_mut(&mut self) -> &mut ConsensusCore {
        &mut self.core
    }

    /// A sender the transport layer feeds inbound events into.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Submit commands for a new block on the given parents.
    pub fn propose(
        &mut self,
        cmds: Vec<kestrel_types::Hash>,
        parents: &[kestrel_types::BlockRef],
        extra: Vec<u8>,
    ) {
        let actions = self.core.on_propose(cmds, parents, extra);
        self.execute(actions);
    }

    /// Process one queued event. Returns false once every sender is gone.
    pub async fn step(&mut self) -> bool {
        match self.event_rx.recv().await {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Run until the event queue closes.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    fn dispatch(&mut self, event: Event) {
        trace!(event = event.type_name(), "dispatch");
        let actions = self.core.handle(event);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => self.transport.broadcast(message),
                Action::Send { to, message } => self.transport.send(to, message),
                Action::Decide { finality } => self.decisions.decide(finality),
                Action::SetCommitTimer {
                    blk_hash,
                    height,
                    duration,
                } => self.timers.set(blk_hash, height, duration),
                Action::StopCommitTimers { height } => self.timers.stop_up_to(height),
                Action::EnqueueInternal { event } => self.dispatch(event),
                delegated => self.verifier.submit(delegated),
            }
        }
    }
}
