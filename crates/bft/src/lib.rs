//! BFT replica state machine.
//!
//! This crate provides the synchronous consensus engine: a pure,
//! network-agnostic state machine that ingests authenticated protocol
//! messages, maintains a block DAG, advances a commit frontier with
//! safety under up to *f* Byzantine failures, and emits outbound messages
//! and finality decisions as actions.
//!
//! # Architecture
//!
//! The engine processes events synchronously:
//!
//! - `Event::ProposalReceived` → verify, update the certified frontier, vote
//! - `Event::VoteReceived` → collect partials, form a QC at `2f + 1`
//! - `Event::QuorumCertificateFormed` → adopt `bqc`, commit if timers allow
//! - `Event::CommitTimeout` → mark the 2Δ synchrony observation, commit
//! - `Event::BlameReceived` / `BlameNotifyReceived` → view change
//!
//! All I/O is performed by the runner via returned `Action`s; signature
//! checks are delegated to the verification pool and come back as
//! `*Verified` events.
//!
//! # Protocol
//!
//! ## Safety
//!
//! - **Monotonic vote height**: a replica votes only above `vheight`, so
//!   it never votes twice at one height.
//!
//! - **Extension rule**: a replica votes only for blocks that extend its
//!   `bqc` through primary-parent links. Together with quorum
//!   intersection this prevents conflicting commits.
//!
//! ## Commit rule
//!
//! A block commits once a quorum certificate exists on a descendant *and*
//! its own 2Δ commit timer expired without a conflicting blame quorum —
//! the timer is the local synchrony observation this protocol family
//! trades for the third chain round.
//!
//! ## Liveness
//!
//! - **Blame path**: replicas that perceive a stalled leader sign a
//!   `Blame` for the view; `2f + 1` blames aggregate into a `BlameNotify`
//!   whose receipt advances the view and triggers `Notify` status
//!   messages, which the next leader bundles into its first proposal.

mod aggregate;
mod state;
mod view_change;
mod waiters;

pub use aggregate::PartialSet;
pub use state::{ConsensusCore, CoreStats};
pub use view_change::ViewChangeState;
pub use waiters::Waiters;
