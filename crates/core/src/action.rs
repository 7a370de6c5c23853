//! Action types for the deterministic state machine.

use crate::{Event, OutboundMessage};
use kestrel_messages::{Blame, BlameNotify, Finality, Notify, Proposal, Vote};
use kestrel_types::{Hash, Height, ReplicaId};
use std::time::Duration;

/// Actions the state machine wants performed.
///
/// Actions are **commands** — they describe something to do. The runner
/// executes them and may convert results back into events. None of them
/// re-enter the engine on the same stack.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════
    /// Send a message to every other replica.
    Broadcast { message: OutboundMessage },

    /// Send a message to one replica (votes go to the proposer alone).
    Send {
        to: ReplicaId,
        message: OutboundMessage,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Application Output
    // ═══════════════════════════════════════════════════════════════════
    /// Hand a decided command to the application.
    Decide { finality: Finality },

    // ═══════════════════════════════════════════════════════════════════
    // Commit Timers
    // ═══════════════════════════════════════════════════════════════════
    /// Arm the 2Δ commit timer for a block. Fires back as
    /// `Event::CommitTimeout`.
    SetCommitTimer {
        blk_hash: Hash,
        height: Height,
        duration: Duration,
    },

    /// Cancel every armed commit timer at or below `height`.
    StopCommitTimers { height: Height },

    // ═══════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // Signature checks run on the verification pool; the engine thread
    // never blocks on them.
    // ═══════════════════════════════════════════════════════════════════
    /// Verify a proposal's certificates. Returns `Event::ProposalVerified`.
    VerifyProposal { proposal: Proposal },

    /// Verify a vote's partial certificate. Returns `Event::VoteVerified`.
    VerifyVote { vote: Vote },

    /// Verify a notify's quorum certificate. Returns `Event::NotifyVerified`.
    VerifyNotify { notify: Notify },

    /// Verify a blame's partial certificate. Returns `Event::BlameVerified`.
    VerifyBlame { blame: Blame },

    /// Verify a blame quorum. Returns `Event::BlameNotifyVerified`.
    VerifyBlameNotify { blame_notify: BlameNotify },

    // ═══════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing, ahead of any
    /// pending external input.
    EnqueueInternal { event: Event },
}

impl Action {
    /// Check if this action is delegated work (runs on the verification
    /// pool, returns a callback event).
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::VerifyProposal { .. }
                | Action::VerifyVote { .. }
                | Action::VerifyNotify { .. }
                | Action::VerifyBlame { .. }
                | Action::VerifyBlameNotify { .. }
        )
    }

    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Get the action type name for log output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Send { .. } => "Send",
            Action::Decide { .. } => "Decide",
            Action::SetCommitTimer { .. } => "SetCommitTimer",
            Action::StopCommitTimers { .. } => "StopCommitTimers",
            Action::VerifyProposal { .. } => "VerifyProposal",
            Action::VerifyVote { .. } => "VerifyVote",
            Action::VerifyNotify { .. } => "VerifyNotify",
            Action::VerifyBlame { .. } => "VerifyBlame",
            Action::VerifyBlameNotify { .. } => "VerifyBlameNotify",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
        }
    }
}
