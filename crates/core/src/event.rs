//! Event types for the deterministic state machine.

use kestrel_messages::{Blame, BlameNotify, Notify, Proposal, Vote};
use kestrel_types::{Hash, QuorumCert};

/// Priority levels for event ordering within the same instant.
///
/// Lower values are processed first. Internal events are consequences of
/// prior processing and must land before new external input to preserve
/// causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,
    /// Timers scheduled by the replica itself.
    Timer = 1,
    /// Messages from other replicas.
    Network = 2,
}

/// All possible inputs to the replica state machine.
///
/// Events are passive data — they describe something that happened. The
/// engine processes them and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════
    /// A proposal was delivered (its block already interned).
    ProposalReceived { proposal: Proposal },

    /// A vote arrived from another replica.
    VoteReceived { vote: Vote },

    /// A status notify arrived.
    NotifyReceived { notify: Notify },

    /// A blame against the current view arrived.
    BlameReceived { blame: Blame },

    /// A blame quorum certificate arrived.
    BlameNotifyReceived { blame_notify: BlameNotify },

    // ═══════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════
    /// The 2Δ commit timer for a block expired without a conflicting
    /// blame quorum.
    CommitTimeout { blk_hash: Hash },

    /// The PaceMaker gave up on the current view's leader.
    ViewTimeout,

    // ═══════════════════════════════════════════════════════════════════
    // Verification Callbacks (priority: Internal)
    // Results from the delegated `Verify*` actions.
    // ═══════════════════════════════════════════════════════════════════
    ProposalVerified { proposal: Proposal, valid: bool },
    VoteVerified { vote: Vote, valid: bool },
    NotifyVerified { notify: Notify, valid: bool },
    BlameVerified { blame: Blame, valid: bool },
    BlameNotifyVerified { blame_notify: BlameNotify, valid: bool },

    // ═══════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════
    /// Enough votes accumulated to certify a block.
    QuorumCertificateFormed { blk_hash: Hash, qc: QuorumCert },
}

impl Event {
    /// Ordering priority of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ProposalReceived { .. }
            | Event::VoteReceived { .. }
            | Event::NotifyReceived { .. }
            | Event::BlameReceived { .. }
            | Event::BlameNotifyReceived { .. } => EventPriority::Network,

            Event::CommitTimeout { .. } | Event::ViewTimeout => EventPriority::Timer,

            Event::ProposalVerified { .. }
            | Event::VoteVerified { .. }
            | Event::NotifyVerified { .. }
            | Event::BlameVerified { .. }
            | Event::BlameNotifyVerified { .. }
            | Event::QuorumCertificateFormed { .. } => EventPriority::Internal,
        }
    }

    /// Get the event type name for log output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::NotifyReceived { .. } => "NotifyReceived",
            Event::BlameReceived { .. } => "BlameReceived",
            Event::BlameNotifyReceived { .. } => "BlameNotifyReceived",
            Event::CommitTimeout { .. } => "CommitTimeout",
            Event::ViewTimeout => "ViewTimeout",
            Event::ProposalVerified { .. } => "ProposalVerified",
            Event::VoteVerified { .. } => "VoteVerified",
            Event::NotifyVerified { .. } => "NotifyVerified",
            Event::BlameVerified { .. } => "BlameVerified",
            Event::BlameNotifyVerified { .. } => "BlameNotifyVerified",
            Event::QuorumCertificateFormed { .. } => "QuorumCertificateFormed",
        }
    }
}
