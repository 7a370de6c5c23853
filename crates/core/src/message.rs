//! Outbound message wrapper for network communication.

use kestrel_messages::{Blame, BlameNotify, Notify, Proposal, ProtocolMessage, Vote};

/// Messages the engine asks the host to put on the wire.
///
/// The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Proposal(Proposal),
    Vote(Vote),
    Notify(Notify),
    Blame(Blame),
    BlameNotify(BlameNotify),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::Notify(_) => "Notify",
            OutboundMessage::Blame(_) => "Blame",
            OutboundMessage::BlameNotify(_) => "BlameNotify",
        }
    }

    /// Convert into the transport-level frame enum.
    pub fn into_protocol(self) -> ProtocolMessage {
        match self {
            OutboundMessage::Proposal(m) => ProtocolMessage::Proposal(m),
            OutboundMessage::Vote(m) => ProtocolMessage::Vote(m),
            OutboundMessage::Notify(m) => ProtocolMessage::Notify(m),
            OutboundMessage::Blame(m) => ProtocolMessage::Blame(m),
            OutboundMessage::BlameNotify(m) => ProtocolMessage::BlameNotify(m),
        }
    }
}
