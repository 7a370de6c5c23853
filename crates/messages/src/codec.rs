//! Tag-byte envelope for transports that multiplex message kinds over
//! one stream.
//!
//! The core imposes no framing — the transport delimits messages — but
//! hosts still need to know which decoder to run. A single leading tag
//! byte does that; everything after it is the message's own encoding.

use crate::{
    Blame, BlameNotify, DecodeContext, Finality, Notify, Proposal, Vote, WireError, WireReader,
    WireWriter,
};

/// Wire tag for each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Proposal = 0,
    Vote = 1,
    Notify = 2,
    Blame = 3,
    BlameNotify = 4,
    Finality = 5,
}

impl MessageKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Proposal),
            1 => Some(MessageKind::Vote),
            2 => Some(MessageKind::Notify),
            3 => Some(MessageKind::Blame),
            4 => Some(MessageKind::BlameNotify),
            5 => Some(MessageKind::Finality),
            _ => None,
        }
    }
}

/// Any protocol message, for transport-level dispatch.
#[derive(Debug, Clone)]
pub enum ProtocolMessage {
    Proposal(Proposal),
    Vote(Vote),
    Notify(Notify),
    Blame(Blame),
    BlameNotify(BlameNotify),
    Finality(Finality),
}

impl ProtocolMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::Proposal(_) => MessageKind::Proposal,
            ProtocolMessage::Vote(_) => MessageKind::Vote,
            ProtocolMessage::Notify(_) => MessageKind::Notify,
            ProtocolMessage::Blame(_) => MessageKind::Blame,
            ProtocolMessage::BlameNotify(_) => MessageKind::BlameNotify,
            ProtocolMessage::Finality(_) => MessageKind::Finality,
        }
    }

    /// Human-readable name for log output.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Proposal(_) => "Proposal",
            ProtocolMessage::Vote(_) => "Vote",
            ProtocolMessage::Notify(_) => "Notify",
            ProtocolMessage::Blame(_) => "Blame",
            ProtocolMessage::BlameNotify(_) => "BlameNotify",
            ProtocolMessage::Finality(_) => "Finality",
        }
    }
}

/// Encode a message with its leading tag byte.
pub fn encode_frame(message: &ProtocolMessage) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u8(message.kind() as u8);
    match message {
        ProtocolMessage::Proposal(m) => m.encode(&mut w),
        ProtocolMessage::Vote(m) => m.encode(&mut w),
        ProtocolMessage::Notify(m) => m.encode(&mut w),
        ProtocolMessage::Blame(m) => m.encode(&mut w),
        ProtocolMessage::BlameNotify(m) => m.encode(&mut w),
        ProtocolMessage::Finality(m) => m.encode(&mut w),
    }
    w.into_bytes()
}

/// Decode one tagged frame. The whole input must be consumed.
pub fn decode_frame(data: &[u8], ctx: &DecodeContext<'_>) -> Result<ProtocolMessage, WireError> {
    let mut r = WireReader::new(data);
    let tag = r.get_u8()?;
    let kind = MessageKind::from_u8(tag).ok_or(WireError::BadValue { field: "tag" })?;
    let message = match kind {
        MessageKind::Proposal => ProtocolMessage::Proposal(Proposal::decode(&mut r, ctx)?),
        MessageKind::Vote => ProtocolMessage::Vote(Vote::decode(&mut r)?),
        MessageKind::Notify => ProtocolMessage::Notify(Notify::decode(&mut r)?),
        MessageKind::Blame => ProtocolMessage::Blame(Blame::decode(&mut r)?),
        MessageKind::BlameNotify => ProtocolMessage::BlameNotify(BlameNotify::decode(&mut r)?),
        MessageKind::Finality => ProtocolMessage::Finality(Finality::decode(&mut r)?),
    };
    r.finish()?;
    Ok(message)
}
