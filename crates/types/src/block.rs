//! Blocks: nodes in the replicated DAG.

use crate::{Hash, Height, QuorumCert};
use thiserror::Error;

/// Errors from block construction.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block has no parents")]
    NoParents,

    #[error("block height would overflow")]
    HeightOverflow,
}

/// An immutable block.
///
/// The first parent is the *primary* parent and determines the height;
/// the rest are uncle references. Commands are opaque 256-bit digests the
/// application interprets after commit. The embedded certificate, if any,
/// attests some ancestor block (`qc_ref`) — normally the primary parent.
///
/// The self-hash commits to the parents, commands, the *referenced* hash
/// inside the certificate, and the extra payload. It does not cover the
/// certificate's signature bytes, so the same block carries the same
/// identity regardless of which quorum signed its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    parents: Vec<Hash>,
    cmds: Vec<Hash>,
    qc_ref: Option<Hash>,
    qc: Option<QuorumCert>,
    extra: Vec<u8>,
    height: Height,
    hash: Hash,
}

impl Block {
    /// The genesis block: height 0, no parents, no certificate.
    pub fn genesis() -> Self {
        let hash = Self::content_hash(&[], &[], None, &[]);
        Self {
            parents: Vec::new(),
            cmds: Vec::new(),
            qc_ref: None,
            qc: None,
            extra: Vec::new(),
            height: 0,
            hash,
        }
    }

    /// Build a block from resolved parts.
    ///
    /// `height` must already be `primary parent height + 1`; the store
    /// computes it when interning wire blocks.
    pub fn from_parts(
        parents: Vec<Hash>,
        cmds: Vec<Hash>,
        qc: Option<(Hash, QuorumCert)>,
        extra: Vec<u8>,
        height: Height,
    ) -> Result<Self, BlockError> {
        if parents.is_empty() {
            return Err(BlockError::NoParents);
        }
        let (qc_ref, qc) = match qc {
            Some((blk_hash, cert)) => (Some(blk_hash), Some(cert)),
            None => (None, None),
        };
        let hash = Self::content_hash(&parents, &cmds, qc_ref.as_ref(), &extra);
        Ok(Self {
            parents,
            cmds,
            qc_ref,
            qc,
            extra,
            height,
            hash,
        })
    }

    /// Re-stamp the derived height. Store-internal; the identity hash is
    /// unaffected.
    pub(crate) fn with_height(mut self, height: Height) -> Self {
        self.height = height;
        self
    }

    fn content_hash(parents: &[Hash], cmds: &[Hash], qc_ref: Option<&Hash>, extra: &[u8]) -> Hash {
        let mut buf = Vec::with_capacity(13 + 32 * (parents.len() + cmds.len() + 1) + extra.len());
        buf.extend_from_slice(&(parents.len() as u32).to_le_bytes());
        for parent in parents {
            buf.extend_from_slice(parent.as_bytes());
        }
        buf.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
        for cmd in cmds {
            buf.extend_from_slice(cmd.as_bytes());
        }
        match qc_ref {
            Some(blk_hash) => {
                buf.push(1);
                buf.extend_from_slice(blk_hash.as_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(extra.len() as u32).to_le_bytes());
        buf.extend_from_slice(extra);
        Hash::digest(&buf)
    }

    /// Recompute the content hash and compare with the stored identity.
    pub fn verify_hash(&self) -> bool {
        Self::content_hash(&self.parents, &self.cmds, self.qc_ref.as_ref(), &self.extra)
            == self.hash
    }

    /// The block identity.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// All parent hashes; the first is the primary parent.
    pub fn parents(&self) -> &[Hash] {
        &self.parents
    }

    /// The primary parent, `None` only for genesis.
    pub fn primary_parent(&self) -> Option<&Hash> {
        self.parents.first()
    }

    /// Command digests carried by this block.
    pub fn cmds(&self) -> &[Hash] {
        &self.cmds
    }

    /// Hash of the block the embedded certificate attests.
    pub fn qc_ref(&self) -> Option<&Hash> {
        self.qc_ref.as_ref()
    }

    /// The embedded quorum certificate.
    pub fn qc(&self) -> Option<&QuorumCert> {
        self.qc.as_ref()
    }

    /// Opaque extra payload.
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Height in the chain.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Whether this is the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<blk {} height={} cmds={} qc={}>",
            self.hash.short(),
            self.height,
            self.cmds.len(),
            self.qc_ref.map(|h| h.short()).unwrap_or_else(|| "-".into()),
        )
    }
}
