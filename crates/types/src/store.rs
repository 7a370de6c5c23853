//! Content-addressed block storage.

use crate::{Block, Hash, Height, QuorumCert};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Shared, read-only handle to a stored block.
pub type BlockRef = Arc<Block>;

/// Errors from block admission.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("malformed block: {0}")]
    Malformed(#[from] crate::BlockError),

    #[error("block {0} fails its self-hash check")]
    HashMismatch(Hash),

    #[error("parent {parent} of block {block} is not in the store")]
    MissingParent { block: Hash, parent: Hash },

    #[error("certificate reference {qc_ref} of block {block} is not in the store")]
    MissingQcRef { block: Hash, qc_ref: Hash },

    #[error("block {block} claims height {claimed}, expected {expected}")]
    HeightMismatch {
        block: Hash,
        claimed: Height,
        expected: Height,
    },
}

/// The canonical home of every admitted block.
///
/// The store owns the one copy of each block; everything else holds
/// [`BlockRef`]s. Admission is idempotent by hash. Any thread may read;
/// only the engine thread mutates (the lock makes concurrent reads safe,
/// the engine discipline keeps writes single-threaded).
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: RwLock<HashMap<Hash, BlockRef>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a block.
    ///
    /// All parents and the certificate-referenced block must already be
    /// present (the delivery layer guarantees this; the store still
    /// refuses rather than trusting the caller). Re-admitting a block
    /// returns the existing reference.
    pub fn add_blk(&self, block: Block) -> Result<BlockRef, EntityError> {
        if !block.verify_hash() {
            return Err(EntityError::HashMismatch(block.hash()));
        }

        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&block.hash()) {
            trace!(block = %block.hash().short(), "block already admitted");
            return Ok(existing.clone());
        }

        if !block.is_genesis() {
            for parent in block.parents() {
                if !blocks.contains_key(parent) {
                    return Err(EntityError::MissingParent {
                        block: block.hash(),
                        parent: *parent,
                    });
                }
            }
            if let Some(qc_ref) = block.qc_ref() {
                if !blocks.contains_key(qc_ref) {
                    return Err(EntityError::MissingQcRef {
                        block: block.hash(),
                        qc_ref: *qc_ref,
                    });
                }
            }
            // Height is derived state; a wrong claim means a broken caller.
            let expected = blocks[block.primary_parent().expect("non-genesis")].height() + 1;
            if block.height() != expected {
                return Err(EntityError::HeightMismatch {
                    block: block.hash(),
                    claimed: block.height(),
                    expected,
                });
            }
        }

        let blk_ref: BlockRef = Arc::new(block);
        blocks.insert(blk_ref.hash(), blk_ref.clone());
        Ok(blk_ref)
    }

    /// Build a block from wire parts and admit it.
    ///
    /// Resolves the primary parent to compute the height, so the parent
    /// must already be present.
    pub fn intern(
        &self,
        parents: Vec<Hash>,
        cmds: Vec<Hash>,
        qc: Option<(Hash, QuorumCert)>,
        extra: Vec<u8>,
    ) -> Result<BlockRef, EntityError> {
        // The content hash ignores the height, so building at a
        // placeholder height yields the true identity for error reports.
        let probe = Block::from_parts(parents, cmds, qc, extra, 0)?;
        let primary = *probe.primary_parent().expect("from_parts requires parents");
        let parent_height = {
            let blocks = self.blocks.read();
            blocks
                .get(&primary)
                .map(|b| b.height())
                .ok_or(EntityError::MissingParent {
                    block: probe.hash(),
                    parent: primary,
                })?
        };
        self.add_blk(probe.with_height(parent_height + 1))
    }

    /// Look up a block by hash.
    pub fn find_blk(&self, hash: &Hash) -> Option<BlockRef> {
        self.blocks.read().get(hash).cloned()
    }

    /// Whether a block is present.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.read().contains_key(hash)
    }

    /// Drop all blocks strictly below `below_height`.
    ///
    /// Returns how many blocks were removed. References held elsewhere
    /// stay valid; only the store's index forgets them.
    pub fn prune(&self, below_height: Height) -> usize {
        let mut blocks = self.blocks.write();
        let before = blocks.len();
        blocks.retain(|_, blk| blk.height() >= below_height);
        let removed = before - blocks.len();
        if removed > 0 {
            trace!(below_height, removed, "pruned blocks");
        }
        removed
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}
