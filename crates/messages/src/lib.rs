//! Protocol messages and their wire encodings.
//!
//! Six message kinds cross the wire:
//!
//! | Message | Carries |
//! |---|---|
//! | [`Proposal`] | a block, the certificate for its parent, optional status notifies |
//! | [`Vote`] | one replica's partial certificate over a block |
//! | [`Notify`] | a quorum certificate for a block (status during view change) |
//! | [`Blame`] | one replica's partial certificate against a view |
//! | [`BlameNotify`] | a quorum certificate against a view |
//! | [`Finality`] | a decision record emitted to the application |
//!
//! Encodings are field-concatenated little-endian; see [`wire`]. Decoding
//! takes an explicit [`DecodeContext`] — the block store to intern blocks
//! into and the replica configuration for thresholds — so messages carry
//! no reference back into the engine.
//!
//! Each message splits validation in two: cheap structural checks at
//! decode time, and the signature work in [`verify`](Proposal::verify),
//! which the engine delegates to the verification pool.

mod codec;
mod wire;

pub use codec::{decode_frame, encode_frame, MessageKind, ProtocolMessage};
pub use wire::{WireError, WireReader, WireWriter};

use kestrel_types::{
    blame_proof_hash, vote_proof_hash, Block, BlockRef, BlockStore, Hash, Height, KeyType,
    PartialCert, QuorumCert, ReplicaConfig, ReplicaId, Signature, View,
};

/// Everything decoding needs from the engine's environment.
#[derive(Clone, Copy)]
pub struct DecodeContext<'a> {
    pub store: &'a BlockStore,
    pub config: &'a ReplicaConfig,
}

// ─── certificate encodings ──────────────────────────────────────────────

fn put_partial_cert(w: &mut WireWriter, cert: &PartialCert) {
    w.put_hash(&cert.proof_hash());
    w.put_u16(cert.signer().0);
    w.put_bytes(&cert.signature().to_bytes());
}

fn get_partial_cert(r: &mut WireReader<'_>) -> Result<PartialCert, WireError> {
    let proof_hash = r.get_hash()?;
    let signer = ReplicaId(r.get_u16()?);
    let sig = Signature::from_bytes(KeyType::Ed25519, r.get_sig_bytes()?);
    Ok(PartialCert::from_parts(proof_hash, signer, sig))
}

fn put_quorum_cert(w: &mut WireWriter, qc: &QuorumCert) {
    w.put_hash(&qc.proof_hash());
    w.put_u32(qc.sigs().len() as u32);
    for (signer, sig) in qc.sigs() {
        w.put_u16(signer.0);
        w.put_bytes(&sig.to_bytes());
    }
}

fn get_quorum_cert(r: &mut WireReader<'_>) -> Result<QuorumCert, WireError> {
    let proof_hash = r.get_hash()?;
    let n = r.get_u32()? as usize;
    let mut sigs = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let signer = ReplicaId(r.get_u16()?);
        let sig = Signature::from_bytes(KeyType::Ed25519, r.get_sig_bytes()?);
        sigs.push((signer, sig));
    }
    Ok(QuorumCert::from_parts(proof_hash, sigs))
}

// ─── block encoding ─────────────────────────────────────────────────────

fn put_block(w: &mut WireWriter, blk: &Block) {
    w.put_u32(blk.parents().len() as u32);
    for parent in blk.parents() {
        w.put_hash(parent);
    }
    w.put_u32(blk.cmds().len() as u32);
    for cmd in blk.cmds() {
        w.put_hash(cmd);
    }
    match (blk.qc_ref(), blk.qc()) {
        (Some(qc_ref), Some(qc)) => {
            w.put_u8(1);
            w.put_hash(qc_ref);
            put_quorum_cert(w, qc);
        }
        _ => w.put_u8(0),
    }
    w.put_u32(blk.extra().len() as u32);
    w.put_bytes(blk.extra());
}

/// Decode a block and intern it. The parents must already be delivered;
/// the height comes from the primary parent.
fn get_block(r: &mut WireReader<'_>, ctx: &DecodeContext<'_>) -> Result<BlockRef, WireError> {
    let n_parents = r.get_u32()? as usize;
    let mut parents = Vec::with_capacity(n_parents.min(1024));
    for _ in 0..n_parents {
        parents.push(r.get_hash()?);
    }
    let n_cmds = r.get_u32()? as usize;
    let mut cmds = Vec::with_capacity(n_cmds.min(4096));
    for _ in 0..n_cmds {
        cmds.push(r.get_hash()?);
    }
    let qc = match r.get_u8()? {
        0 => None,
        1 => {
            let qc_ref = r.get_hash()?;
            Some((qc_ref, get_quorum_cert(r)?))
        }
        _ => return Err(WireError::BadValue { field: "has_qc" }),
    };
    let extra_len = r.get_u32()? as usize;
    let extra = r.get_bytes(extra_len)?;

    Ok(ctx.store.intern(parents, cmds, qc, extra)?)
}

// ─── Proposal ───────────────────────────────────────────────────────────

/// A leader's proposal of a new block.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub proposer: ReplicaId,
    /// The proposed block, interned in the store.
    pub blk: BlockRef,
    /// Quorum certificate for the block's primary parent.
    pub cert_pblk: QuorumCert,
    /// Status notifies gathered during a view change, attached to the
    /// first proposal of the new view. Exactly `nmajority` entries when
    /// present.
    pub status_cert: Option<Vec<Notify>>,
}

impl Proposal {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.proposer.0);
        put_block(w, &self.blk);
        put_quorum_cert(w, &self.cert_pblk);
        match &self.status_cert {
            None => w.put_u8(0),
            Some(notifies) => {
                w.put_u8(1);
                for notify in notifies {
                    notify.encode(w);
                }
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>, ctx: &DecodeContext<'_>) -> Result<Self, WireError> {
        let proposer = ReplicaId(r.get_u16()?);
        let blk = get_block(r, ctx)?;
        let cert_pblk = get_quorum_cert(r)?;
        let status_cert = match r.get_u8()? {
            0 => None,
            1 => {
                let mut notifies = Vec::with_capacity(ctx.config.nmajority());
                for _ in 0..ctx.config.nmajority() {
                    notifies.push(Notify::decode(r)?);
                }
                Some(notifies)
            }
            _ => return Err(WireError::BadValue { field: "has_status" }),
        };
        Ok(Self {
            proposer,
            blk,
            cert_pblk,
            status_cert,
        })
    }

    /// Full verification: the parent certificate is a valid quorum over
    /// the primary parent's vote proof text, the block's embedded
    /// certificate (if any) is valid, and every status notify verifies.
    ///
    /// A signatureless certificate is accepted only where it references
    /// genesis.
    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        let Some(primary) = self.blk.primary_parent() else {
            return false;
        };
        if self.cert_pblk.proof_hash() != vote_proof_hash(primary) {
            return false;
        }
        if !verify_qc_or_genesis(&self.cert_pblk, primary, config) {
            return false;
        }
        if let (Some(qc_ref), Some(qc)) = (self.blk.qc_ref(), self.blk.qc()) {
            if qc.proof_hash() != vote_proof_hash(qc_ref) {
                return false;
            }
            if !verify_qc_or_genesis(qc, qc_ref, config) {
                return false;
            }
        }
        if let Some(status) = &self.status_cert {
            if status.len() != config.nmajority() {
                return false;
            }
            if !status.iter().all(|notify| notify.verify(config)) {
                return false;
            }
        }
        true
    }
}

fn verify_qc_or_genesis(qc: &QuorumCert, referenced: &Hash, config: &ReplicaConfig) -> bool {
    if qc.is_genesis() {
        *referenced == Block::genesis().hash()
    } else {
        qc.verify(config)
    }
}

// ─── Vote ───────────────────────────────────────────────────────────────

/// One replica's vote for a block, sent to the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub voter: ReplicaId,
    pub blk_hash: Hash,
    pub cert: PartialCert,
}

impl Vote {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.voter.0);
        w.put_hash(&self.blk_hash);
        put_partial_cert(w, &self.cert);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let voter = ReplicaId(r.get_u16()?);
        let blk_hash = r.get_hash()?;
        let cert = get_partial_cert(r)?;
        Ok(Self {
            voter,
            blk_hash,
            cert,
        })
    }

    /// The certificate must attest this block's vote proof text and
    /// carry a valid signature under the voter's key.
    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        if self.cert.signer() != self.voter {
            return false;
        }
        if self.cert.proof_hash() != vote_proof_hash(&self.blk_hash) {
            return false;
        }
        let Some(pubkey) = config.get_pubkey(self.voter) else {
            return false;
        };
        self.cert.verify(&pubkey)
    }
}

// ─── Notify ─────────────────────────────────────────────────────────────

/// A replica's report of its highest quorum certificate (the status
/// message of the view-change path, also sent opportunistically whenever
/// the certified frontier advances).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub blk_hash: Hash,
    pub qc: QuorumCert,
}

impl Notify {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_hash(&self.blk_hash);
        put_quorum_cert(w, &self.qc);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let blk_hash = r.get_hash()?;
        let qc = get_quorum_cert(r)?;
        Ok(Self { blk_hash, qc })
    }

    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        if self.qc.proof_hash() != vote_proof_hash(&self.blk_hash) {
            return false;
        }
        verify_qc_or_genesis(&self.qc, &self.blk_hash, config)
    }
}

// ─── Blame ──────────────────────────────────────────────────────────────

/// A signed complaint about the current view's leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blame {
    pub blamer: ReplicaId,
    pub view: View,
    pub cert: PartialCert,
}

impl Blame {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.blamer.0);
        w.put_u32(self.view);
        put_partial_cert(w, &self.cert);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let blamer = ReplicaId(r.get_u16()?);
        let view = r.get_u32()?;
        let cert = get_partial_cert(r)?;
        Ok(Self {
            blamer,
            view,
            cert,
        })
    }

    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        if self.cert.signer() != self.blamer {
            return false;
        }
        if self.cert.proof_hash() != blame_proof_hash(self.view) {
            return false;
        }
        let Some(pubkey) = config.get_pubkey(self.blamer) else {
            return false;
        };
        self.cert.verify(&pubkey)
    }
}

// ─── BlameNotify ────────────────────────────────────────────────────────

/// Proof that `2f + 1` replicas blamed a view; receiving one advances the
/// view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameNotify {
    pub view: View,
    pub qc: QuorumCert,
}

impl BlameNotify {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.view);
        put_quorum_cert(w, &self.qc);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let view = r.get_u32()?;
        let qc = get_quorum_cert(r)?;
        Ok(Self { view, qc })
    }

    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        self.qc.proof_hash() == blame_proof_hash(self.view) && self.qc.verify(config)
    }
}

// ─── Finality ───────────────────────────────────────────────────────────

/// A per-command decision record handed to the application.
///
/// `decision == 1` means committed and `blk_hash` is present; other
/// values are reserved for abort and reject variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finality {
    pub rid: ReplicaId,
    pub decision: i8,
    pub cmd_idx: u32,
    pub cmd_height: Height,
    pub cmd_hash: Hash,
    pub blk_hash: Option<Hash>,
}

impl Finality {
    /// A committed decision for command `cmd_idx` of block `blk_hash`.
    pub fn committed(
        rid: ReplicaId,
        cmd_idx: u32,
        cmd_height: Height,
        cmd_hash: Hash,
        blk_hash: Hash,
    ) -> Self {
        Self {
            rid,
            decision: 1,
            cmd_idx,
            cmd_height,
            cmd_hash,
            blk_hash: Some(blk_hash),
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.rid.0);
        w.put_i8(self.decision);
        w.put_u32(self.cmd_idx);
        w.put_u32(self.cmd_height);
        w.put_hash(&self.cmd_hash);
        if self.decision == 1 {
            // committed records always carry the block
            w.put_hash(self.blk_hash.as_ref().expect("committed without block"));
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let rid = ReplicaId(r.get_u16()?);
        let decision = r.get_i8()?;
        let cmd_idx = r.get_u32()?;
        let cmd_height = r.get_u32()?;
        let cmd_hash = r.get_hash()?;
        let blk_hash = if decision == 1 {
            Some(r.get_hash()?)
        } else {
            None
        };
        Ok(Self {
            rid,
            decision,
            cmd_idx,
            cmd_height,
            cmd_hash,
            blk_hash,
        })
    }
}
