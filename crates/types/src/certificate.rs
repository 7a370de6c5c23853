//! Vote and blame certificates.
//!
//! Replicas sign *proof texts*, canonical byte strings naming what is
//! being attested:
//!
//! ```text
//! vote  proof text: 0x00 ‖ blk_hash          (33 bytes)
//! blame proof text: 0x01 ‖ view as u32 LE    (5 bytes)
//! ```
//!
//! Certificates store the SHA-256 *hash* of the proof text, never the raw
//! text: a [`PartialCert`] is one replica's signature over it, a
//! [`QuorumCert`] aggregates `2f + 1` of them from distinct replicas.

use crate::{Hash, KeyPair, PublicKey, ReplicaConfig, ReplicaId, Signature, View};
use thiserror::Error;

/// Proof-text tag bytes.
const PROOF_TAG_VOTE: u8 = 0x00;
const PROOF_TAG_BLAME: u8 = 0x01;

/// Hash of the vote proof text for a block.
pub fn vote_proof_hash(blk_hash: &Hash) -> Hash {
    let mut text = [0u8; 33];
    text[0] = PROOF_TAG_VOTE;
    text[1..].copy_from_slice(blk_hash.as_bytes());
    Hash::digest(&text)
}

/// Hash of the blame proof text for a view.
pub fn blame_proof_hash(view: View) -> Hash {
    let mut text = [0u8; 5];
    text[0] = PROOF_TAG_BLAME;
    text[1..].copy_from_slice(&view.to_le_bytes());
    Hash::digest(&text)
}

/// Errors from certificate aggregation.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("signer {0} already contributed to this certificate")]
    DuplicateSigner(ReplicaId),

    #[error("partial certificate attests a different proof text")]
    ProofTextMismatch,

    #[error("{got} signatures collected, {need} required")]
    ThresholdNotReached { got: usize, need: usize },
}

/// A single replica's signature over a proof-text hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCert {
    proof_hash: Hash,
    signer: ReplicaId,
    signature: Signature,
}

impl PartialCert {
    /// Sign a proof-text hash.
    pub fn create(keypair: &KeyPair, signer: ReplicaId, proof_hash: Hash) -> Self {
        let signature = keypair.sign(proof_hash.as_bytes());
        Self {
            proof_hash,
            signer,
            signature,
        }
    }

    /// Rebuild from wire fields.
    pub fn from_parts(proof_hash: Hash, signer: ReplicaId, signature: Signature) -> Self {
        Self {
            proof_hash,
            signer,
            signature,
        }
    }

    /// The proof-text hash this certificate attests.
    pub fn proof_hash(&self) -> Hash {
        self.proof_hash
    }

    /// The signing replica.
    pub fn signer(&self) -> ReplicaId {
        self.signer
    }

    /// The raw signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Check the signature under the given public key.
    pub fn verify(&self, pubkey: &PublicKey) -> bool {
        pubkey.verify(self.proof_hash.as_bytes(), &self.signature)
    }
}

/// An aggregation of partial certificates over one proof text.
///
/// Signers are kept strictly ascending by replica id, which makes the
/// aggregate independent of partial-certificate arrival order and gives a
/// canonical wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumCert {
    proof_hash: Hash,
    sigs: Vec<(ReplicaId, Signature)>,
}

impl QuorumCert {
    /// Aggregate partial certificates into a quorum certificate.
    ///
    /// Requires every partial to attest `proof_hash`, distinct signers,
    /// and at least `config.quorum_size()` contributions. Signature
    /// validity is not checked here; [`verify`](QuorumCert::verify) does
    /// that.
    pub fn aggregate(
        proof_hash: Hash,
        partials: &[PartialCert],
        config: &ReplicaConfig,
    ) -> Result<Self, CertificateError> {
        let mut sigs: Vec<(ReplicaId, Signature)> = Vec::with_capacity(partials.len());
        for partial in partials {
            if partial.proof_hash != proof_hash {
                return Err(CertificateError::ProofTextMismatch);
            }
            if sigs.iter().any(|(id, _)| *id == partial.signer) {
                return Err(CertificateError::DuplicateSigner(partial.signer));
            }
            sigs.push((partial.signer, partial.signature));
        }
        if sigs.len() < config.quorum_size() {
            return Err(CertificateError::ThresholdNotReached {
                got: sigs.len(),
                need: config.quorum_size(),
            });
        }
        sigs.sort_by_key(|(id, _)| *id);
        Ok(Self { proof_hash, sigs })
    }

    /// Rebuild from wire fields. Signer order is normalized.
    pub fn from_parts(proof_hash: Hash, mut sigs: Vec<(ReplicaId, Signature)>) -> Self {
        sigs.sort_by_key(|(id, _)| *id);
        Self { proof_hash, sigs }
    }

    /// The structural certificate carried by the genesis block.
    ///
    /// It has no signatures; verification treats it as valid only where
    /// the protocol explicitly allows a genesis reference.
    pub fn genesis(genesis_hash: &Hash) -> Self {
        Self {
            proof_hash: vote_proof_hash(genesis_hash),
            sigs: Vec::new(),
        }
    }

    /// Whether this is the signatureless genesis certificate.
    pub fn is_genesis(&self) -> bool {
        self.sigs.is_empty()
    }

    /// The proof-text hash this certificate attests.
    pub fn proof_hash(&self) -> Hash {
        self.proof_hash
    }

    /// The aggregated signatures, ascending by signer.
    pub fn sigs(&self) -> &[(ReplicaId, Signature)] {
        &self.sigs
    }

    /// Number of distinct signers.
    pub fn signer_count(&self) -> usize {
        self.sigs.len()
    }

    /// Verify the aggregate: at least `2f + 1` valid signatures over the
    /// proof text from distinct configured replicas.
    ///
    /// This is the expensive call; hosts run it on the verification pool.
    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        if self.sigs.len() < config.quorum_size() {
            return false;
        }
        // Ascending order doubles as the distinctness check.
        let mut prev: Option<ReplicaId> = None;
        for (signer, signature) in &self.sigs {
            if prev.is_some_and(|p| p >= *signer) {
                return false;
            }
            prev = Some(*signer);
            let Some(pubkey) = config.get_pubkey(*signer) else {
                return false;
            };
            if !pubkey.verify(self.proof_hash.as_bytes(), signature) {
                return false;
            }
        }
        true
    }
}
