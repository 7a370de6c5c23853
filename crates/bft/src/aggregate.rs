//! Partial-certificate aggregation.

use kestrel_types::{
    CertificateError, Hash, PartialCert, QuorumCert, ReplicaConfig, ReplicaId,
};
use std::collections::BTreeMap;

/// Collects partial certificates over one proof text until a quorum
/// certificate can be built.
///
/// One set exists per pending block (keyed by block hash) and per blamed
/// view (keyed by view number). Arrival order does not matter: signers
/// are kept in a map, so the finished certificate is identical whichever
/// order the partials came in.
#[derive(Debug)]
pub struct PartialSet {
    proof_hash: Hash,
    partials: BTreeMap<ReplicaId, PartialCert>,
}

impl PartialSet {
    /// Start collecting for a proof text.
    pub fn new(proof_hash: Hash) -> Self {
        Self {
            proof_hash,
            partials: BTreeMap::new(),
        }
    }

    /// Add a verified partial certificate.
    ///
    /// Returns false for duplicates and for certificates over a different
    /// proof text; the caller drops those silently.
    pub fn add(&mut self, cert: PartialCert) -> bool {
        if cert.proof_hash() != self.proof_hash {
            return false;
        }
        if self.partials.contains_key(&cert.signer()) {
            return false;
        }
        self.partials.insert(cert.signer(), cert);
        true
    }

    /// Whether a replica already contributed.
    pub fn contains(&self, signer: ReplicaId) -> bool {
        self.partials.contains_key(&signer)
    }

    /// Number of distinct contributors.
    pub fn count(&self) -> usize {
        self.partials.len()
    }

    /// Whether the quorum threshold is reached.
    pub fn has_quorum(&self, config: &ReplicaConfig) -> bool {
        self.count() >= config.quorum_size()
    }

    /// Build the quorum certificate.
    pub fn build_qc(&self, config: &ReplicaConfig) -> Result<QuorumCert, CertificateError> {
        let partials: Vec<PartialCert> = self.partials.values().cloned().collect();
        QuorumCert::aggregate(self.proof_hash, &partials, config)
    }
}
