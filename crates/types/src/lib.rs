//! Core types for the kestrel replication protocol.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: [`Hash`], cryptographic keys and signatures
//! - **Certificates**: [`PartialCert`], [`QuorumCert`] and the canonical
//!   proof texts they attest
//! - **Entities**: [`Block`] and the content-addressed [`BlockStore`]
//! - **Configuration**: [`ReplicaConfig`] (replica set, quorum thresholds,
//!   the synchrony bound Δ)
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crates, making it the foundation layer. Everything here is immutable
//! after construction except the block store, which is mutated only by the
//! engine thread.

mod block;
mod certificate;
mod config;
mod crypto;
mod hash;
mod store;

pub use block::{Block, BlockError};
pub use certificate::{
    blame_proof_hash, vote_proof_hash, CertificateError, PartialCert, QuorumCert,
};
pub use config::{ConfigError, ReplicaConfig, ReplicaInfo};
pub use crypto::{KeyPair, KeyType, PublicKey, Signature};
pub use hash::Hash;
pub use store::{BlockRef, BlockStore, EntityError};

/// Identity of a replica within a protocol run.
///
/// Sixteen bits on the wire; assigned densely from zero by the host when
/// the replica set is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u16);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chain height. Genesis is 0; every block is one above its primary parent.
pub type Height = u32;

/// View (epoch) number, advanced by the blame path.
pub type View = u32;
