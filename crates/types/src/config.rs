//! Replica-set configuration.

use crate::{PublicKey, ReplicaId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from building or querying the replica configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("replica {0} already registered")]
    DuplicateReplica(ReplicaId),

    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),
}

/// A single replica's registration.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub pubkey: PublicKey,
}

/// Immutable configuration for a protocol run.
///
/// Built once before the engine starts via repeated [`add_replica`]
/// calls, then frozen behind an `Arc`. With `nfaulty = f`:
///
/// - `nmajority = f + 1` is the single-certificate threshold (and the
///   status-certificate size),
/// - `quorum_size = 2f + 1` is the quorum-certificate threshold,
/// - `delta` is the assumed message-delay bound Δ; commit timers run for
///   `2Δ`.
///
/// [`add_replica`]: ReplicaConfig::add_replica
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    replicas: HashMap<ReplicaId, ReplicaInfo>,
    nmajority: usize,
    delta: Duration,
}

impl ReplicaConfig {
    /// Create a configuration for a run tolerating `nfaulty` Byzantine
    /// replicas with synchrony bound `delta`.
    pub fn new(nfaulty: usize, delta: Duration) -> Self {
        Self {
            replicas: HashMap::new(),
            nmajority: nfaulty + 1,
            delta,
        }
    }

    /// Register a replica. Should only be called before the protocol
    /// starts running.
    pub fn add_replica(
        &mut self,
        id: ReplicaId,
        addr: SocketAddr,
        pubkey: PublicKey,
    ) -> Result<(), ConfigError> {
        if self.replicas.contains_key(&id) {
            return Err(ConfigError::DuplicateReplica(id));
        }
        self.replicas.insert(id, ReplicaInfo { id, addr, pubkey });
        Ok(())
    }

    /// Public key of a replica.
    pub fn get_pubkey(&self, id: ReplicaId) -> Option<PublicKey> {
        self.replicas.get(&id).map(|info| info.pubkey)
    }

    /// Network address of a replica.
    pub fn get_addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.replicas.get(&id).map(|info| info.addr)
    }

    /// Whether the id belongs to the configured replica set.
    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replicas.contains_key(&id)
    }

    /// Single-certificate threshold, `f + 1`.
    pub fn nmajority(&self) -> usize {
        self.nmajority
    }

    /// Quorum-certificate threshold, `2f + 1`.
    pub fn quorum_size(&self) -> usize {
        2 * self.nmajority - 1
    }

    /// The synchrony bound Δ.
    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// Commit-timer duration, `2Δ`.
    pub fn commit_timeout(&self) -> Duration {
        self.delta * 2
    }

    /// Number of registered replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether no replicas have been registered yet.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Iterate over all registered replicas.
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.values()
    }

    /// All replica ids except `me`, for broadcast fan-out.
    pub fn peers_of(&self, me: ReplicaId) -> Vec<ReplicaId> {
        let mut peers: Vec<ReplicaId> =
            self.replicas.keys().copied().filter(|&id| id != me).collect();
        peers.sort();
        peers
    }
}
