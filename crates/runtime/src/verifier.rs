//! Certificate verification pool.
//!
//! Signature checks are CPU-bound and must never block the engine
//! thread. The engine emits `Verify*` actions; this pool runs the checks
//! on dedicated worker threads and sends the verdicts back as `*Verified`
//! events on the engine's queue. Verification is side-effect-free, so
//! tasks are freely reorderable.

use kestrel_core::{Action, Event};
use kestrel_types::ReplicaConfig;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum VerifierPoolError {
    #[error("failed to build verifier thread pool: {0}")]
    Build(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the verification pool.
#[derive(Debug, Clone)]
pub struct VerifierPoolConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Stack size per worker in bytes.
    pub stack_size: usize,
}

impl VerifierPoolConfig {
    /// Use a quarter of the available cores, at least one.
    pub fn auto() -> Self {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            threads: (available / 4).max(1),
            stack_size: 2 * 1024 * 1024,
        }
    }

    /// One worker thread, for tests and small deployments.
    pub fn minimal() -> Self {
        Self {
            threads: 1,
            stack_size: 2 * 1024 * 1024,
        }
    }

    fn validate(&self) -> Result<(), VerifierPoolError> {
        if self.threads == 0 {
            return Err(VerifierPoolError::InvalidConfig(
                "threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for VerifierPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// A bounded worker pool for certificate verification.
///
/// Holds the replica configuration so the engine's actions stay lean:
/// they carry only the message being checked.
pub struct VerifierPool {
    pool: rayon::ThreadPool,
    replica_config: Arc<ReplicaConfig>,
    event_tx: mpsc::Sender<Event>,
    pending: Arc<AtomicUsize>,
}

impl VerifierPool {
    pub fn new(
        config: VerifierPoolConfig,
        replica_config: Arc<ReplicaConfig>,
        event_tx: mpsc::Sender<Event>,
    ) -> Result<Self, VerifierPoolError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .stack_size(config.stack_size)
            .thread_name(|i| format!("verify-{}", i))
            .build()
            .map_err(|e| VerifierPoolError::Build(e.to_string()))?;

        debug!(threads = config.threads, "verifier pool initialized");

        Ok(Self {
            pool,
            replica_config,
            event_tx,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Execute a delegated verification action.
    ///
    /// Returns immediately; the verdict arrives on the event queue. Non
    /// delegated actions are a caller bug and are dropped.
    pub fn submit(&self, action: Action) {
        debug_assert!(action.is_delegated(), "submit requires a Verify* action");

        let replica_config = self.replica_config.clone();
        let event_tx = self.event_tx.clone();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::Relaxed);

        self.pool.spawn(move || {
            let event = match action {
                Action::VerifyProposal { proposal } => {
                    let valid = proposal.verify(&replica_config);
                    Event::ProposalVerified { proposal, valid }
                }
                Action::VerifyVote { vote } => {
                    let valid = vote.verify(&replica_config);
                    Event::VoteVerified { vote, valid }
                }
                Action::VerifyNotify { notify } => {
                    let valid = notify.verify(&replica_config);
                    Event::NotifyVerified { notify, valid }
                }
                Action::VerifyBlame { blame } => {
                    let valid = blame.verify(&replica_config);
                    Event::BlameVerified { blame, valid }
                }
                Action::VerifyBlameNotify { blame_notify } => {
                    let valid = blame_notify.verify(&replica_config);
                    Event::BlameNotifyVerified { blame_notify, valid }
                }
                other => {
                    warn!(action = other.type_name(), "non-delegated action submitted");
                    pending.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };
            pending.fetch_sub(1, Ordering::Relaxed);
            // The engine shutting down mid-verification is fine.
            let _ = event_tx.blocking_send(event);
        });
    }

    /// Number of checks currently queued or running.
    pub fn queue_depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}
