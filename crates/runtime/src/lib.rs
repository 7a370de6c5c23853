//! Host runtime for the kestrel replication core.
//!
//! The engine itself performs no I/O; this crate supplies the pieces a
//! host wires around it:
//!
//! - [`VerifierPool`]: a bounded worker pool that executes the engine's
//!   delegated signature checks and feeds verdicts back as events
//! - [`CommitTimers`]: 2Δ commit timers keyed by height, with range
//!   cancellation
//! - [`Runner`]: the single-threaded engine loop that drains the event
//!   queue and executes actions against a host [`Transport`] and
//!   [`DecisionSink`]

mod runner;
mod timers;
mod verifier;

pub use runner::{inbound_event, DecisionSink, Runner, Transport};
pub use timers::CommitTimers;
pub use verifier::{VerifierPool, VerifierPoolConfig, VerifierPoolError};
