//! Core vocabulary for the kestrel replication engine.
//!
//! This crate defines the event-driven model the engine is built on:
//!
//! - [`Event`]: all possible inputs to the state machine
//! - [`Action`]: all possible outputs from the state machine
//! - [`EventPriority`]: ordering priority for events at the same instant
//! - [`StateMachine`]: the trait the engine implements
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is synchronous and deterministic: it mutates itself
//! but performs no I/O. The host runner delivers events, executes the
//! returned actions (network sends, timers, delegated signature
//! verification) and converts action results back into events. Delegated
//! verification is how handlers "suspend": the handler returns after
//! emitting a `Verify*` action, and the rest of its work runs when the
//! matching `*Verified` event comes back on the engine thread.

mod action;
mod event;
mod message;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;
pub use traits::StateMachine;
