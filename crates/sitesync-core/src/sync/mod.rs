//! Synchronization with the remote authority
//!
//! The [`SyncEngine`] pushes the outbox in batches over a [`SyncTransport`],
//! pulls the change feed and applies it, and settles divergences through the
//! heuristics in [`conflict`].

pub mod conflict;
mod engine;
pub mod protocol;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use engine::{
    SkipReason, SyncEngine, SyncEvent, SyncOutcome, SyncReport, SyncTrigger, SyncWorker,
};
pub use transport::{HttpSyncTransport, InProcessTransport, SyncTransport, CLIENT_ID_HEADER};
