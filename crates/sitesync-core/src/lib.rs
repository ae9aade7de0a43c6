//! sitesync-core - Offline-first synchronization core for SiteSync
//!
//! Local libSQL store with an outbox, the offline-first facade business code
//! talks to, the sync engine that pushes and pulls against the remote
//! authority, conflict handling, version checks, and the authority's own
//! apply logic shared with the API server.

pub mod authority;
pub mod config;
pub mod db;
pub mod error;
pub mod facade;
pub mod models;
pub mod network;
pub mod services;
pub mod sync;
pub mod util;
pub mod version;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use facade::OfflineApi;
pub use models::{Entity, EntityFilter, EntityId, EntityKind};
pub use network::NetworkMonitor;
pub use services::LocalStore;
pub use sync::{SyncEngine, SyncTrigger};
