//! Data models for SiteSync

mod entity;
mod outbox;
mod sync_conflict;
mod sync_state;
mod version;

pub use entity::{
    index_value, strip_reserved, Entity, EntityFilter, EntityId, EntityKind, IndexField,
    SyncStatus, RESERVED_KEYS,
};
pub use outbox::{ActionId, ActionStatus, ActionType, OutboxAction};
pub use sync_conflict::{Resolution, SyncConflict};
pub use sync_state::{SyncErrorKind, SyncErrorRecord, SyncPhase, SyncState};
pub use version::{AppVersion, UpdateType, VersionComparison, CLIENT_FEATURES};
