//! Database layer for SiteSync

mod conflict_repository;
mod connection;
mod entity_repository;
mod migrations;
mod outbox_repository;
mod state_repository;

pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use connection::{begin, commit, rollback, transaction, Database, Schema};
pub use entity_repository::{
    is_foreign_key, rewrite_foreign_keys, EntityCursor, EntityRepository, LibSqlEntityRepository,
};
pub use outbox_repository::{LibSqlOutboxRepository, OutboxRepository};
pub use state_repository::{keys, LibSqlStateRepository, StateRepository};

use crate::error::{Error, Result};
use libsql::{Row, Value};

/// Read a nullable TEXT column
pub(crate) fn opt_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

/// Read a nullable INTEGER column
pub(crate) fn opt_int(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

/// Bind an optional string as TEXT or NULL
pub(crate) fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}
