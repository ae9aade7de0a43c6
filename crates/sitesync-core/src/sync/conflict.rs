//! Conflict auto-resolution heuristics and the shallow merge.

use serde_json::{Map, Value};

use crate::models::{Entity, Resolution};

use super::protocol::ServerRecord;

/// What to do with a detected divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Settle silently with the given resolution
    Auto(Resolution),
    /// Record a conflict for a human to resolve
    Manual,
}

/// Decide whether a divergence can be settled without a human.
///
/// First match wins:
/// - deleted locally, present remotely: take the server copy
/// - deleted remotely, present locally: manual
/// - both present: server strictly newer wins, otherwise manual
/// - both absent: nothing to keep, take the server side
pub fn auto_resolve(local: Option<&Entity>, server: Option<&ServerRecord>) -> Verdict {
    match (local, server) {
        (None, Some(_) | None) => Verdict::Auto(Resolution::Server),
        (Some(_), None) => Verdict::Manual,
        (Some(local), Some(server)) => {
            if server.last_modified > local.last_modified {
                Verdict::Auto(Resolution::Server)
            } else {
                Verdict::Manual
            }
        }
    }
}

/// Shallow union of both sides; server values win on key collisions.
pub fn merge(local: Option<&Entity>, server: Option<&ServerRecord>) -> Map<String, Value> {
    let mut merged = local.map(|entity| entity.data.clone()).unwrap_or_default();
    if let Some(server) = server {
        for (key, value) in &server.fields {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
