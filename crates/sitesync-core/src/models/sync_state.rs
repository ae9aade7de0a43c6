//! Process-wide synchronization state observed by the UI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActionId;

/// Phase of the sync engine state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    #[default]
    Idle,
    CheckingVersion,
    Pushing,
    Pulling,
    Resolving,
}

impl SyncPhase {
    /// Progress value reported when the phase is entered
    pub const fn progress(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::CheckingVersion => 10,
            Self::Pushing => 25,
            Self::Pulling => 60,
            Self::Resolving => 85,
        }
    }
}

/// Error taxonomy for the sync error log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorKind {
    Storage,
    Network,
    Conflict,
    Validation,
    Migration,
}

/// An error accumulated by the sync engine instead of being thrown
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    pub kind: SyncErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    pub at: DateTime<Utc>,
}

/// Snapshot of the engine's state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Outbox entries still awaiting acknowledgement (pending or syncing)
    pub pending_actions: usize,
    /// Outbox entries that exhausted retries or were rejected
    pub failed_actions: usize,
    /// Unresolved conflicts
    pub conflict_count: usize,
    /// 0..=100, monotonic within a cycle
    pub sync_progress: u8,
    /// Bounded, oldest first
    pub errors: Vec<SyncErrorRecord>,
}

impl SyncState {
    /// Append an error, evicting the oldest entries beyond `max_errors`.
    pub fn push_error(&mut self, record: SyncErrorRecord, max_errors: usize) {
        self.errors.push(record);
        if self.errors.len() > max_errors {
            let overflow = self.errors.len() - max_errors;
            self.errors.drain(..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> SyncErrorRecord {
        SyncErrorRecord {
            kind: SyncErrorKind::Network,
            message: message.to_string(),
            action_id: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn push_error_evicts_oldest() {
        let mut state = SyncState::default();
        for index in 0..5 {
            state.push_error(record(&format!("e{index}")), 3);
        }
        let messages: Vec<_> = state.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn phase_progress_is_ascending() {
        let phases = [
            SyncPhase::CheckingVersion,
            SyncPhase::Pushing,
            SyncPhase::Pulling,
            SyncPhase::Resolving,
        ];
        assert!(phases.windows(2).all(|pair| pair[0].progress() < pair[1].progress()));
    }
}
