//! Snapshot Policy Engine.
//!
//! Decides, per edit, whether the session's latest revision is extended in
//! place or a new revision is opened:
//!
//! ```text
//!            edit(doc, session, content, reason)
//!                          │
//!          ┌───────────────▼────────────────┐
//!          │ latest = session's last rev     │
//!          └───────────────┬────────────────┘
//!   none / not current / sealed / forced / now - created >= interval
//!              │ yes                        │ no
//!              ▼                            ▼
//!     Create rev N+1 (current)      Extend rev in place
//! ```
//!
//! Forced snapshots seal their revision: the next ordinary edit always opens
//! a new one, which restarts the interval clock.

use std::sync::Arc;
use std::time::Duration;

use folio_store::{
    DocumentStore, EditDecision, EditInput, EditOutcome, EditReason, Revision, StoreError,
};
use uuid::Uuid;

use crate::error::EditError;

/// Default snapshot interval: 5 minutes.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Pure create-vs-extend rule.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    interval_ms: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

impl SnapshotPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Decide for an edit arriving at `now` given the session's latest revision.
    pub fn decide(&self, latest: Option<&Revision>, reason: EditReason, now: u64) -> EditDecision {
        let Some(rev) = latest else {
            return EditDecision::Create;
        };
        if reason.is_forced() || !rev.is_current || rev.is_sealed() {
            return EditDecision::Create;
        }
        if now.saturating_sub(rev.created_at) >= self.interval_ms {
            return EditDecision::Create;
        }
        EditDecision::Extend
    }
}

/// Applies the policy to the store, one version-checked transaction per edit.
pub struct SnapshotEngine {
    store: Arc<DocumentStore>,
    policy: SnapshotPolicy,
}

impl SnapshotEngine {
    pub fn new(store: Arc<DocumentStore>, policy: SnapshotPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Record one edit and return the revision it landed in.
    ///
    /// A commit conflict is retried once against freshly read rows; a second
    /// conflict is returned to the caller.
    pub fn record_edit(
        &self,
        doc_id: Uuid,
        session_id: Uuid,
        editor_id: Uuid,
        content: &str,
        reason: EditReason,
    ) -> Result<EditOutcome, EditError> {
        if reason == EditReason::Upload {
            return Err(EditError::Validation(
                "reason 'upload' is reserved for extraction".into(),
            ));
        }

        let input = EditInput {
            doc_id,
            session_id,
            editor_id,
            content: content.to_string(),
            reason,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let policy = self.policy;
            let result = self
                .store
                .apply_edit(&input, |ctx| policy.decide(ctx.latest, ctx.reason, ctx.now));
            match result {
                Ok(outcome) => {
                    log::debug!(
                        "Edit on {doc_id} by session {session_id}: {} revision {} ({})",
                        if outcome.created { "created" } else { "extended" },
                        outcome.revision.number,
                        reason.as_str()
                    );
                    return Ok(outcome);
                }
                Err(StoreError::Conflict(msg)) if attempt < 2 => {
                    log::debug!("Edit conflict on {doc_id}, retrying: {msg}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Forced snapshot of `content` tagged `export`.
    pub fn export(
        &self,
        doc_id: Uuid,
        session_id: Uuid,
        editor_id: Uuid,
        content: &str,
    ) -> Result<EditOutcome, EditError> {
        self.record_edit(doc_id, session_id, editor_id, content, EditReason::Export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_store::SizeMetrics;

    fn rev(created_at: u64, reason: EditReason, number: u64) -> Revision {
        Revision {
            id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            number,
            content: String::new(),
            metrics: SizeMetrics::default(),
            editor_id: Uuid::new_v4(),
            created_at,
            updated_at: created_at,
            reason,
            session_id: None,
            is_current: true,
            is_archived: false,
            archive_pointer: None,
            archive_pending: false,
            content_evicted: false,
            update_count: 0,
        }
    }

    #[test]
    fn test_no_latest_creates() {
        let policy = SnapshotPolicy::default();
        assert_eq!(policy.decide(None, EditReason::Autosave, 0), EditDecision::Create);
    }

    #[test]
    fn test_within_interval_extends() {
        let policy = SnapshotPolicy::default();
        let latest = rev(1_000, EditReason::Autosave, 1);
        let now = 1_000 + 299_999;
        assert_eq!(
            policy.decide(Some(&latest), EditReason::Manual, now),
            EditDecision::Extend
        );
    }

    #[test]
    fn test_interval_boundary_creates() {
        let policy = SnapshotPolicy::new(Duration::from_secs(60));
        let latest = rev(0, EditReason::Autosave, 1);
        assert_eq!(
            policy.decide(Some(&latest), EditReason::Autosave, 60_000),
            EditDecision::Create
        );
    }

    #[test]
    fn test_forced_reason_creates() {
        let policy = SnapshotPolicy::default();
        let latest = rev(0, EditReason::Autosave, 1);
        assert_eq!(
            policy.decide(Some(&latest), EditReason::Export, 1),
            EditDecision::Create
        );
    }

    #[test]
    fn test_sealed_revisions_are_never_extended() {
        let policy = SnapshotPolicy::default();
        let exported = rev(0, EditReason::Export, 2);
        assert_eq!(
            policy.decide(Some(&exported), EditReason::Autosave, 1),
            EditDecision::Create
        );
        let initial = rev(0, EditReason::Upload, 0);
        assert_eq!(
            policy.decide(Some(&initial), EditReason::Autosave, 1),
            EditDecision::Create
        );
    }

    #[test]
    fn test_superseded_latest_creates() {
        let policy = SnapshotPolicy::default();
        let mut latest = rev(0, EditReason::Autosave, 1);
        latest.is_current = false;
        assert_eq!(
            policy.decide(Some(&latest), EditReason::Autosave, 1),
            EditDecision::Create
        );
    }
}
