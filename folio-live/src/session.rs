//! Session Tracker: the lifecycle of one user's editing activity.
//!
//! ```text
//!   start ──► open ──heartbeat/edit──► open ──► ended
//!                                        │   (completed | abandoned | timed_out)
//!                                        └── idle sweep: last_activity < now - idle
//! ```
//!
//! End-of-session delivery is best effort from the browser and may arrive
//! more than once, so ending is idempotent: a second end is a no-op.

use std::sync::Arc;
use std::time::Duration;

use folio_store::{
    AuditAction, AuditResult, DocumentStore, EditReason, EditSession, SessionEnd, SessionInsert,
    SessionOutcome, StoreError,
};
use serde::Serialize;
use uuid::Uuid;

use crate::archival::{ArchiveStatus, Archiver};
use crate::error::EditError;
use crate::gate::{AccessGate, AuditLog, CallerMeta};
use crate::policy::SnapshotEngine;

/// Unsaved content recovered from the client after a crash, differing from
/// the current revision. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOffer {
    pub content: String,
    pub current_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub token: Uuid,
    /// False when the token already named this user's session
    pub created: bool,
    pub recovery: Option<RecoveryOffer>,
}

/// What ending a session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndReport {
    pub session: EditSession,
    /// False when the session had already ended
    pub ended_now: bool,
    pub archived: Option<ArchiveStatus>,
}

pub struct SessionTracker {
    store: Arc<DocumentStore>,
    engine: Arc<SnapshotEngine>,
    archiver: Arc<Archiver>,
    gate: Arc<AccessGate>,
    audit: AuditLog,
    idle_timeout: Duration,
    end_budget: Duration,
}

impl SessionTracker {
    pub fn new(
        store: Arc<DocumentStore>,
        engine: Arc<SnapshotEngine>,
        archiver: Arc<Archiver>,
        gate: Arc<AccessGate>,
        idle_timeout: Duration,
        end_budget: Duration,
    ) -> Self {
        let audit = gate.audit_log().clone();
        Self {
            store,
            engine,
            archiver,
            gate,
            audit,
            idle_timeout,
            end_budget,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Open a session, or return the existing one for a repeated token.
    pub fn start_session(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        token: Option<Uuid>,
        recovery: Option<String>,
    ) -> Result<SessionStart, EditError> {
        let now = self.store.now();
        let session = EditSession {
            token: token.unwrap_or_else(Uuid::new_v4),
            doc_id,
            user_id,
            started_at: now,
            last_activity: now,
            ended_at: None,
            revision_count: 0,
            edit_count: 0,
            last_revision: None,
            outcome: None,
        };

        let (session, created) = match self.store.insert_session(session)? {
            SessionInsert::Created(s) => (s, true),
            SessionInsert::Existing(s) => {
                if s.user_id != user_id || s.doc_id != doc_id {
                    return Err(EditError::Validation(format!(
                        "session {} belongs to another user or document",
                        s.token
                    )));
                }
                (s, false)
            }
        };

        let recovery = match recovery {
            Some(content) => self.recovery_offer(doc_id, content)?,
            None => None,
        };
        if created {
            log::info!("Session {} opened on {doc_id} by {user_id}", session.token);
        }
        Ok(SessionStart {
            token: session.token,
            created,
            recovery,
        })
    }

    fn recovery_offer(&self, doc_id: Uuid, content: String) -> Result<Option<RecoveryOffer>, EditError> {
        let current = self.store.current_revision(doc_id)?;
        let (current_content, _) = self.archiver.read_content(&current)?;
        if current_content == content {
            return Ok(None);
        }
        Ok(Some(RecoveryOffer {
            content,
            current_revision: current.number,
        }))
    }

    /// Record client liveness. Ended sessions are reported as not found.
    pub fn heartbeat(&self, token: Uuid, user_id: Uuid) -> Result<(), EditError> {
        let session = self.owned_session(token, user_id)?;
        if !session.is_open() {
            return Err(EditError::NotFound(format!("session {token} ended")));
        }
        match self.store.touch_session(token) {
            Ok(_) => Ok(()),
            Err(StoreError::Invalid(_)) => Err(EditError::NotFound(format!("session {token} ended"))),
            Err(e) => Err(e.into()),
        }
    }

    /// End a session, saving `final_content` first when given.
    ///
    /// The final save goes through the access gate as an edit by the
    /// session's user. If it is denied or fails the content is dropped and
    /// the session still ends. The session's latest revision is then
    /// archived within the end-session budget; archival failure is logged
    /// and leaves the revision pending.
    pub async fn end_session(
        &self,
        token: Uuid,
        user_id: Option<Uuid>,
        final_content: Option<String>,
        outcome: SessionOutcome,
        caller: &CallerMeta,
    ) -> Result<SessionEndReport, EditError> {
        let session = self
            .store
            .session(token)?
            .ok_or_else(|| EditError::NotFound(format!("session {token}")))?;
        if user_id.is_some_and(|u| u != session.user_id) {
            return Err(EditError::denied("session belongs to another user"));
        }
        if !session.is_open() {
            log::debug!("Session {token} already ended, ignoring repeat");
            return Ok(SessionEndReport {
                session,
                ended_now: false,
                archived: None,
            });
        }

        if let Some(content) = final_content {
            match self.save_final(&session, &content, caller) {
                Ok(()) => {}
                // Lost a race with another end; the other call did the work
                Err(EditError::Validation(msg)) => {
                    log::debug!("Final save of session {token} skipped: {msg}")
                }
                Err(e) => log::warn!("Dropped final content of session {token}: {e}"),
            }
        }

        let session = match self.store.end_session(token, outcome)? {
            SessionEnd::Ended(s) => s,
            SessionEnd::AlreadyEnded(s) => {
                return Ok(SessionEndReport {
                    session: s,
                    ended_now: false,
                    archived: None,
                })
            }
        };
        log::info!(
            "Session {token} ended ({outcome:?}, {} revisions)",
            session.revision_count
        );

        let archived = match session.last_revision {
            Some(number) => self
                .archiver
                .archive_within(session.doc_id, number, self.end_budget)
                .await
                .ok(),
            None => None,
        };
        Ok(SessionEndReport {
            session,
            ended_now: true,
            archived,
        })
    }

    fn save_final(
        &self,
        session: &EditSession,
        content: &str,
        caller: &CallerMeta,
    ) -> Result<(), EditError> {
        self.gate
            .require(session.user_id, session.doc_id, AuditAction::Edit, caller)?;
        self.engine.record_edit(
            session.doc_id,
            session.token,
            session.user_id,
            content,
            EditReason::SessionEnd,
        )?;
        Ok(())
    }

    /// Close every open session idle since before `now - idle_timeout`.
    ///
    /// Returns the tokens that were closed by this sweep.
    pub fn sweep_idle(&self) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = self
            .store
            .now()
            .saturating_sub(self.idle_timeout.as_millis() as u64);
        let mut closed = Vec::new();
        for session in self.store.idle_sessions(cutoff)? {
            match self.store.end_session(session.token, SessionOutcome::TimedOut) {
                Ok(SessionEnd::Ended(s)) => {
                    log::info!("Session {} timed out", s.token);
                    if let Some(number) = s.last_revision {
                        let _ = self.archiver.archive_revision(s.doc_id, number);
                    }
                    closed.push(s.token);
                }
                Ok(SessionEnd::AlreadyEnded(_)) => {}
                Err(StoreError::Conflict(_)) => {
                    log::debug!("Session {} changed during sweep, skipping", session.token);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    /// Administrative close with outcome `abandoned`.
    pub fn force_close(
        &self,
        token: Uuid,
        admin_id: Uuid,
        reason: &str,
        caller: &CallerMeta,
    ) -> Result<EditSession, EditError> {
        let session = match self.store.end_session(token, SessionOutcome::Abandoned)? {
            SessionEnd::Ended(s) => s,
            SessionEnd::AlreadyEnded(s) => {
                return Err(EditError::Validation(format!(
                    "session {} already ended",
                    s.token
                )))
            }
        };
        self.audit.record(
            admin_id,
            session.user_id,
            Some(session.doc_id),
            AuditAction::CloseSession,
            AuditResult::Applied,
            reason,
            caller,
        )?;
        if let Some(number) = session.last_revision {
            let _ = self.archiver.archive_revision(session.doc_id, number);
        }
        log::info!("Session {token} force-closed by {admin_id}");
        Ok(session)
    }

    fn owned_session(&self, token: Uuid, user_id: Uuid) -> Result<EditSession, EditError> {
        let session = self
            .store
            .session(token)?
            .ok_or_else(|| EditError::NotFound(format!("session {token}")))?;
        if session.user_id != user_id {
            return Err(EditError::denied("session belongs to another user"));
        }
        Ok(session)
    }
}
