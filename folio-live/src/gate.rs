//! Access Gate: the single enforcement point for protected reads.
//!
//! ```text
//! check_access(user, resource)
//!   1. global revocation, unexpired        → deny  "user revoked"
//!   2. resource revocation, unexpired      → deny  "resource revoked"
//!   3. user owns the resource              → allow "owner"
//!   4. explicitly shared                   → allow "granted"
//!   5. otherwise                           → deny  "not shared"
//! ```
//!
//! Sharing and revocation live on the same record but are independent: a
//! lapsed or restored revocation returns the user to whatever share state
//! they had before it, never to more.
//!
//! Revocation state is read from the store on every call; nothing is cached,
//! so a revocation applies to the very next read. Every decision appends an
//! audit entry before it is returned. If the append fails the read is
//! refused.

use std::sync::Arc;

use folio_store::{AccessRecord, AuditAction, AuditEntry, AuditResult, DocumentStore};
use serde::Serialize;
use uuid::Uuid;

use crate::error::EditError;

pub const REASON_USER_REVOKED: &str = "user revoked";
pub const REASON_RESOURCE_REVOKED: &str = "resource revoked";
pub const REASON_OWNER: &str = "owner";
pub const REASON_GRANTED: &str = "granted";
pub const REASON_NOT_SHARED: &str = "not shared";

/// Request metadata recorded with every audit entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerMeta {
    pub ip: Option<String>,
    pub agent: Option<String>,
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl Decision {
    fn allow(reason: &'static str) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Administrative revocation.
#[derive(Debug, Clone)]
pub struct Revocation {
    pub admin_id: Uuid,
    pub user_id: Uuid,
    /// `None` revokes every resource
    pub resource_id: Option<Uuid>,
    pub reason: String,
    /// Temporary revocations stop applying at this time (epoch ms)
    pub expires_at: Option<u64>,
}

/// Append-only audit writer shared by the gate and the session tracker.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<DocumentStore>,
}

impl AuditLog {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        actor_id: Uuid,
        subject_id: Uuid,
        resource_id: Option<Uuid>,
        action: AuditAction,
        result: AuditResult,
        reason: &str,
        caller: &CallerMeta,
    ) -> Result<AuditEntry, EditError> {
        let entry = AuditEntry {
            seq: 0,
            actor_id,
            subject_id,
            resource_id,
            action,
            result,
            reason: reason.to_string(),
            caller_ip: caller.ip.clone(),
            caller_agent: caller.agent.clone(),
            at: self.store.now(),
        };
        self.store.append_audit(entry).map_err(|e| {
            log::error!("Audit append failed for {subject_id}: {e}");
            EditError::Storage(e)
        })
    }
}

pub struct AccessGate {
    store: Arc<DocumentStore>,
    audit: AuditLog,
}

impl AccessGate {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        let audit = AuditLog::new(store.clone());
        Self { store, audit }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Decide whether `user_id` may perform `action` on `resource_id`.
    ///
    /// Unknown resources return `NotFound` without an audit entry.
    pub fn check_access(
        &self,
        user_id: Uuid,
        resource_id: Uuid,
        action: AuditAction,
        caller: &CallerMeta,
    ) -> Result<Decision, EditError> {
        let doc = self
            .store
            .document(resource_id)?
            .ok_or_else(|| EditError::NotFound(format!("document {resource_id}")))?;

        let decision = self.decide(user_id, resource_id, doc.owner_id)?;
        let result = if decision.allowed {
            AuditResult::Allowed
        } else {
            log::warn!(
                "Denied {action:?} of {resource_id} for {user_id}: {}",
                decision.reason
            );
            AuditResult::Denied
        };

        self.audit.record(
            user_id,
            user_id,
            Some(resource_id),
            action,
            result,
            decision.reason,
            caller,
        )?;
        Ok(decision)
    }

    /// [`check_access`](Self::check_access), turning a denial into an error.
    pub fn require(
        &self,
        user_id: Uuid,
        resource_id: Uuid,
        action: AuditAction,
        caller: &CallerMeta,
    ) -> Result<(), EditError> {
        let decision = self.check_access(user_id, resource_id, action, caller)?;
        if decision.allowed {
            Ok(())
        } else {
            Err(EditError::denied(decision.reason))
        }
    }

    fn decide(&self, user_id: Uuid, resource_id: Uuid, owner_id: Uuid) -> Result<Decision, EditError> {
        let now = self.store.now();

        if let Some(global) = self.store.access_record(user_id, None)? {
            if global.denies_at(now) {
                return Ok(Decision::deny(REASON_USER_REVOKED));
            }
        }

        let scoped = self.store.access_record(user_id, Some(resource_id))?;
        if let Some(record) = &scoped {
            if record.denies_at(now) {
                return Ok(Decision::deny(REASON_RESOURCE_REVOKED));
            }
        }

        if owner_id == user_id {
            return Ok(Decision::allow(REASON_OWNER));
        }
        match scoped {
            Some(record) if record.shared => Ok(Decision::allow(REASON_GRANTED)),
            _ => Ok(Decision::deny(REASON_NOT_SHARED)),
        }
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Revoke a user globally or for one resource.
    pub fn revoke(&self, req: Revocation, caller: &CallerMeta) -> Result<AccessRecord, EditError> {
        let reason = req.reason.trim();
        if reason.is_empty() {
            return Err(EditError::Validation("revocation reason is required".into()));
        }
        let now = self.store.now();
        if req.expires_at.is_some_and(|t| t <= now) {
            return Err(EditError::Validation("expiry must be in the future".into()));
        }
        if let Some(resource_id) = req.resource_id {
            self.ensure_document(resource_id)?;
        }

        let prior = self.store.access_record(req.user_id, req.resource_id)?;
        let record = AccessRecord {
            user_id: req.user_id,
            resource_id: req.resource_id,
            granted: false,
            shared: prior.as_ref().is_some_and(|p| p.shared),
            revoked_at: Some(now),
            revoked_by: Some(req.admin_id),
            reason: reason.to_string(),
            temporary: req.expires_at.is_some(),
            expires_at: req.expires_at,
            restored_at: prior.as_ref().and_then(|p| p.restored_at),
            restored_by: prior.as_ref().and_then(|p| p.restored_by),
        };
        self.store.put_access_record(&record)?;
        self.audit.record(
            req.admin_id,
            req.user_id,
            req.resource_id,
            AuditAction::Revoke,
            AuditResult::Applied,
            reason,
            caller,
        )?;
        log::info!(
            "Revoked {} on {} by {} ({reason})",
            req.user_id,
            scope_label(req.resource_id),
            req.admin_id
        );
        Ok(record)
    }

    /// Supersede a revocation with an explicit restoration.
    pub fn restore(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        resource_id: Option<Uuid>,
        reason: &str,
        caller: &CallerMeta,
    ) -> Result<AccessRecord, EditError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EditError::Validation("restoration reason is required".into()));
        }
        let prior = self
            .store
            .access_record(user_id, resource_id)?
            .ok_or_else(|| {
                EditError::NotFound(format!("no access record for {user_id} on {}", scope_label(resource_id)))
            })?;

        let record = AccessRecord {
            granted: true,
            temporary: false,
            expires_at: None,
            restored_at: Some(self.store.now()),
            restored_by: Some(admin_id),
            reason: reason.to_string(),
            ..prior
        };
        self.store.put_access_record(&record)?;
        self.audit.record(
            admin_id,
            user_id,
            resource_id,
            AuditAction::Restore,
            AuditResult::Applied,
            reason,
            caller,
        )?;
        log::info!("Restored {user_id} on {} by {admin_id}", scope_label(resource_id));
        Ok(record)
    }

    /// Share a resource with a user who does not own it.
    pub fn grant(
        &self,
        granted_by: Uuid,
        user_id: Uuid,
        resource_id: Uuid,
        caller: &CallerMeta,
    ) -> Result<AccessRecord, EditError> {
        self.ensure_document(resource_id)?;
        let now = self.store.now();
        let record = match self.store.access_record(user_id, Some(resource_id))? {
            // An active revocation needs an explicit restore
            Some(existing) if existing.denies_at(now) => {
                return Err(EditError::Validation(format!(
                    "{user_id} is revoked on {resource_id}; restore instead"
                )))
            }
            Some(existing) => AccessRecord {
                granted: true,
                shared: true,
                ..existing
            },
            None => AccessRecord {
                user_id,
                resource_id: Some(resource_id),
                granted: true,
                shared: true,
                revoked_at: None,
                revoked_by: None,
                reason: "shared".to_string(),
                temporary: false,
                expires_at: None,
                restored_at: None,
                restored_by: None,
            },
        };
        self.store.put_access_record(&record)?;
        self.audit.record(
            granted_by,
            user_id,
            Some(resource_id),
            AuditAction::Grant,
            AuditResult::Applied,
            "shared",
            caller,
        )?;
        Ok(record)
    }

    fn ensure_document(&self, resource_id: Uuid) -> Result<(), EditError> {
        match self.store.document(resource_id)? {
            Some(_) => Ok(()),
            None => Err(EditError::NotFound(format!("document {resource_id}"))),
        }
    }
}

fn scope_label(resource_id: Option<Uuid>) -> String {
    match resource_id {
        Some(id) => id.to_string(),
        None => "all resources".to_string(),
    }
}
