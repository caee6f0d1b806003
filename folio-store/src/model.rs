//! Row types persisted by the [`DocumentStore`](crate::DocumentStore).
//!
//! Rows are bincode-encoded (revision rows additionally LZ4-framed). The
//! change-channel row is JSON so that anything tailing the store can read it
//! without linking this crate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

// ─── Documents ────────────────────────────────────────────────────────

/// Ownership and numbering head for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub doc_id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub created_at: u64,
    /// Number of the revision with `is_current = true`. `None` until the
    /// upstream worker has written revision 0.
    pub current_revision: Option<u64>,
    /// Next revision number to hand out (previous max + 1).
    pub next_revision: u64,
}

// ─── Revisions ────────────────────────────────────────────────────────

/// Why a revision was created or last extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditReason {
    /// Written by the upstream extraction worker (revision 0 only)
    Upload,
    Autosave,
    Manual,
    /// Client accepted a crash-recovery payload
    Recovery,
    /// Final content delivered with the end-of-session signal
    SessionEnd,
    /// Explicit export / download of current content
    Export,
}

impl EditReason {
    /// Forced reasons always open a new revision regardless of elapsed time.
    pub fn is_forced(self) -> bool {
        matches!(self, EditReason::Export)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EditReason::Upload => "upload",
            EditReason::Autosave => "autosave",
            EditReason::Manual => "manual",
            EditReason::Recovery => "recovery",
            EditReason::SessionEnd => "session_end",
            EditReason::Export => "export",
        }
    }
}

/// Size of a content payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeMetrics {
    pub bytes: u64,
    pub chars: u64,
    pub words: u64,
}

impl SizeMetrics {
    pub fn measure(content: &str) -> Self {
        Self {
            bytes: content.len() as u64,
            chars: content.chars().count() as u64,
            words: content.split_whitespace().count() as u64,
        }
    }
}

/// One saved state of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Stable identifier carried by change events
    pub id: Uuid,
    pub doc_id: Uuid,
    pub number: u64,
    pub content: String,
    pub metrics: SizeMetrics,
    pub editor_id: Uuid,
    pub created_at: u64,
    /// Advances on every in-place update
    pub updated_at: u64,
    pub reason: EditReason,
    pub session_id: Option<Uuid>,
    pub is_current: bool,
    pub is_archived: bool,
    pub archive_pointer: Option<String>,
    /// Archival was attempted and failed; the janitor retries it
    pub archive_pending: bool,
    /// Inline content was dropped after archival; read through the archive
    pub content_evicted: bool,
    /// Number of in-place updates applied since creation
    pub update_count: u64,
}

impl Revision {
    /// Revisions that must never be extended in place.
    pub fn is_sealed(&self) -> bool {
        self.number == 0 || self.reason.is_forced()
    }

    pub fn to_ref(&self) -> RevisionRef {
        RevisionRef {
            id: self.id,
            doc_id: self.doc_id,
            number: self.number,
        }
    }
}

/// Lightweight handle returned by the edit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRef {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub number: u64,
}

// ─── Edit sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Abandoned,
    TimedOut,
}

/// One continuous editing interaction of a user with a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSession {
    pub token: Uuid,
    pub doc_id: Uuid,
    pub user_id: Uuid,
    pub started_at: u64,
    pub last_activity: u64,
    pub ended_at: Option<u64>,
    /// Revisions this session created
    pub revision_count: u64,
    /// Accepted edits (creates and in-place updates)
    pub edit_count: u64,
    /// Most recent revision this session produced or extended
    pub last_revision: Option<u64>,
    pub outcome: Option<SessionOutcome>,
}

impl EditSession {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ─── Change events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Revision,
    Session,
    Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// Identifier-only notification that a row changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub id: Uuid,
    pub owner_id: Uuid,
    pub emitted_at: u64,
}

/// A change event as read back from the change channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub seq: u64,
    pub event: ChangeEvent,
}

// ─── Access control ───────────────────────────────────────────────────

/// Whether a user may read one resource (or, with `resource_id = None`,
/// any resource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub user_id: Uuid,
    pub resource_id: Option<Uuid>,
    pub granted: bool,
    /// Set only by an explicit share. Revocation and restoration carry it over.
    #[serde(default)]
    pub shared: bool,
    pub revoked_at: Option<u64>,
    pub revoked_by: Option<Uuid>,
    pub reason: String,
    pub temporary: bool,
    pub expires_at: Option<u64>,
    pub restored_at: Option<u64>,
    pub restored_by: Option<Uuid>,
}

impl AccessRecord {
    pub fn is_global(&self) -> bool {
        self.resource_id.is_none()
    }

    /// A temporary revocation stops applying once `now >= expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.temporary && self.expires_at.is_some_and(|t| now >= t)
    }

    /// Revocation that still applies at `now`.
    pub fn denies_at(&self, now: u64) -> bool {
        !self.granted && !self.is_expired(now)
    }
}

// ─── Audit ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Read,
    Edit,
    Grant,
    Revoke,
    Restore,
    CloseSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Allowed,
    Denied,
    Applied,
}

/// Append-only audit row. Identifiers are plain values: the referenced user
/// or document may be deleted while its history stays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Assigned by the store on append
    pub seq: u64,
    pub actor_id: Uuid,
    pub subject_id: Uuid,
    pub resource_id: Option<Uuid>,
    pub action: AuditAction,
    pub result: AuditResult,
    pub reason: String,
    pub caller_ip: Option<String>,
    pub caller_agent: Option<String>,
    pub at: u64,
}

// ─── Row codecs ───────────────────────────────────────────────────────

pub(crate) fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(row)
}

/// Revision rows carry content, so they are LZ4-framed on top of bincode.
pub(crate) fn encode_revision(rev: &Revision) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode_row(rev)?))
}

pub(crate) fn decode_revision(bytes: &[u8]) -> Result<Revision, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode_row(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_revision() -> Revision {
        Revision {
            id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            number: 3,
            content: "hello world ".repeat(64),
            metrics: SizeMetrics::measure("hello world"),
            editor_id: Uuid::new_v4(),
            created_at: 10,
            updated_at: 20,
            reason: EditReason::Autosave,
            session_id: Some(Uuid::new_v4()),
            is_current: true,
            is_archived: false,
            archive_pointer: None,
            archive_pending: false,
            content_evicted: false,
            update_count: 2,
        }
    }

    #[test]
    fn test_size_metrics() {
        let m = SizeMetrics::measure("héllo  wide world");
        assert_eq!(m.bytes, 18);
        assert_eq!(m.chars, 17);
        assert_eq!(m.words, 3);
    }

    #[test]
    fn test_revision_row_is_compressed() {
        let rev = sample_revision();
        let encoded = encode_revision(&rev).unwrap();
        assert!(encoded.len() < rev.content.len());
        assert_eq!(decode_revision(&encoded).unwrap(), rev);
    }

    #[test]
    fn test_sealed_revisions() {
        let mut rev = sample_revision();
        assert!(!rev.is_sealed());
        rev.reason = EditReason::Export;
        assert!(rev.is_sealed());
        rev.reason = EditReason::Upload;
        rev.number = 0;
        assert!(rev.is_sealed());
    }

    #[test]
    fn test_change_event_json_shape() {
        let event = ChangeEvent {
            entity: EntityKind::Revision,
            op: ChangeOp::Update,
            id: Uuid::nil(),
            owner_id: Uuid::nil(),
            emitted_at: 5,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["entity"], "revision");
        assert_eq!(json["op"], "update");
        assert!(json.get("ownerId").is_some());
        assert_eq!(json["emittedAt"], 5);
    }

    #[test]
    fn test_access_record_expiry() {
        let rec = AccessRecord {
            user_id: Uuid::new_v4(),
            resource_id: None,
            granted: false,
            shared: false,
            revoked_at: Some(0),
            revoked_by: None,
            reason: "abuse".into(),
            temporary: true,
            expires_at: Some(1_000),
            restored_at: None,
            restored_by: None,
        };
        assert!(rec.denies_at(999));
        assert!(!rec.denies_at(1_000));
        assert!(!rec.denies_at(5_000));
    }
}
