//! Archival of revision content to durable object storage.
//!
//! Runs on session end (synchronously, under a time budget), on export, and
//! from the janitor's reconcile pass. A failed archival never rolls back the
//! revision: the row is flagged `archive_pending` and retried later.

use std::sync::Arc;
use std::time::Duration;

use folio_store::{
    archive_key, ArchiveError, ArchiveStore, DocumentStore, Revision, RevisionRef, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::EditError;

/// Archival of one revision failed. The revision stays unarchived.
#[derive(Debug, Error)]
pub enum ArchivalFailure {
    #[error("archive write failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("store update failed: {0}")]
    Store(#[from] StoreError),

    #[error("archival exceeded its {0:?} budget")]
    TimedOut(Duration),

    #[error("archival task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    Archived { pointer: String },
    AlreadyArchived,
    /// Content was evicted before archival could copy it
    NothingToArchive,
}

/// Where readable content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    Primary,
    Archive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub archived: usize,
    pub failed: usize,
    pub evicted: usize,
}

pub struct Archiver {
    store: Arc<DocumentStore>,
    archive: Arc<dyn ArchiveStore>,
}

impl Archiver {
    pub fn new(store: Arc<DocumentStore>, archive: Arc<dyn ArchiveStore>) -> Self {
        Self { store, archive }
    }

    /// Copy one revision's content to the archive and record the pointer.
    ///
    /// On failure the revision is flagged pending for the reconciler.
    pub fn archive_revision(&self, doc_id: Uuid, number: u64) -> Result<ArchiveStatus, ArchivalFailure> {
        let result = self.try_archive(doc_id, number);
        if let Err(e) = &result {
            log::warn!("Archival of {doc_id}#{number} failed: {e}");
            self.flag_pending(doc_id, number);
        }
        result
    }

    fn try_archive(&self, doc_id: Uuid, number: u64) -> Result<ArchiveStatus, ArchivalFailure> {
        let rev = self
            .store
            .revision(doc_id, number)?
            .ok_or(StoreError::RevisionNotFound { doc_id, number })?;
        if rev.is_archived {
            return Ok(ArchiveStatus::AlreadyArchived);
        }
        if rev.content_evicted {
            return Ok(ArchiveStatus::NothingToArchive);
        }

        let pointer = self.archive.put(&archive_key(&rev), rev.content.as_bytes())?;
        self.store.mark_archived(doc_id, number, &pointer)?;
        log::debug!("Archived {doc_id}#{number} to {pointer}");
        Ok(ArchiveStatus::Archived { pointer })
    }

    fn flag_pending(&self, doc_id: Uuid, number: u64) {
        if let Err(e) = self.store.mark_archive_pending(doc_id, number) {
            log::error!("Could not flag {doc_id}#{number} for archival retry: {e}");
        }
    }

    /// [`archive_revision`](Self::archive_revision) on the blocking pool,
    /// abandoned after `budget`. An abandoned archival is flagged pending; the
    /// blocking write may still finish and record its pointer.
    pub async fn archive_within(
        self: &Arc<Self>,
        doc_id: Uuid,
        number: u64,
        budget: Duration,
    ) -> Result<ArchiveStatus, ArchivalFailure> {
        let this = self.clone();
        let task = tokio::task::spawn_blocking(move || this.archive_revision(doc_id, number));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                self.flag_pending(doc_id, number);
                Err(ArchivalFailure::Task(join.to_string()))
            }
            Err(_) => {
                log::warn!("Archival of {doc_id}#{number} exceeded {budget:?}, deferring");
                self.flag_pending(doc_id, number);
                Err(ArchivalFailure::TimedOut(budget))
            }
        }
    }

    /// Archive every candidate: pending retries plus superseded revisions
    /// created before `older_than`.
    pub fn reconcile(&self, older_than: u64) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        for RevisionRef { doc_id, number, .. } in self.store.archive_candidates(older_than)? {
            match self.archive_revision(doc_id, number) {
                Ok(ArchiveStatus::Archived { .. }) => report.archived += 1,
                Ok(_) => {}
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Drop inline content of archived revisions last touched before
    /// `older_than`. Current revisions are never evicted.
    pub fn evict(&self, older_than: u64) -> Result<usize, StoreError> {
        let mut evicted = 0;
        for RevisionRef { doc_id, number, .. } in self.store.eviction_candidates(older_than)? {
            match self.store.evict_content(doc_id, number) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(evicted)
    }

    /// Readable content of a revision, from the row or from the archive.
    pub fn read_content(&self, rev: &Revision) -> Result<(String, ContentSource), EditError> {
        if !rev.content_evicted {
            return Ok((rev.content.clone(), ContentSource::Primary));
        }
        let pointer = rev.archive_pointer.as_deref().ok_or_else(|| {
            EditError::NotFound(format!("archived content of {}#{}", rev.doc_id, rev.number))
        })?;
        let bytes = self.archive.get(pointer).map_err(|e| {
            log::error!("Archive read of {pointer} failed: {e}");
            EditError::NotFound(format!("archived content at {pointer}"))
        })?;
        let content = String::from_utf8(bytes)
            .map_err(|e| EditError::Validation(format!("archived content is not UTF-8: {e}")))?;
        Ok((content, ContentSource::Archive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_store::{
        EditDecision, EditInput, EditReason, EditSession, FsArchive, ManualClock,
        ParentDocumentResolver, StoreConfig,
    };
    use tempfile::TempDir;

    /// Archive that refuses every write.
    struct BrokenArchive;

    impl ArchiveStore for BrokenArchive {
        fn put(&self, _key: &str, _bytes: &[u8]) -> Result<String, ArchiveError> {
            Err(ArchiveError::Unavailable("offline".into()))
        }

        fn get(&self, pointer: &str) -> Result<Vec<u8>, ArchiveError> {
            Err(ArchiveError::InvalidPointer(pointer.into()))
        }
    }

    fn open(dir: &TempDir) -> (Arc<DocumentStore>, Arc<ManualClock>, Uuid) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(
            DocumentStore::open_with(
                StoreConfig::for_testing(dir.path().join("db")),
                clock.clone(),
                Arc::new(ParentDocumentResolver),
            )
            .unwrap(),
        );
        let doc = Uuid::new_v4();
        let owner = Uuid::new_v4();
        store.register_document(doc, owner, "t").unwrap();
        store.ingest_initial_revision(doc, owner, "original text").unwrap();

        let session = EditSession {
            token: Uuid::new_v4(),
            doc_id: doc,
            user_id: owner,
            started_at: 1_000,
            last_activity: 1_000,
            ended_at: None,
            revision_count: 0,
            edit_count: 0,
            last_revision: None,
            outcome: None,
        };
        let token = session.token;
        store.insert_session(session).unwrap();
        store
            .apply_edit(
                &EditInput {
                    doc_id: doc,
                    session_id: token,
                    editor_id: owner,
                    content: "edited".into(),
                    reason: EditReason::Manual,
                },
                |_| EditDecision::Create,
            )
            .unwrap();
        (store, clock, doc)
    }

    #[test]
    fn test_archive_then_read_back_after_eviction() {
        let dir = TempDir::new().unwrap();
        let (store, clock, doc) = open(&dir);
        let archive = Arc::new(FsArchive::open(dir.path().join("archive")).unwrap());
        let archiver = Archiver::new(store.clone(), archive);

        let status = archiver.archive_revision(doc, 0).unwrap();
        assert!(matches!(status, ArchiveStatus::Archived { .. }));
        assert_eq!(archiver.archive_revision(doc, 0).unwrap(), ArchiveStatus::AlreadyArchived);

        clock.advance_secs(1);
        assert_eq!(archiver.evict(store.now()).unwrap(), 1);

        let rev = store.revision(doc, 0).unwrap().unwrap();
        let (content, source) = archiver.read_content(&rev).unwrap();
        assert_eq!(content, "original text");
        assert_eq!(source, ContentSource::Archive);
    }

    #[test]
    fn test_failure_flags_pending() {
        let dir = TempDir::new().unwrap();
        let (store, _, doc) = open(&dir);
        let archiver = Archiver::new(store.clone(), Arc::new(BrokenArchive));

        assert!(archiver.archive_revision(doc, 1).is_err());
        let rev = store.revision(doc, 1).unwrap().unwrap();
        assert!(rev.archive_pending);
        assert!(!rev.is_archived);

        // pending revisions are retried regardless of age
        let report = archiver.reconcile(0).unwrap();
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_reconcile_archives_superseded() {
        let dir = TempDir::new().unwrap();
        let (store, clock, doc) = open(&dir);
        let archive = Arc::new(FsArchive::open(dir.path().join("archive")).unwrap());
        let archiver = Archiver::new(store.clone(), archive);

        clock.advance_secs(10);
        let report = archiver.reconcile(store.now()).unwrap();
        assert_eq!(report.archived, 1);
        assert!(store.revision(doc, 0).unwrap().unwrap().is_archived);
        assert!(!store.revision(doc, 1).unwrap().unwrap().is_archived);
    }

    #[tokio::test]
    async fn test_archive_within_budget() {
        let dir = TempDir::new().unwrap();
        let (store, _, doc) = open(&dir);
        let archive = Arc::new(FsArchive::open(dir.path().join("archive")).unwrap());
        let archiver = Arc::new(Archiver::new(store.clone(), archive));

        let status = archiver
            .archive_within(doc, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(status, ArchiveStatus::Archived { .. }));
    }
}
