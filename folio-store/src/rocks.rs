//! RocksDB-backed revision store.
//!
//! Column families:
//! - `documents`: ownership and numbering head per document
//! - `revisions`: revision rows keyed by `doc_id:number` (LZ4 framed)
//! - `sessions` : edit session rows keyed by session token
//! - `access`   : access control records keyed by `user_id:resource_id`
//! - `audit`    : append-only audit entries keyed by sequence number
//! - `changes`  : storage change channel, keyed by sequence number (JSON)
//!
//! The database is opened as an optimistic transaction DB. Every mutation is
//! one transaction: rows read with `get_for_update` are version-checked at
//! commit, so two writers racing on the same session or revision row cannot
//! both commit. The loser sees [`StoreError::Conflict`] and re-reads.
//!
//! Reference: Kleppmann: DDIA, Chapter 7 (Transactions, lost updates)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    Direction, IteratorMode, OptimisticTransactionDB, Options, SingleThreaded, Transaction,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::model::{
    decode_revision, decode_row, encode_revision, encode_row, AccessRecord, AuditEntry,
    ChangeOp, ChangeRecord, DocumentRecord, EditReason, EditSession, EntityKind, Revision,
    RevisionRef, SessionOutcome, SizeMetrics,
};
use crate::notify::{
    change_key, parse_change_row, ChangeFeed, MutationNotifier, NotifierStats, OwnerRef,
    OwnerResolver, ParentDocumentResolver, ParentLookup, PendingChange,
};

/// Column family names.
pub(crate) const CF_DOCUMENTS: &str = "documents";
pub(crate) const CF_REVISIONS: &str = "revisions";
pub(crate) const CF_SESSIONS: &str = "sessions";
pub(crate) const CF_ACCESS: &str = "access";
pub(crate) const CF_AUDIT: &str = "audit";
pub(crate) const CF_CHANGES: &str = "changes";

/// All column family names for initialization.
pub(crate) const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_REVISIONS,
    CF_SESSIONS,
    CF_ACCESS,
    CF_AUDIT,
    CF_CHANGES,
];

type Db = OptimisticTransactionDB<SingleThreaded>;
type Txn<'a> = Transaction<'a, Db>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Input to [`DocumentStore::apply_edit`].
#[derive(Debug, Clone)]
pub struct EditInput {
    pub doc_id: Uuid,
    pub session_id: Uuid,
    pub editor_id: Uuid,
    pub content: String,
    pub reason: EditReason,
}

/// Rows visible to the snapshot policy while an edit transaction is open.
#[derive(Debug)]
pub struct EditContext<'a> {
    pub document: &'a DocumentRecord,
    pub session: &'a EditSession,
    /// The session's most recently produced revision, if it still exists
    pub latest: Option<&'a Revision>,
    pub reason: EditReason,
    pub now: u64,
}

/// What an edit does to the revision history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditDecision {
    /// Update the session's latest revision in place
    Extend,
    /// Open a new current revision
    Create,
}

/// Result of an applied edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditOutcome {
    pub revision: RevisionRef,
    pub created: bool,
    /// Revision that stopped being current because of this edit
    pub superseded: Option<u64>,
}

/// Result of inserting a session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInsert {
    Created(EditSession),
    /// A row with this token already exists; nothing was written
    Existing(EditSession),
}

/// Result of ending a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Ended(EditSession),
    /// The session had already ended; nothing was written
    AlreadyEnded(EditSession),
}

/// Audit query filter. Entries come back newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub subject_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub limit: usize,
}

/// RocksDB-backed document store.
///
/// Holds documents, revisions, edit sessions, access records and the audit
/// log. All mutations pass through the [`MutationNotifier`], which writes an
/// identifier-only change row into the same transaction.
pub struct DocumentStore {
    db: Db,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    notifier: MutationNotifier,
    /// Next change-channel sequence number
    change_seq: AtomicU64,
    /// Next audit sequence number
    audit_seq: AtomicU64,
    /// Orders "allocate change seq + commit" so the channel is gap-free in
    /// commit order. Held only across the commit call itself.
    commit_guard: Mutex<()>,
}

impl DocumentStore {
    /// Open the store with the system clock and the default owner resolver.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(config, Arc::new(SystemClock), Arc::new(ParentDocumentResolver))
    }

    /// Open the store with an explicit clock and owner resolver.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open_with(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn OwnerResolver>,
    ) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db: Db = OptimisticTransactionDB::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let change_seq = Self::recover_sequence(&db, CF_CHANGES);
        let audit_seq = Self::recover_sequence(&db, CF_AUDIT);
        log::info!(
            "Opened store at {} (change seq {change_seq}, audit seq {audit_seq})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            clock,
            notifier: MutationNotifier::new(resolver),
            change_seq: AtomicU64::new(change_seq),
            audit_seq: AtomicU64::new(audit_seq),
            commit_guard: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_REVISIONS => {
                // Rows are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_DOCUMENTS | CF_SESSIONS | CF_ACCESS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_AUDIT | CF_CHANGES => {
                // Sequential appends, sequential reads
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number from a sequence-keyed column family.
    fn recover_sequence(db: &Db, cf_name: &str) -> u64 {
        let Some(cf) = db.cf_handle(cf_name) else {
            return 0;
        };
        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Register a new document owned by `owner_id`.
    pub fn register_document(
        &self,
        doc_id: Uuid,
        owner_id: Uuid,
        title: impl Into<String>,
    ) -> Result<DocumentRecord, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let txn = self.db.transaction();
        if txn_get::<DocumentRecord>(&txn, cf_docs, doc_id.as_bytes())?.is_some() {
            return Err(StoreError::Invalid(format!("document {doc_id} already exists")));
        }

        let record = DocumentRecord {
            doc_id,
            owner_id,
            title: title.into(),
            created_at: self.now(),
            current_revision: None,
            next_revision: 0,
        };
        txn.put_cf(cf_docs, doc_id.as_bytes(), encode_row(&record)?)?;

        let pending = vec![PendingChange::new(
            EntityKind::Document,
            ChangeOp::Create,
            doc_id,
            OwnerRef::Direct(owner_id),
        )];
        self.commit(txn, &pending)?;
        Ok(record)
    }

    pub fn document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        self.get_row(CF_DOCUMENTS, doc_id.as_bytes())
    }

    /// Delete a document and all of its revisions.
    ///
    /// Sessions, access records and audit entries that mention the document
    /// keep its identifier.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_revs = self.cf(CF_REVISIONS)?;
        let txn = self.db.transaction();
        let doc: DocumentRecord = txn_get(&txn, cf_docs, doc_id.as_bytes())?
            .ok_or(StoreError::DocumentNotFound(doc_id))?;

        // The parent row is gone after this transaction, so children name
        // their owner directly.
        let mut pending = Vec::new();
        for rev in self.list_revisions(doc_id)? {
            txn.delete_cf(cf_revs, revision_key(doc_id, rev.number))?;
            pending.push(PendingChange::new(
                EntityKind::Revision,
                ChangeOp::Delete,
                rev.id,
                OwnerRef::Direct(doc.owner_id),
            ));
        }
        txn.delete_cf(cf_docs, doc_id.as_bytes())?;
        pending.push(PendingChange::new(
            EntityKind::Document,
            ChangeOp::Delete,
            doc_id,
            OwnerRef::Direct(doc.owner_id),
        ));
        self.commit(txn, &pending)
    }

    // ─── Revisions ────────────────────────────────────────────────────

    /// Write revision 0 on behalf of the upstream extraction worker.
    pub fn ingest_initial_revision(
        &self,
        doc_id: Uuid,
        editor_id: Uuid,
        content: &str,
    ) -> Result<RevisionRef, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_revs = self.cf(CF_REVISIONS)?;
        let txn = self.db.transaction();
        let mut doc: DocumentRecord = txn_get(&txn, cf_docs, doc_id.as_bytes())?
            .ok_or(StoreError::DocumentNotFound(doc_id))?;
        if doc.next_revision != 0 {
            return Err(StoreError::Invalid(format!(
                "document {doc_id} already has revision 0"
            )));
        }

        let now = self.now();
        let rev = Revision {
            id: Uuid::new_v4(),
            doc_id,
            number: 0,
            content: content.to_string(),
            metrics: SizeMetrics::measure(content),
            editor_id,
            created_at: now,
            updated_at: now,
            reason: EditReason::Upload,
            session_id: None,
            is_current: true,
            is_archived: false,
            archive_pointer: None,
            archive_pending: false,
            content_evicted: false,
            update_count: 0,
        };
        txn.put_cf(cf_revs, revision_key(doc_id, 0), encode_revision(&rev)?)?;
        doc.current_revision = Some(0);
        doc.next_revision = 1;
        txn.put_cf(cf_docs, doc_id.as_bytes(), encode_row(&doc)?)?;

        let pending = vec![
            PendingChange::new(
                EntityKind::Revision,
                ChangeOp::Create,
                rev.id,
                OwnerRef::Document(doc_id),
            ),
            PendingChange::new(
                EntityKind::Document,
                ChangeOp::Update,
                doc_id,
                OwnerRef::Direct(doc.owner_id),
            ),
        ];
        self.commit(txn, &pending)?;
        Ok(rev.to_ref())
    }

    /// Apply one edit as a single version-checked transaction.
    ///
    /// `decide` sees the session, the document head and the session's latest
    /// revision as read inside the transaction and chooses between extending
    /// that revision and opening a new one. Returns [`StoreError::Conflict`]
    /// if another writer committed to any of those rows first.
    pub fn apply_edit<F>(&self, input: &EditInput, decide: F) -> Result<EditOutcome, StoreError>
    where
        F: FnOnce(&EditContext<'_>) -> EditDecision,
    {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_revs = self.cf(CF_REVISIONS)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let txn = self.db.transaction();
        let now = self.now();

        let mut session: EditSession = txn_get(&txn, cf_sessions, input.session_id.as_bytes())?
            .ok_or(StoreError::SessionNotFound(input.session_id))?;
        if session.doc_id != input.doc_id {
            return Err(StoreError::Invalid(format!(
                "session {} belongs to another document",
                input.session_id
            )));
        }
        if session.user_id != input.editor_id {
            return Err(StoreError::Invalid(format!(
                "session {} belongs to another user",
                input.session_id
            )));
        }
        if !session.is_open() {
            return Err(StoreError::Invalid(format!(
                "session {} has ended",
                input.session_id
            )));
        }

        let mut doc: DocumentRecord = txn_get(&txn, cf_docs, input.doc_id.as_bytes())?
            .ok_or(StoreError::DocumentNotFound(input.doc_id))?;
        if doc.current_revision.is_none() {
            return Err(StoreError::Invalid(format!(
                "document {} has no extracted revision yet",
                input.doc_id
            )));
        }

        let latest = match session.last_revision {
            Some(number) => txn_get_revision(&txn, cf_revs, input.doc_id, number)?,
            None => None,
        };

        let decision = decide(&EditContext {
            document: &doc,
            session: &session,
            latest: latest.as_ref(),
            reason: input.reason,
            now,
        });

        let metrics = SizeMetrics::measure(&input.content);
        let mut pending = Vec::new();
        let outcome = match (decision, latest) {
            (EditDecision::Extend, Some(mut rev)) => {
                rev.content = input.content.clone();
                rev.metrics = metrics;
                rev.updated_at = now;
                // `reason` stays the one that opened the revision
                rev.update_count += 1;
                // The archived copy no longer matches
                rev.is_archived = false;
                rev.archive_pointer = None;
                rev.content_evicted = false;
                txn.put_cf(cf_revs, revision_key(rev.doc_id, rev.number), encode_revision(&rev)?)?;
                pending.push(PendingChange::new(
                    EntityKind::Revision,
                    ChangeOp::Update,
                    rev.id,
                    OwnerRef::Document(rev.doc_id),
                ));

                session.edit_count += 1;
                EditOutcome {
                    revision: rev.to_ref(),
                    created: false,
                    superseded: None,
                }
            }
            _ => {
                let superseded = doc.current_revision;
                if let Some(prior) = superseded {
                    if let Some(mut old) = txn_get_revision(&txn, cf_revs, input.doc_id, prior)? {
                        old.is_current = false;
                        txn.put_cf(cf_revs, revision_key(old.doc_id, old.number), encode_revision(&old)?)?;
                        pending.push(PendingChange::new(
                            EntityKind::Revision,
                            ChangeOp::Update,
                            old.id,
                            OwnerRef::Document(old.doc_id),
                        ));
                    }
                }

                let number = doc.next_revision;
                let rev = Revision {
                    id: Uuid::new_v4(),
                    doc_id: input.doc_id,
                    number,
                    content: input.content.clone(),
                    metrics,
                    editor_id: input.editor_id,
                    created_at: now,
                    updated_at: now,
                    reason: input.reason,
                    session_id: Some(input.session_id),
                    is_current: true,
                    is_archived: false,
                    archive_pointer: None,
                    archive_pending: false,
                    content_evicted: false,
                    update_count: 0,
                };
                txn.put_cf(cf_revs, revision_key(input.doc_id, number), encode_revision(&rev)?)?;
                pending.push(PendingChange::new(
                    EntityKind::Revision,
                    ChangeOp::Create,
                    rev.id,
                    OwnerRef::Document(input.doc_id),
                ));

                doc.current_revision = Some(number);
                doc.next_revision = number + 1;
                txn.put_cf(cf_docs, input.doc_id.as_bytes(), encode_row(&doc)?)?;
                pending.push(PendingChange::new(
                    EntityKind::Document,
                    ChangeOp::Update,
                    doc.doc_id,
                    OwnerRef::Direct(doc.owner_id),
                ));

                session.revision_count += 1;
                session.edit_count += 1;
                session.last_revision = Some(number);
                EditOutcome {
                    revision: rev.to_ref(),
                    created: true,
                    superseded,
                }
            }
        };

        session.last_activity = now;
        txn.put_cf(cf_sessions, session.token.as_bytes(), encode_row(&session)?)?;
        pending.push(PendingChange::new(
            EntityKind::Session,
            ChangeOp::Update,
            session.token,
            OwnerRef::Direct(session.user_id),
        ));

        self.commit(txn, &pending)?;
        Ok(outcome)
    }

    pub fn revision(&self, doc_id: Uuid, number: u64) -> Result<Option<Revision>, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        match self.db.get_cf(cf, revision_key(doc_id, number))? {
            Some(bytes) => Ok(Some(decode_revision(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The document's current revision.
    pub fn current_revision(&self, doc_id: Uuid) -> Result<Revision, StoreError> {
        let doc = self
            .document(doc_id)?
            .ok_or(StoreError::DocumentNotFound(doc_id))?;
        let number = doc
            .current_revision
            .ok_or(StoreError::RevisionNotFound { doc_id, number: 0 })?;
        self.revision(doc_id, number)?
            .ok_or(StoreError::RevisionNotFound { doc_id, number })
    }

    /// All revisions of a document in number order.
    pub fn list_revisions(&self, doc_id: Uuid) -> Result<Vec<Revision>, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        let start = revision_key(doc_id, 0);
        let mut revisions = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            revisions.push(decode_revision(&value)?);
        }
        Ok(revisions)
    }

    /// Record a successful archival of a revision's content.
    pub fn mark_archived(
        &self,
        doc_id: Uuid,
        number: u64,
        pointer: &str,
    ) -> Result<(), StoreError> {
        self.update_revision(doc_id, number, |rev| {
            rev.is_archived = true;
            rev.archive_pointer = Some(pointer.to_string());
            rev.archive_pending = false;
        })
    }

    /// Flag a revision whose archival failed so the reconciler retries it.
    pub fn mark_archive_pending(&self, doc_id: Uuid, number: u64) -> Result<(), StoreError> {
        self.update_revision(doc_id, number, |rev| {
            rev.archive_pending = true;
        })
    }

    /// Drop the inline content of an archived, superseded revision.
    pub fn evict_content(&self, doc_id: Uuid, number: u64) -> Result<bool, StoreError> {
        let rev = self
            .revision(doc_id, number)?
            .ok_or(StoreError::RevisionNotFound { doc_id, number })?;
        if !rev.is_archived || rev.is_current || rev.content_evicted {
            return Ok(false);
        }
        self.update_revision(doc_id, number, |rev| {
            rev.content = String::new();
            rev.content_evicted = true;
        })?;
        Ok(true)
    }

    /// Raw flag write on a revision row, bypassing the snapshot policy.
    ///
    /// This is the administrative repair path; it maintains no invariants.
    pub fn set_current_flag(
        &self,
        doc_id: Uuid,
        number: u64,
        is_current: bool,
    ) -> Result<(), StoreError> {
        self.update_revision(doc_id, number, |rev| {
            rev.is_current = is_current;
        })
    }

    /// Revisions the archival pass should copy to durable storage: anything
    /// flagged pending, plus superseded revisions created before `older_than`.
    pub fn archive_candidates(&self, older_than: u64) -> Result<Vec<RevisionRef>, StoreError> {
        self.scan_revisions(|rev| {
            !rev.is_archived && (rev.archive_pending || (!rev.is_current && rev.created_at < older_than))
        })
    }

    /// Archived, superseded revisions last touched before `older_than` that
    /// still hold inline content.
    pub fn eviction_candidates(&self, older_than: u64) -> Result<Vec<RevisionRef>, StoreError> {
        self.scan_revisions(|rev| {
            rev.is_archived && !rev.is_current && !rev.content_evicted && rev.updated_at < older_than
        })
    }

    fn scan_revisions<P>(&self, predicate: P) -> Result<Vec<RevisionRef>, StoreError>
    where
        P: Fn(&Revision) -> bool,
    {
        let cf = self.cf(CF_REVISIONS)?;
        let mut refs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let rev = decode_revision(&value)?;
            if predicate(&rev) {
                refs.push(rev.to_ref());
            }
        }
        Ok(refs)
    }

    fn update_revision<F>(&self, doc_id: Uuid, number: u64, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Revision),
    {
        let cf = self.cf(CF_REVISIONS)?;
        let txn = self.db.transaction();
        let mut rev = txn_get_revision(&txn, cf, doc_id, number)?
            .ok_or(StoreError::RevisionNotFound { doc_id, number })?;
        mutate(&mut rev);
        txn.put_cf(cf, revision_key(doc_id, number), encode_revision(&rev)?)?;
        let pending = vec![PendingChange::new(
            EntityKind::Revision,
            ChangeOp::Update,
            rev.id,
            OwnerRef::Document(doc_id),
        )];
        self.commit(txn, &pending)
    }

    // ─── Edit sessions ────────────────────────────────────────────────

    /// Insert a session row unless one with the same token exists.
    pub fn insert_session(&self, session: EditSession) -> Result<SessionInsert, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let txn = self.db.transaction();
        if let Some(existing) = txn_get::<EditSession>(&txn, cf_sessions, session.token.as_bytes())? {
            return Ok(SessionInsert::Existing(existing));
        }
        if txn_get::<DocumentRecord>(&txn, cf_docs, session.doc_id.as_bytes())?.is_none() {
            return Err(StoreError::DocumentNotFound(session.doc_id));
        }

        txn.put_cf(cf_sessions, session.token.as_bytes(), encode_row(&session)?)?;
        let pending = vec![PendingChange::new(
            EntityKind::Session,
            ChangeOp::Create,
            session.token,
            OwnerRef::Direct(session.user_id),
        )];
        self.commit(txn, &pending)?;
        Ok(SessionInsert::Created(session))
    }

    pub fn session(&self, token: Uuid) -> Result<Option<EditSession>, StoreError> {
        self.get_row(CF_SESSIONS, token.as_bytes())
    }

    /// Advance a session's last-activity time.
    pub fn touch_session(&self, token: Uuid) -> Result<EditSession, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let txn = self.db.transaction();
        let mut session: EditSession = txn_get(&txn, cf, token.as_bytes())?
            .ok_or(StoreError::SessionNotFound(token))?;
        if !session.is_open() {
            return Err(StoreError::Invalid(format!("session {token} has ended")));
        }
        session.last_activity = self.now();
        txn.put_cf(cf, token.as_bytes(), encode_row(&session)?)?;
        let pending = vec![PendingChange::new(
            EntityKind::Session,
            ChangeOp::Update,
            token,
            OwnerRef::Direct(session.user_id),
        )];
        self.commit(txn, &pending)?;
        Ok(session)
    }

    /// Close a session. Ending an ended session writes nothing.
    pub fn end_session(
        &self,
        token: Uuid,
        outcome: SessionOutcome,
    ) -> Result<SessionEnd, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let txn = self.db.transaction();
        let mut session: EditSession = txn_get(&txn, cf, token.as_bytes())?
            .ok_or(StoreError::SessionNotFound(token))?;
        if !session.is_open() {
            return Ok(SessionEnd::AlreadyEnded(session));
        }
        session.ended_at = Some(self.now());
        session.outcome = Some(outcome);
        txn.put_cf(cf, token.as_bytes(), encode_row(&session)?)?;
        let pending = vec![PendingChange::new(
            EntityKind::Session,
            ChangeOp::Update,
            token,
            OwnerRef::Direct(session.user_id),
        )];
        self.commit(txn, &pending)?;
        Ok(SessionEnd::Ended(session))
    }

    /// Open sessions whose last activity is strictly before `cutoff`.
    pub fn idle_sessions(&self, cutoff: u64) -> Result<Vec<EditSession>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut idle = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let session: EditSession = decode_row(&value)?;
            if session.is_open() && session.last_activity < cutoff {
                idle.push(session);
            }
        }
        Ok(idle)
    }

    // ─── Access control ───────────────────────────────────────────────

    /// Read an access record. `resource_id = None` is the global record.
    ///
    /// Always hits the database; there is deliberately no cache in front.
    pub fn access_record(
        &self,
        user_id: Uuid,
        resource_id: Option<Uuid>,
    ) -> Result<Option<AccessRecord>, StoreError> {
        self.get_row(CF_ACCESS, &access_key(user_id, resource_id))
    }

    pub fn put_access_record(&self, record: &AccessRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_ACCESS)?;
        let key = access_key(record.user_id, record.resource_id);
        let txn = self.db.transaction();
        let existed = txn.get_for_update_cf(cf, &key, true)?.is_some();
        txn.put_cf(cf, &key, encode_row(record)?)?;
        let op = if existed { ChangeOp::Update } else { ChangeOp::Create };
        let pending = vec![PendingChange::new(
            EntityKind::Access,
            op,
            record.resource_id.unwrap_or(record.user_id),
            OwnerRef::Direct(record.user_id),
        )];
        self.commit(txn, &pending)
    }

    // ─── Audit log ────────────────────────────────────────────────────

    /// Append an audit entry and return it with its assigned sequence.
    pub fn append_audit(&self, mut entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        entry.seq = self.audit_seq.fetch_add(1, Ordering::SeqCst);
        let txn = self.db.transaction();
        txn.put_cf(cf, entry.seq.to_be_bytes(), encode_row(&entry)?)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Audit entries matching `filter`, newest first.
    pub fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if entries.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let entry: AuditEntry = decode_row(&value)?;
            if filter.subject_id.is_some_and(|s| s != entry.subject_id) {
                continue;
            }
            if filter.resource_id.is_some() && filter.resource_id != entry.resource_id {
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    // ─── Change channel ───────────────────────────────────────────────

    /// Delete change rows older than the newest `keep` rows.
    pub fn prune_changes(&self, keep: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let next = self.change_seq.load(Ordering::SeqCst);
        let cutoff = next.saturating_sub(keep);
        if cutoff == 0 {
            return Ok(0);
        }

        let txn = self.db.transaction();
        let mut removed = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key[..] >= change_key(cutoff)[..] {
                break;
            }
            txn.delete_cf(cf, &key)?;
            removed += 1;
        }
        if removed > 0 {
            txn.commit()?;
        }
        Ok(removed)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Stage change rows and commit.
    ///
    /// The change rows ride in the same transaction as the writes they
    /// describe. Owner resolution failures only drop events.
    fn commit(&self, txn: Txn<'_>, pending: &[PendingChange]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let staged = {
            let parents = TxnParents { txn: &txn, cf: cf_docs };
            self.notifier.stage(pending, &parents, self.now())
        };

        let guard = self.commit_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let first = self.change_seq.load(Ordering::SeqCst);
        let mut written = 0u64;
        for (event, payload) in &staged {
            if let Err(e) = txn.put_cf(cf_changes, change_key(first + written), payload) {
                log::warn!("Dropping {:?} event for {}: {e}", event.entity, event.id);
                continue;
            }
            written += 1;
        }
        txn.commit()?;
        self.change_seq.store(first + written, Ordering::SeqCst);
        drop(guard);

        self.notifier.committed(written as usize);
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl ChangeFeed for DocumentStore {
    fn read_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let start = change_key(since);
        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            if records.len() >= limit {
                break;
            }
            let (key, value) = item?;
            records.push(parse_change_row(&key, &value)?);
        }
        Ok(records)
    }

    fn next_seq(&self) -> Result<u64, StoreError> {
        Ok(self.change_seq.load(Ordering::SeqCst))
    }

    fn wake_handle(&self) -> Option<Arc<Notify>> {
        Some(self.notifier.wake_handle())
    }
}

/// Parent lookups that see the transaction's own uncommitted writes.
struct TxnParents<'a, 'db> {
    txn: &'a Txn<'db>,
    cf: &'a ColumnFamily,
}

impl ParentLookup for TxnParents<'_, '_> {
    fn document_owner(&self, doc_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        match self.txn.get_cf(self.cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_row::<DocumentRecord>(&bytes)?.owner_id)),
            None => Ok(None),
        }
    }
}

/// Version-tracked read inside a transaction.
fn txn_get<T: DeserializeOwned>(
    txn: &Txn<'_>,
    cf: &ColumnFamily,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match txn.get_for_update_cf(cf, key, true)? {
        Some(bytes) => Ok(Some(decode_row(&bytes)?)),
        None => Ok(None),
    }
}

fn txn_get_revision(
    txn: &Txn<'_>,
    cf: &ColumnFamily,
    doc_id: Uuid,
    number: u64,
) -> Result<Option<Revision>, StoreError> {
    match txn.get_for_update_cf(cf, revision_key(doc_id, number), true)? {
        Some(bytes) => Ok(Some(decode_revision(&bytes)?)),
        None => Ok(None),
    }
}

/// Build a revision key: doc_id (16 bytes) + number (8 bytes big-endian).
fn revision_key(doc_id: Uuid, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Build an access key: user_id + resource_id (nil for the global record).
fn access_key(user_id: Uuid, resource_id: Option<Uuid>) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(resource_id.unwrap_or_else(Uuid::nil).as_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
