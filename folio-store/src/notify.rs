//! Mutation Notifier: the storage-layer trigger behind live updates.
//!
//! ```text
//!  store operation ──► Transaction ──┬── row writes
//!                                    └── change rows (CF "changes")  ◄── staged here
//!                                              │ commit (atomic)
//!                                              ▼
//!                         ChangeFeed::read_since ──► Notification Relay
//! ```
//!
//! Every mutating [`DocumentStore`](crate::DocumentStore) operation hands its
//! [`PendingChange`]s to the notifier before commit, whether it came from the
//! edit API or from an administrative tool. Events carry identifiers only.
//! An event whose owner cannot be resolved is dropped with a diagnostic; the
//! write it describes commits regardless.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ChangeEvent, ChangeOp, ChangeRecord, EntityKind};
use crate::rocks::{CF_CHANGES, COLUMN_FAMILIES};

/// How the owning user of a changed row is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRef {
    /// The row stores its owner directly.
    Direct(Uuid),
    /// The owner is the owner of this parent document (one hop).
    Document(Uuid),
}

/// A row change staged inside a store transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub id: Uuid,
    pub owner: OwnerRef,
}

impl PendingChange {
    pub fn new(entity: EntityKind, op: ChangeOp, id: Uuid, owner: OwnerRef) -> Self {
        Self {
            entity,
            op,
            id,
            owner,
        }
    }
}

/// Read access to parent rows, scoped to the transaction being committed.
pub trait ParentLookup {
    fn document_owner(&self, doc_id: Uuid) -> Result<Option<Uuid>, StoreError>;
}

/// Resolves the owning user of a pending change.
///
/// `Ok(None)` and `Err(_)` both mean "unresolvable": the notifier drops the
/// event and records a diagnostic.
pub trait OwnerResolver: Send + Sync {
    fn resolve(
        &self,
        change: &PendingChange,
        parents: &dyn ParentLookup,
    ) -> Result<Option<Uuid>, StoreError>;
}

/// Default resolver: direct owners pass through, document children follow
/// one hop to the document row.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentDocumentResolver;

impl OwnerResolver for ParentDocumentResolver {
    fn resolve(
        &self,
        change: &PendingChange,
        parents: &dyn ParentLookup,
    ) -> Result<Option<Uuid>, StoreError> {
        match change.owner {
            OwnerRef::Direct(owner) => Ok(Some(owner)),
            OwnerRef::Document(doc_id) => parents.document_owner(doc_id),
        }
    }
}

/// Counters for notifier health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub emitted: u64,
    pub dropped: u64,
}

/// Stages change events into store transactions.
pub struct MutationNotifier {
    resolver: Arc<dyn OwnerResolver>,
    emitted: AtomicU64,
    dropped: AtomicU64,
    wake: Arc<Notify>,
}

impl MutationNotifier {
    pub fn new(resolver: Arc<dyn OwnerResolver>) -> Self {
        Self {
            resolver,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Resolve owners and encode the change-channel payloads.
    ///
    /// Never fails: anything that cannot be turned into an event is dropped.
    pub(crate) fn stage(
        &self,
        pending: &[PendingChange],
        parents: &dyn ParentLookup,
        now: u64,
    ) -> Vec<(ChangeEvent, Vec<u8>)> {
        let mut staged = Vec::with_capacity(pending.len());
        for change in pending {
            let owner = match self.resolver.resolve(change, parents) {
                Ok(Some(owner)) => owner,
                Ok(None) => {
                    self.drop_event(change, "owner lookup returned nothing");
                    continue;
                }
                Err(e) => {
                    self.drop_event(change, &e.to_string());
                    continue;
                }
            };

            let event = ChangeEvent {
                entity: change.entity,
                op: change.op,
                id: change.id,
                owner_id: owner,
                emitted_at: now,
            };
            match serde_json::to_vec(&event) {
                Ok(payload) => staged.push((event, payload)),
                Err(e) => self.drop_event(change, &e.to_string()),
            }
        }
        staged
    }

    /// Called after a successful commit carrying `count` change rows.
    pub(crate) fn committed(&self, count: usize) {
        if count > 0 {
            self.emitted.fetch_add(count as u64, Ordering::Relaxed);
            self.wake.notify_one();
        }
    }

    fn drop_event(&self, change: &PendingChange, why: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Dropping {:?} {:?} event for {}: owner unresolved ({why})",
            change.entity,
            change.op,
            change.id
        );
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Notified once per commit that produced change rows.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

// ─── Change feed ──────────────────────────────────────────────────────

/// Ordered reader over the storage change channel.
pub trait ChangeFeed: Send + Sync {
    /// Refresh the view of the primary (no-op for the primary itself).
    fn catch_up(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Up to `limit` change records with `seq >= since`, in commit order.
    fn read_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Sequence number the next committed change will receive.
    fn next_seq(&self) -> Result<u64, StoreError>;

    /// In-process wake-up signal, when the feed has one.
    fn wake_handle(&self) -> Option<Arc<Notify>> {
        None
    }
}

pub(crate) fn change_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

pub(crate) fn parse_change_row(key: &[u8], value: &[u8]) -> Result<ChangeRecord, StoreError> {
    let seq_bytes: [u8; 8] = key
        .get(..8)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| StoreError::Deserialization("short change key".into()))?;
    let event: ChangeEvent = serde_json::from_slice(value)
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(ChangeRecord {
        seq: u64::from_be_bytes(seq_bytes),
        event,
    })
}

/// Change feed for a process that does not own the database.
///
/// Opens the store as a RocksDB secondary instance and polls the primary's
/// change rows. This is how the standalone relay reads the channel while the
/// serving process keeps the primary open.
pub struct SecondaryFeed {
    db: DBWithThreadMode<SingleThreaded>,
}

impl SecondaryFeed {
    pub fn open(primary_path: &Path, secondary_path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.set_max_open_files(-1);
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_as_secondary(
            &opts,
            primary_path,
            secondary_path,
            COLUMN_FAMILIES.iter().copied(),
        )?;
        Ok(Self { db })
    }
}

impl ChangeFeed for SecondaryFeed {
    fn catch_up(&self) -> Result<(), StoreError> {
        self.db.try_catch_up_with_primary()?;
        Ok(())
    }

    fn read_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        let cf = self
            .db
            .cf_handle(CF_CHANGES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_CHANGES}' not found")))?;
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
        let cf = self
            .db
            .cf_handle(CF_CHANGES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_CHANGES}' not found")))?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, value) = item?;
                Ok(parse_change_row(&key, &value)?.seq + 1)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoParents;

    impl ParentLookup for NoParents {
        fn document_owner(&self, _doc_id: Uuid) -> Result<Option<Uuid>, StoreError> {
            Ok(None)
        }
    }

    struct FixedParent(Uuid);

    impl ParentLookup for FixedParent {
        fn document_owner(&self, _doc_id: Uuid) -> Result<Option<Uuid>, StoreError> {
            Ok(Some(self.0))
        }
    }

    #[test]
    fn test_direct_owner_passes_through() {
        let notifier = MutationNotifier::new(Arc::new(ParentDocumentResolver));
        let owner = Uuid::new_v4();
        let change = PendingChange::new(
            EntityKind::Session,
            ChangeOp::Update,
            Uuid::new_v4(),
            OwnerRef::Direct(owner),
        );
        let staged = notifier.stage(&[change], &NoParents, 42);
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0.owner_id, owner);
        assert_eq!(staged[0].0.emitted_at, 42);
    }

    #[test]
    fn test_parent_hop_resolves_owner() {
        let notifier = MutationNotifier::new(Arc::new(ParentDocumentResolver));
        let owner = Uuid::new_v4();
        let change = PendingChange::new(
            EntityKind::Revision,
            ChangeOp::Create,
            Uuid::new_v4(),
            OwnerRef::Document(Uuid::new_v4()),
        );
        let staged = notifier.stage(&[change], &FixedParent(owner), 0);
        assert_eq!(staged[0].0.owner_id, owner);
    }

    #[test]
    fn test_unresolved_owner_is_dropped_and_counted() {
        let notifier = MutationNotifier::new(Arc::new(ParentDocumentResolver));
        let change = PendingChange::new(
            EntityKind::Revision,
            ChangeOp::Update,
            Uuid::new_v4(),
            OwnerRef::Document(Uuid::new_v4()),
        );
        let staged = notifier.stage(&[change], &NoParents, 0);
        assert!(staged.is_empty());
        assert_eq!(notifier.stats().dropped, 1);
        assert_eq!(notifier.stats().emitted, 0);
    }

    #[test]
    fn test_change_row_parse() {
        let event = ChangeEvent {
            entity: EntityKind::Document,
            op: ChangeOp::Delete,
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            emitted_at: 9,
        };
        let payload = serde_json::to_vec(&event).unwrap();
        let record = parse_change_row(&change_key(7), &payload).unwrap();
        assert_eq!(record.seq, 7);
        assert_eq!(record.event, event);
        assert!(parse_change_row(&[1, 2], &payload).is_err());
    }
}
