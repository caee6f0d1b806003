//! # folio-store: Revision store and change channel for Folio
//!
//! Persists documents, revision history, edit sessions, access records and
//! the audit log in RocksDB, and emits an identifier-only change event for
//! every committed row change.
//!
//! ```text
//!  edit API / admin tools
//!          │
//!          ▼
//! ┌─────────────────┐   same txn   ┌──────────────────┐
//! │  DocumentStore  │ ───────────► │ MutationNotifier │
//! │  (RocksDB)      │              │ (change rows)    │
//! └────────┬────────┘              └────────┬─────────┘
//!          │ superseded content             │ ChangeFeed
//!          ▼                                ▼
//! ┌─────────────────┐              ┌──────────────────┐
//! │  ArchiveStore   │              │ relay (folio-live)│
//! └─────────────────┘              └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`rocks`]: RocksDB document store with version-checked writes
//! - [`notify`]: Mutation notifier, owner resolution, change feeds
//! - [`archive`]: Durable object storage for archived content
//! - [`model`]: Persisted row types
//! - [`clock`]: Time source

pub mod archive;
pub mod clock;
pub mod error;
pub mod model;
pub mod notify;
pub mod rocks;

// Re-exports for convenience
pub use archive::{archive_key, revision_object_key, ArchiveStore, FsArchive};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ArchiveError, StoreError};
pub use model::{
    AccessRecord, AuditAction, AuditEntry, AuditResult, ChangeEvent, ChangeOp, ChangeRecord,
    DocumentRecord, EditReason, EditSession, EntityKind, Revision, RevisionRef,
    SessionOutcome, SizeMetrics,
};
pub use notify::{
    ChangeFeed, MutationNotifier, NotifierStats, OwnerRef, OwnerResolver,
    ParentDocumentResolver, ParentLookup, PendingChange, SecondaryFeed,
};
pub use rocks::{
    AuditFilter, DocumentStore, EditContext, EditDecision, EditInput, EditOutcome,
    SessionEnd, SessionInsert, StoreConfig,
};
