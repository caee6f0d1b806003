//! Wiring of the edit-path components over one store.

use std::sync::Arc;
use std::time::Duration;

use folio_store::{
    ArchiveError, ArchiveStore, Clock, DocumentStore, FsArchive, ParentDocumentResolver,
    StoreError, SystemClock,
};
use thiserror::Error;

use crate::archival::Archiver;
use crate::config::Config;
use crate::gate::AccessGate;
use crate::policy::{SnapshotEngine, SnapshotPolicy};
use crate::session::SessionTracker;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not open store: {0}")]
    Store(#[from] StoreError),

    #[error("could not open archive: {0}")]
    Archive(#[from] ArchiveError),
}

/// Everything a request handler or background job needs.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<DocumentStore>,
    pub engine: Arc<SnapshotEngine>,
    pub archiver: Arc<Archiver>,
    pub tracker: Arc<SessionTracker>,
    pub gate: Arc<AccessGate>,
    pub end_session_budget: Duration,
}

impl Services {
    /// Open the store and archive named in `config`.
    pub fn open(config: &Config) -> Result<Self, ServiceError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock. Used by tests that drive time.
    pub fn open_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, ServiceError> {
        let store = Arc::new(DocumentStore::open_with(
            config.store_config(),
            clock,
            Arc::new(ParentDocumentResolver),
        )?);
        let archive = Arc::new(FsArchive::open(&config.archive.path)?);
        Ok(Self::assemble(store, archive, config))
    }

    pub fn assemble(
        store: Arc<DocumentStore>,
        archive: Arc<dyn ArchiveStore>,
        config: &Config,
    ) -> Self {
        let policy = SnapshotPolicy::new(Duration::from_secs(config.policy.snapshot_interval_secs));
        let engine = Arc::new(SnapshotEngine::new(store.clone(), policy));
        let archiver = Arc::new(Archiver::new(store.clone(), archive));
        let end_session_budget = config.server.end_session_budget();
        let gate = Arc::new(AccessGate::new(store.clone()));
        let tracker = Arc::new(SessionTracker::new(
            store.clone(),
            engine.clone(),
            archiver.clone(),
            gate.clone(),
            Duration::from_secs(config.session.idle_timeout_secs),
            end_session_budget,
        ));
        Self {
            store,
            engine,
            archiver,
            tracker,
            gate,
            end_session_budget,
        }
    }
}
