//! Periodic maintenance: idle-session timeouts, archival reconciliation,
//! content eviction and change-log pruning.

use std::sync::Arc;
use std::time::Duration;

use folio_store::StoreError;
use tokio::task::JoinHandle;

use crate::config::JanitorSection;
use crate::services::Services;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub timed_out: usize,
    pub archived: usize,
    pub archive_failures: usize,
    pub evicted: usize,
    pub pruned_changes: u64,
}

pub struct Janitor {
    services: Services,
    config: JanitorSection,
}

impl Janitor {
    pub fn new(services: Services, config: JanitorSection) -> Self {
        Self { services, config }
    }

    /// One maintenance pass. Blocking; call from the blocking pool.
    pub fn run_once(&self) -> Result<JanitorReport, StoreError> {
        let now = self.services.store.now();
        let timed_out = self.services.tracker.sweep_idle()?.len();

        let archive_cutoff = now.saturating_sub(self.config.archive_after_secs * 1000);
        let reconcile = self.services.archiver.reconcile(archive_cutoff)?;

        let evict_cutoff = now.saturating_sub(self.config.evict_after_secs * 1000);
        let evicted = self.services.archiver.evict(evict_cutoff)?;

        let pruned_changes = self.services.store.prune_changes(self.config.change_retention)?;

        Ok(JanitorReport {
            timed_out,
            archived: reconcile.archived,
            archive_failures: reconcile.failed,
            evicted,
            pruned_changes,
        })
    }

    /// Run [`run_once`](Self::run_once) every `interval_secs` until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let this = self.clone();
                match tokio::task::spawn_blocking(move || this.run_once()).await {
                    Ok(Ok(report)) if report != JanitorReport::default() => {
                        log::info!("Janitor pass: {report:?}");
                    }
                    Ok(Ok(_)) => log::trace!("Janitor pass: nothing to do"),
                    Ok(Err(e)) => log::error!("Janitor pass failed: {e}"),
                    Err(e) => log::error!("Janitor task panicked: {e}"),
                }
            }
        })
    }
}
