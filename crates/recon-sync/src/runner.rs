//! Drives one adapter run: progress record, batch loop, terminal status.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use recon_adapters::{BatchOutcome, SyncAdapter, SyncContext};
use recon_core::{SyncImport, SyncStatus};
use recon_storage::{Store, StoreError};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::registry::AdapterRegistry;

/// Progress records keep at most this many error lines; the last one summarizes the rest.
pub const MAX_ERRORS: usize = 250;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown adapter {0}")]
    UnknownAdapter(String),
    #[error("adapter {adapter} already has a run in progress")]
    AlreadyRunning { adapter: String, import_id: Option<Uuid> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Held for the lifetime of a run; releases the adapter on drop.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    adapter: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.adapter);
    }
}

#[derive(Clone)]
pub struct SyncRunner {
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    running: Arc<Mutex<HashSet<String>>>,
    stale_after: Duration,
}

impl SyncRunner {
    pub fn new(store: Arc<dyn Store>, registry: AdapterRegistry, stale_after: Duration) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            running: Arc::new(Mutex::new(HashSet::new())),
            stale_after,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Run `adapter` to completion and return its final progress record.
    /// Adapter failures end up in the record; only refusals are errors.
    pub async fn run(&self, adapter: &str) -> Result<SyncImport, SyncError> {
        let (adapter, import, guard) = self.begin(adapter).await?;
        let import = drive(Arc::clone(&self.store), adapter, import).await;
        drop(guard);
        Ok(import)
    }

    /// Create the progress record now, run in the background, return its id.
    pub async fn spawn(&self, adapter: &str) -> Result<Uuid, SyncError> {
        let (adapter, import, guard) = self.begin(adapter).await?;
        let id = import.id;
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            drive(store, adapter, import).await;
            drop(guard);
        });
        Ok(id)
    }

    /// Run every registered adapter concurrently.
    pub async fn run_all(&self) -> Vec<(&'static str, Result<SyncImport, SyncError>)> {
        let names = self.registry.names();
        let runs = names.iter().map(|name| async move { (*name, self.run(name).await) });
        futures::future::join_all(runs).await
    }

    /// Fail every `running` record that has not moved for `stale_after`.
    pub async fn expire_stale_imports(&self) -> Result<usize, SyncError> {
        let mut expired = 0;
        for name in self.registry.names() {
            expired += self.expire_stale_for(name).await?;
        }
        Ok(expired)
    }

    async fn expire_stale_for(&self, adapter: &str) -> Result<usize, SyncError> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut expired = 0;
        for mut import in self.store.running_imports(adapter).await? {
            if now - import.updated_at < stale_after {
                continue;
            }
            let step = format!("expired: no progress for {}s", self.stale_after.as_secs());
            import.finish(SyncStatus::Failed, step, now);
            self.store.update_import(&import).await?;
            warn!(import_id = %import.id, adapter, "expired stale run");
            expired += 1;
        }
        Ok(expired)
    }

    async fn begin(&self, name: &str) -> Result<(Arc<dyn SyncAdapter>, SyncImport, RunGuard), SyncError> {
        let adapter = self
            .registry
            .get(name)
            .ok_or_else(|| SyncError::UnknownAdapter(name.to_string()))?;

        let guard = {
            let mut running = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !running.insert(name.to_string()) {
                return Err(SyncError::AlreadyRunning {
                    adapter: name.to_string(),
                    import_id: None,
                });
            }
            RunGuard {
                running: Arc::clone(&self.running),
                adapter: name.to_string(),
            }
        };

        self.expire_stale_for(name).await?;
        if let Some(live) = self.store.running_imports(name).await?.into_iter().next() {
            return Err(SyncError::AlreadyRunning {
                adapter: name.to_string(),
                import_id: Some(live.id),
            });
        }

        let import = SyncImport::start(adapter.provider(), adapter.name(), Utc::now());
        self.store.insert_import(&import).await?;
        Ok((adapter, import, guard))
    }
}

/// Append `new` to the record's errors without exceeding `MAX_ERRORS`.
fn record_errors(import: &mut SyncImport, new: Vec<String>, dropped: &mut usize) {
    for error in new {
        if import.errors.len() < MAX_ERRORS - 1 {
            import.errors.push(error);
        } else {
            *dropped += 1;
        }
    }
    if *dropped > 0 {
        let summary = format!("… and {dropped} more errors");
        if import.errors.len() == MAX_ERRORS {
            if let Some(last) = import.errors.last_mut() {
                *last = summary;
            }
        } else {
            import.errors.push(summary);
        }
    }
}

fn apply_outcome(import: &mut SyncImport, outcome: BatchOutcome, dropped: &mut usize) {
    import.records_synced += outcome.synced;
    import.records_failed += outcome.failed;
    import.records_skipped += outcome.skipped;
    record_errors(import, outcome.errors, dropped);
}

async fn save(store: &dyn Store, import: &SyncImport) {
    if let Err(err) = store.update_import(import).await {
        warn!(import_id = %import.id, error = %err, "could not save progress");
    }
}

async fn drive(store: Arc<dyn Store>, adapter: Arc<dyn SyncAdapter>, mut import: SyncImport) -> SyncImport {
    let span = info_span!("sync_run", import_id = %import.id, adapter = adapter.name());
    async move {
        let ctx = SyncContext::new(import.id, adapter.name(), import.started_at);
        let mut dropped = 0usize;

        let result = async {
            let mut batches = adapter.fetch_all(&ctx).await?;
            let mut batch_no = 0usize;
            while let Some(batch) = batches.next().await {
                let batch = batch?;
                batch_no += 1;
                import.records_found += batch.len() as u64;
                import.current_step = format!("batch {batch_no}: mapping {} items", batch.len());
                import.updated_at = Utc::now();
                save(store.as_ref(), &import).await;

                let outcome = adapter
                    .map_and_upsert(batch, &ctx)
                    .instrument(info_span!("batch", n = batch_no))
                    .await?;
                apply_outcome(&mut import, outcome, &mut dropped);
                import.current_step = format!("batch {batch_no} done");
                import.updated_at = Utc::now();
                save(store.as_ref(), &import).await;
            }
            Ok::<_, recon_adapters::AdapterError>(())
        }
        .await;

        match result {
            Ok(()) => {
                import.finish(SyncStatus::Completed, "completed", Utc::now());
                info!(
                    found = import.records_found,
                    synced = import.records_synced,
                    failed = import.records_failed,
                    skipped = import.records_skipped,
                    "sync completed"
                );
            }
            Err(err) => {
                warn!(error = %err, "sync failed");
                import.finish(SyncStatus::Failed, err.to_string(), Utc::now());
            }
        }
        save(store.as_ref(), &import).await;
        import
    }
    .instrument(span)
    .await
}
