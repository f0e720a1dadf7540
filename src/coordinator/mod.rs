// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! Owns the lifecycle and sequences the phases:
//!
//! 1. Capture the feed start (persisted cursor, or the source head)
//! 2. Reconcile deletions (incremental imports only)
//! 3. Import every namespace
//! 4. Tail the change feed, starting from the position captured in step 1
//!
//! Capturing the feed start before importing means nothing written during
//! the import is missed; those changes are replayed on top of the imported
//! rows (the catch-up window).

mod tail;
mod types;

pub use types::EngineState;

use crate::applier::ChangeEventApplier;
use crate::concurrency::ConcurrencyController;
use crate::config::{DatabaseMode, FeedKind, ReplicationConfig};
use crate::cursor::FeedCursorStore;
use crate::error::{ReplicationError, Result};
use crate::importer::{BulkImporter, ImportReport};
use crate::metrics;
use crate::reconcile::{DeletionReconciler, ReconcileReport};
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::source::{local_timestamp, DocumentSource, FeedStart, MongoSource};
use crate::spec::{MappingDocument, SpecSet};
use crate::target::{PgTarget, TargetStore};
use bson::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tail::TailSettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The replication engine.
///
/// Generic over the document source and relational target so the whole
/// pipeline can run against in-memory stores in tests.
pub struct ReplicationEngine<S: DocumentSource, T: TargetStore> {
    config: ReplicationConfig,
    specs: Arc<SpecSet>,
    source: Arc<S>,
    target: Arc<T>,
    concurrency: Arc<ConcurrencyController>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    cursor_store: Option<Arc<FeedCursorStore>>,
    feed_handle: Option<JoinHandle<Result<()>>>,
    flush_handle: Option<JoinHandle<()>>,

    import_reports: Vec<ImportReport>,
    reconcile_report: Option<ReconcileReport>,
}

impl ReplicationEngine<MongoSource, PgTarget> {
    /// Connect to MongoDB and PostgreSQL (retrying transient failures) and
    /// build the collection specs from `mapping`.
    pub async fn connect(config: ReplicationConfig, mapping: &MappingDocument) -> Result<Self> {
        config.validate()?;
        check_mapping_mode(config.source.db_mode, mapping)?;

        let retry = RetryConfig::startup();
        let source = retry_with_backoff("source_connect", &retry, || MongoSource::connect(&config.source)).await?;
        let target = retry_with_backoff("target_connect", &retry, || {
            PgTarget::connect(&config.target, config.concurrency)
        })
        .await?;

        let specs = SpecSet::build(mapping, source.default_database())?;
        info!(namespaces = specs.len(), "Built collection specs");
        Ok(Self::new(config, Arc::new(specs), Arc::new(source), Arc::new(target)))
    }
}

impl<S: DocumentSource, T: TargetStore> ReplicationEngine<S, T> {
    /// Create an engine in the `Created` state.
    pub fn new(config: ReplicationConfig, specs: Arc<SpecSet>, source: Arc<S>, target: Arc<T>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = Arc::new(ConcurrencyController::new(target.capacity()));
        metrics::set_namespace_count(specs.len());

        Self {
            config,
            specs,
            source,
            target,
            concurrency,
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            cursor_store: None,
            feed_handle: None,
            flush_handle: None,
            import_reports: Vec::new(),
            reconcile_report: None,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Handle that stops the engine from another task, e.g. a signal
    /// handler, while [`run_until_stopped()`](Self::run_until_stopped) waits.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn specs(&self) -> &Arc<SpecSet> {
        &self.specs
    }

    /// Per-namespace results of the initial import.
    pub fn import_reports(&self) -> &[ImportReport] {
        &self.import_reports
    }

    /// Result of deletion reconciliation, when it ran.
    pub fn reconcile_report(&self) -> Option<&ReconcileReport> {
        self.reconcile_report.as_ref()
    }

    pub fn cursor_store(&self) -> Option<&Arc<FeedCursorStore>> {
        self.cursor_store.as_ref()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Reconcile, import, then start tailing the feed in the background.
    ///
    /// Returns once the engine is `Running`. Any failure on the way leaves
    /// the engine `Failed`.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        match self.run_startup().await {
            Ok(()) => {
                self.set_state(EngineState::Running);
                info!(namespaces = self.specs.len(), "Replication engine running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Replication engine failed to start");
                metrics::record_error("engine", e.kind());
                self.set_state(EngineState::Failed);
                if let Some(store) = self.cursor_store.take() {
                    store.close().await;
                }
                Err(e)
            }
        }
    }

    async fn run_startup(&mut self) -> Result<()> {
        self.config.validate()?;
        info!(
            namespaces = self.specs.len(),
            concurrency = self.concurrency.capacity(),
            feed = %self.config.feed.kind,
            delete_mode = %self.config.delete_mode,
            incremental = self.config.import.incremental,
            "Starting replication engine"
        );
        if self.specs.is_empty() {
            warn!("No collections mapped");
        }

        let cursor_store = Arc::new(FeedCursorStore::open(&self.config.cursor).await?);
        self.cursor_store = Some(Arc::clone(&cursor_store));

        let feed_start = self.resolve_feed_start(&cursor_store).await?;
        debug!(start = ?feed_start, "Resolved feed start");

        if self.config.import.incremental {
            self.set_state(EngineState::Reconciling);
            let reconciler = DeletionReconciler::new(
                Arc::clone(&self.specs),
                Arc::clone(&self.source),
                Arc::clone(&self.target),
                Arc::clone(&self.concurrency),
            );
            self.reconcile_report = Some(reconciler.run(self.config.reconcile.strategy).await?);
        }

        self.set_state(EngineState::Importing);
        let importer = Arc::new(BulkImporter::new(
            Arc::clone(&self.specs),
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            Arc::clone(&self.concurrency),
            self.config.import_settings(),
        ));
        self.import_reports = importer.import_all().await?;

        // Everything at or before the head was written before the import
        // finished; replaying those deletes would undo nothing useful.
        let catch_up_boundary = self.source.head_timestamp().await?.unwrap_or_else(local_timestamp);
        info!(
            boundary_secs = catch_up_boundary.time,
            boundary_inc = catch_up_boundary.increment,
            "Import complete, starting change feed"
        );

        let applier = Arc::new(
            ChangeEventApplier::new(
                Arc::clone(&self.specs),
                Arc::clone(&self.source),
                Arc::clone(&self.target),
                Arc::clone(&self.concurrency),
                self.config.delete_mode,
            )
            .with_catch_up_boundary(Some(catch_up_boundary)),
        );

        let namespaces = self.specs.namespaces();
        let stream = self.source.open_feed(feed_start, &namespaces).await?;

        self.spawn_cursor_flush_task(Arc::clone(&cursor_store));
        let settings = TailSettings {
            kind: self.config.feed.kind,
            exit_on_error: self.config.exit_on_error,
        };
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = self.state_tx.clone();
        self.feed_handle = Some(tokio::spawn(async move {
            let result = tail::run_feed(stream, applier, cursor_store, settings, shutdown_rx).await;
            if result.is_err() {
                let _ = state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
            }
            result
        }));
        Ok(())
    }

    /// Where the live feed starts: the persisted cursor when resuming,
    /// otherwise the source head right now.
    async fn resolve_feed_start(&self, cursor_store: &FeedCursorStore) -> Result<FeedStart> {
        let kind = self.config.feed.kind;
        if self.config.feed.resume_from_cursor {
            match cursor_store.get_position(kind).await? {
                Some(position) => {
                    let encoded = position.encode()?;
                    info!(position = %encoded, "Resuming feed from persisted cursor");
                    return Ok(position.resume_point());
                }
                None => info!("No persisted feed cursor, starting at source head"),
            }
        }

        let head: Timestamp = self.source.head_timestamp().await?.unwrap_or_else(local_timestamp);
        Ok(match kind {
            FeedKind::Oplog => FeedStart::Oplog { after: head },
            FeedKind::ChangeStream => FeedStart::ChangeStream {
                resume_after: None,
                start_at: Some(head),
            },
        })
    }

    fn spawn_cursor_flush_task(&mut self, cursor_store: Arc<FeedCursorStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.cursor.flush_interval_duration();

        self.flush_handle = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = cursor_store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush feed cursor");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Cursor flush task stopping");
                            break;
                        }
                    }
                }
            }
        }));
        debug!(interval = ?flush_interval, "Spawned cursor flush task");
    }

    /// Wait until the feed stops: `Ok` after a shutdown, the fatal error
    /// otherwise. Cleans up like [`shutdown()`](Self::shutdown) either way.
    pub async fn run_until_stopped(&mut self) -> Result<()> {
        let result = match self.feed_handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(ReplicationError::Internal(format!("feed task failed: {}", e))),
            },
            None => Ok(()),
        };
        if let Err(e) = &result {
            error!(error = %e, "Change feed stopped with error");
        }
        self.finish(result.is_err()).await;
        result
    }

    /// Stop the feed after the in-flight event, flush the cursor and close.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        self.concurrency.close();

        let mut failed = false;
        if let Some(handle) = self.feed_handle.take() {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(Ok(()))) => debug!("Feed task completed gracefully"),
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, "Feed task ended with error");
                    failed = true;
                }
                Ok(Err(e)) => warn!(error = %e, "Feed task panicked during shutdown"),
                Err(_) => warn!("Feed task timed out during shutdown"),
            }
        }
        self.finish(failed).await;
    }

    async fn finish(&mut self, failed: bool) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.flush_handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Cursor flush task timed out during shutdown");
            }
        }
        if let Some(store) = self.cursor_store.take() {
            store.close().await;
        }

        if failed {
            self.set_state(EngineState::Failed);
        } else {
            self.set_state(EngineState::Stopped);
            info!("Replication engine stopped");
        }
    }
}

/// Requests a graceful stop of a running engine.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// The feed stops after the event in flight.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// The mapping shape must match the configured database mode.
fn check_mapping_mode(mode: DatabaseMode, mapping: &MappingDocument) -> Result<()> {
    match (mode, mapping) {
        (DatabaseMode::Single, MappingDocument::Single(_))
        | (DatabaseMode::Multi, MappingDocument::Multi(_)) => Ok(()),
        (DatabaseMode::Single, MappingDocument::Multi(_)) => Err(ReplicationError::Config(
            "mapping is keyed by database but db_mode is single".to_string(),
        )),
        (DatabaseMode::Multi, MappingDocument::Single(_)) => Err(ReplicationError::Config(
            "mapping is keyed by collection but db_mode is multi".to_string(),
        )),
    }
}
