// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial load of every mapped collection into its target table.
//!
//! # Import Modes
//!
//! ```text
//! Full:         DROP (optional) → CREATE → stream documents → COPY batches
//!               → table init statements
//!
//! Incremental:  CREATE IF NOT EXISTS → read MAX(key) → stream documents
//!               newer than the mark → per batch:
//!                 CREATE TEMP staging → COPY into staging
//!                 BEGIN → DELETE matching keys → INSERT from staging
//!                 → DROP staging → COMMIT
//! ```
//!
//! A namespace without a high-water mark (no incremental key, or an empty
//! table) is imported in full even when incremental mode is requested.
//!
//! # Failure Handling
//!
//! When a COPY is rejected the batch is retried one document at a time.
//! Unique violations during the row fallback are logged and skipped; other
//! row failures either skip the document (`continue_on_error`) or abort the
//! namespace. The first namespace to fail aborts the whole import.

use crate::applier::upsert_document;
use crate::codec::{self, quote_ident, SqlValue};
use crate::concurrency::ConcurrencyController;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::source::{DocumentSource, FindQuery};
use crate::spec::{CollectionSpec, SpecSet};
use crate::target::{read_high_water_mark, TargetConnection, TargetResult, TargetStore};
use bson::{doc, Document};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

/// Knobs for one import run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    /// Only import documents newer than the target's high-water mark.
    pub incremental: bool,
    /// Drop the table before a full import.
    pub drop_table: bool,
    /// Run table init statements after a full import.
    pub run_table_init: bool,
    /// Load batches with COPY.
    pub bulk_copy: bool,
    pub batch_size: usize,
    /// Skip documents that cannot be written instead of failing.
    pub continue_on_error: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            incremental: false,
            drop_table: true,
            run_table_init: true,
            bulk_copy: true,
            batch_size: 1000,
            continue_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Full,
    Incremental,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Full => "full",
            ImportMode::Incremental => "incremental",
        }
    }
}

/// Result of importing one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub namespace: String,
    pub mode: ImportMode,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub batches: usize,
    /// Batches that fell back to row-level writes.
    pub fallback_batches: usize,
}

impl ImportReport {
    fn new(namespace: &str, mode: ImportMode) -> Self {
        Self {
            namespace: namespace.to_string(),
            mode,
            rows_loaded: 0,
            rows_skipped: 0,
            batches: 0,
            fallback_batches: 0,
        }
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    loaded: u64,
    skipped: u64,
    fell_back: bool,
}

/// Loads collections into the target, bounded by the controller's slots.
pub struct BulkImporter<S: DocumentSource, T: TargetStore> {
    specs: Arc<SpecSet>,
    source: Arc<S>,
    target: Arc<T>,
    concurrency: Arc<ConcurrencyController>,
    settings: ImportSettings,
}

impl<S: DocumentSource, T: TargetStore> BulkImporter<S, T> {
    pub fn new(
        specs: Arc<SpecSet>,
        source: Arc<S>,
        target: Arc<T>,
        concurrency: Arc<ConcurrencyController>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            specs,
            source,
            target,
            concurrency,
            settings,
        }
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// Import every namespace, at most `capacity` at a time. Stops at the
    /// first failure and cancels the imports still running.
    pub async fn import_all(self: &Arc<Self>) -> Result<Vec<ImportReport>> {
        info!(
            namespaces = self.specs.len(),
            capacity = self.concurrency.capacity(),
            incremental = self.settings.incremental,
            "Starting import"
        );

        let mut tasks = JoinSet::new();
        for spec in self.specs.iter() {
            let importer = Arc::clone(self);
            let spec = Arc::clone(spec);
            tasks.spawn(async move {
                let _slot = importer.concurrency.acquire_slot().await?;
                importer.import_collection(&spec).await
            });
        }

        let mut reports = Vec::with_capacity(self.specs.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| ReplicationError::Internal(format!("import task failed: {}", e)));
            match outcome.and_then(|r| r) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(error = %e, "Import failed, cancelling remaining namespaces");
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        reports.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        info!(namespaces = reports.len(), "Import complete");
        Ok(reports)
    }

    /// Import one namespace on a single connection while holding its lock.
    pub async fn import_collection(&self, spec: &CollectionSpec) -> Result<ImportReport> {
        let span = info_span!("import", namespace = %spec.namespace, table = %spec.target_table);
        async {
            let started = Instant::now();
            let _guard = self.concurrency.lock_namespace(&spec.namespace).await;
            let mut conn = self
                .target
                .acquire()
                .await
                .map_err(|e| ReplicationError::import(&spec.namespace, e.into()))?;

            let report = self
                .import_with(&mut conn, spec)
                .await
                .map_err(|e| ReplicationError::import(&spec.namespace, e))?;

            metrics::record_import_complete(&spec.namespace, report.mode.as_str(), started.elapsed());
            info!(
                mode = report.mode.as_str(),
                rows = report.rows_loaded,
                skipped = report.rows_skipped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Imported namespace"
            );
            Ok::<_, ReplicationError>(report)
        }
        .instrument(span)
        .await
    }

    async fn import_with(&self, conn: &mut T::Connection, spec: &CollectionSpec) -> Result<ImportReport> {
        if self.settings.incremental {
            if let Some(key) = spec.incremental_key() {
                conn.execute(&codec::create_table_sql(spec, &spec.target_table), &[])
                    .await?;
                if let Some(mark) = read_high_water_mark(conn, spec).await? {
                    info!(key = %key.name, high_water_mark = %mark, "Importing documents after high-water mark");
                    let mut filter = Document::new();
                    filter.insert(key.source.clone(), doc! { "$gt": mark.to_bson() });
                    return self.incremental_import(conn, spec, filter).await;
                }
                info!("No high-water mark, running full import");
            }
        }
        self.full_import(conn, spec).await
    }

    async fn full_import(&self, conn: &mut T::Connection, spec: &CollectionSpec) -> Result<ImportReport> {
        if self.settings.drop_table {
            conn.execute(&codec::drop_table_sql(&spec.target_table), &[]).await?;
        }
        conn.execute(&codec::create_table_sql(spec, &spec.target_table), &[])
            .await?;

        let query = FindQuery::new(window_filter(spec)).projection(spec.projection());
        let report = self.stream_batches(conn, spec, query, ImportMode::Full).await?;

        if self.settings.run_table_init {
            let total = spec.table_init_statements.len();
            for (i, statement) in spec.table_init_statements.iter().enumerate() {
                info!(step = i + 1, total, statement = %statement, "Running table init statement");
                conn.execute(statement, &[])
                    .await
                    .map_err(|source| ReplicationError::TableInit {
                        namespace: spec.namespace.clone(),
                        statement: statement.clone(),
                        source,
                    })?;
            }
        }
        Ok(report)
    }

    async fn incremental_import(
        &self,
        conn: &mut T::Connection,
        spec: &CollectionSpec,
        filter: Document,
    ) -> Result<ImportReport> {
        let query = FindQuery::new(filter).projection(spec.projection());
        self.stream_batches(conn, spec, query, ImportMode::Incremental).await
    }

    async fn stream_batches(
        &self,
        conn: &mut T::Connection,
        spec: &CollectionSpec,
        query: FindQuery,
        mode: ImportMode,
    ) -> Result<ImportReport> {
        let batch_size = self.settings.batch_size.max(1);
        let mut documents = self.source.find(spec, query).await?;
        let mut report = ImportReport::new(&spec.namespace, mode);
        let mut batch: Vec<Document> = Vec::with_capacity(batch_size);

        while let Some(document) = documents.try_next().await? {
            batch.push(document);
            if batch.len() >= batch_size {
                self.load_batch(conn, spec, mode, &batch, &mut report).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.load_batch(conn, spec, mode, &batch, &mut report).await?;
        }
        Ok(report)
    }

    async fn load_batch(
        &self,
        conn: &mut T::Connection,
        spec: &CollectionSpec,
        mode: ImportMode,
        batch: &[Document],
        report: &mut ImportReport,
    ) -> Result<()> {
        let started = Instant::now();
        let outcome = match mode {
            ImportMode::Full => self.load_full_batch(conn, spec, batch).await?,
            ImportMode::Incremental => self.load_incremental_batch(conn, spec, batch).await?,
        };

        report.batches += 1;
        report.rows_loaded += outcome.loaded;
        report.rows_skipped += outcome.skipped;
        if outcome.fell_back {
            report.fallback_batches += 1;
        }

        let method = if outcome.fell_back || !self.settings.bulk_copy { "rows" } else { "copy" };
        metrics::record_import_batch(&spec.namespace, method, started.elapsed());
        metrics::record_rows_imported(&spec.namespace, mode.as_str(), outcome.loaded);
        info!(rows = report.rows_loaded, batch = report.batches, "Imported batch");
        Ok(())
    }

    async fn load_full_batch(
        &self,
        conn: &mut T::Connection,
        spec: &CollectionSpec,
        batch: &[Document],
    ) -> Result<BatchOutcome> {
        if self.settings.bulk_copy {
            match copy_documents(conn, spec, &spec.target_table, batch).await {
                Ok(loaded) => return Ok(BatchOutcome { loaded, ..Default::default() }),
                Err(source) => self.note_fallback(spec, source),
            }
        }

        let insert = codec::insert_sql(spec, &spec.target_table);
        let mut outcome = BatchOutcome {
            fell_back: self.settings.bulk_copy,
            ..Default::default()
        };
        for document in batch {
            let values: Vec<SqlValue> = codec::transform_values(spec, document).collect();
            match conn.execute(&insert, &values).await {
                Ok(_) => outcome.loaded += 1,
                Err(e) if e.is_unique_violation() => {
                    info!(document_id = %codec::document_id(document), "Ignoring primary key violation");
                    metrics::record_row_skipped(&spec.namespace, "duplicate");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    self.skip_or_abort(ReplicationError::row(&spec.namespace, codec::document_id(document), e))?;
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn load_incremental_batch(
        &self,
        conn: &mut T::Connection,
        spec: &CollectionSpec,
        batch: &[Document],
    ) -> Result<BatchOutcome> {
        if self.settings.bulk_copy {
            let staging = format!("{}_copy_temp", spec.target_table);
            match replace_from_staging(conn, spec, &staging, batch).await {
                Ok(loaded) => return Ok(BatchOutcome { loaded, ..Default::default() }),
                Err(source) => {
                    if let Err(e) = conn.rollback().await {
                        warn!(error = %e, "Rollback after failed staging replace failed");
                    }
                    if let Err(e) = conn.execute(&codec::drop_table_sql(&staging), &[]).await {
                        warn!(error = %e, "Could not drop staging table");
                    }
                    self.note_fallback(spec, source);
                }
            }
        }

        let mut outcome = BatchOutcome {
            fell_back: self.settings.bulk_copy,
            ..Default::default()
        };
        for document in batch {
            match upsert_document(conn, spec, document).await {
                Ok(_) => outcome.loaded += 1,
                Err(e) => {
                    self.skip_or_abort(ReplicationError::row(&spec.namespace, codec::document_id(document), e))?;
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn note_fallback(&self, spec: &CollectionSpec, source: crate::error::TargetError) {
        let err = ReplicationError::BulkLoad {
            table: spec.target_table.clone(),
            source,
        };
        warn!(error = %err, "Bulk load failed, writing documents individually");
        metrics::record_bulk_fallback(&spec.namespace);
    }

    fn skip_or_abort(&self, err: ReplicationError) -> Result<()> {
        if !self.settings.continue_on_error {
            return Err(err);
        }
        error!(error = %err, "Skipping document");
        if let ReplicationError::Row { namespace, .. } = &err {
            metrics::record_row_skipped(namespace, "error");
        }
        Ok(())
    }
}

/// Filter limiting a full import to the configured window. Only temporal
/// incremental keys support a window.
pub fn window_filter(spec: &CollectionSpec) -> Document {
    let mut filter = Document::new();
    match (spec.incremental_key(), spec.incremental_limit) {
        (Some(key), Some(limit)) if key.is_temporal() => {
            let now_ms = bson::DateTime::now().timestamp_millis();
            let since = bson::DateTime::from_millis(now_ms.saturating_sub(limit.as_millis() as i64));
            info!(
                key = %key.name,
                window = %humantime::format_duration(limit),
                "Importing documents inside replication window"
            );
            filter.insert(key.source.clone(), doc! { "$gte": since });
        }
        (Some(key), Some(_)) => {
            warn!(key = %key.name, "Replication limit only applies to temporal keys, importing everything");
        }
        _ => {}
    }
    filter
}

async fn copy_documents<C>(conn: &mut C, spec: &CollectionSpec, table: &str, batch: &[Document]) -> TargetResult<u64>
where
    C: TargetConnection + ?Sized,
{
    let mut data = String::new();
    for document in batch {
        data.push_str(&codec::to_text_row(spec, document));
    }
    conn.copy_in(&codec::copy_statement(spec, table), data.into_bytes())
        .await
}

/// `DELETE FROM target USING staging` on every key column.
fn staged_delete_sql(spec: &CollectionSpec, staging: &str) -> String {
    let target = quote_ident(&spec.target_table);
    let staged = quote_ident(staging);
    let matches: Vec<String> = spec
        .primary_key()
        .map(|c| {
            let column = quote_ident(&c.name);
            format!("{}.{} = {}.{}", target, column, staged, column)
        })
        .collect();
    format!("DELETE FROM {} USING {} WHERE {}", target, staged, matches.join(" AND "))
}

fn staged_insert_sql(spec: &CollectionSpec, staging: &str) -> String {
    let columns = codec::column_names(spec).join(", ");
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_ident(&spec.target_table),
        columns,
        columns,
        quote_ident(staging)
    )
}

/// Replace the batch's rows atomically through a staging table.
async fn replace_from_staging<C>(
    conn: &mut C,
    spec: &CollectionSpec,
    staging: &str,
    batch: &[Document],
) -> TargetResult<u64>
where
    C: TargetConnection + ?Sized,
{
    conn.execute(&codec::drop_table_sql(staging), &[]).await?;
    conn.execute(&codec::create_temp_table_sql(spec, staging), &[]).await?;
    copy_documents(conn, spec, staging, batch).await?;

    conn.begin().await?;
    conn.execute(&staged_delete_sql(spec, staging), &[]).await?;
    let inserted = conn.execute(&staged_insert_sql(spec, staging), &[]).await?;
    conn.execute(&format!("DROP TABLE {}", quote_ident(staging)), &[]).await?;
    conn.commit().await?;
    Ok(inserted)
}
