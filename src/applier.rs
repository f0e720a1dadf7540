// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applies normalized feed events to the target.
//!
//! # Idempotence
//!
//! Every write is keyed by the primary key: inserts and updates upsert,
//! deletes delete by key. Re-applying an event (after a restart from an
//! older cursor, or during the catch-up window) leaves the table unchanged.
//!
//! # Event Handling
//!
//! ```text
//! Insert               → upsert the document
//! UpdateByPatch        → fetch the current document, upsert it (or ignore if gone)
//! UpdateByReplacement  → merge key fields from the selector, upsert
//! Delete               → per delete mode: ignore, or delete by key
//! Batch                → leaves applied in order
//! Noop / Unrecognized  → ignored
//! ```
//!
//! # Partitioned Tables
//!
//! `ON CONFLICT` isn't usable on partitioned tables without a matching
//! unique index on every partition, so they get a plain INSERT followed by
//! an UPDATE when the insert hits a unique violation.

use crate::codec::{self, coerce, lookup_path, quote_ident, SqlValue};
use crate::concurrency::ConcurrencyController;
use crate::config::DeleteMode;
use crate::error::{ReplicationError, Result};
use crate::feed::{Change, FeedEvent};
use crate::metrics;
use crate::source::{timestamp_key, DocumentSource};
use crate::spec::{CollectionSpec, SpecSet};
use crate::target::{TargetConnection, TargetResult, TargetStore};
use bson::{Document, Timestamp};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Counts from applying one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub upserted: usize,
    pub deleted: u64,
    pub ignored: usize,
}

impl ApplyOutcome {
    fn merge(&mut self, other: ApplyOutcome) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.ignored += other.ignored;
    }

    fn ignored() -> Self {
        Self {
            ignored: 1,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statement builders
// ═══════════════════════════════════════════════════════════════════════════════

/// Upsert statements for one spec. All take the full row as parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatements {
    /// `INSERT ... ON CONFLICT (keys) DO UPDATE` (or `DO NOTHING`).
    pub upsert: String,
    /// Plain insert, used first on partitioned tables.
    pub insert: String,
    /// Update by key; `None` when every column is part of the key.
    pub update: Option<String>,
}

impl UpsertStatements {
    pub fn build(spec: &CollectionSpec) -> Self {
        let table = quote_ident(&spec.target_table);
        let names = codec::column_names(spec);
        let placeholders = codec::placeholders(spec);

        let mut assignments = Vec::new();
        let mut key_matches = Vec::new();
        for (i, (name, placeholder)) in names.iter().zip(&placeholders).enumerate() {
            let is_key = spec.columns.get(i).is_some_and(|c| c.is_primary_key);
            if is_key {
                key_matches.push(format!("{}.{} = {}", table, name, placeholder));
            } else {
                assignments.push(format!("{} = {}", name, placeholder));
            }
        }
        let keys: Vec<String> = spec.primary_key().map(|c| quote_ident(&c.name)).collect();

        let insert = codec::insert_sql(spec, &spec.target_table);
        let (upsert, update) = if assignments.is_empty() {
            (format!("{} ON CONFLICT ({}) DO NOTHING", insert, keys.join(", ")), None)
        } else {
            let set = assignments.join(", ");
            let filter = key_matches.join(" AND ");
            (
                format!(
                    "{} ON CONFLICT ({}) DO UPDATE SET {} WHERE {}",
                    insert,
                    keys.join(", "),
                    set,
                    filter
                ),
                Some(format!("UPDATE {} SET {} WHERE {}", table, set, filter)),
            )
        };
        Self { upsert, insert, update }
    }
}

/// `DELETE` by primary key, falling back to the column sourced from `_id`.
/// `None` when the selector has neither.
pub fn delete_statement(spec: &CollectionSpec, selector: &Document) -> Option<(String, Vec<SqlValue>)> {
    let pk: Vec<_> = spec.primary_key().collect();
    let columns = if pk.iter().all(|c| lookup_path(selector, &c.source).is_some()) {
        pk
    } else {
        let id_column = spec.columns.iter().find(|c| c.source == "_id")?;
        selector.get("_id")?;
        vec![id_column]
    };

    let mut clauses = Vec::with_capacity(columns.len());
    let mut params = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        clauses.push(format!("{} = ${}::{}", quote_ident(&column.name), i + 1, column.cast_type()));
        params.push(coerce(column, lookup_path(selector, &column.source)));
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&spec.target_table),
        clauses.join(" AND ")
    );
    Some((sql, params))
}

/// Rebuild a full document from a replacement and its selector.
///
/// Replacements may omit key fields that only appear in the selector.
pub fn merge_replacement(spec: &CollectionSpec, selector: &Document, replacement: &Document) -> Document {
    let mut merged = Document::new();
    for column in spec.primary_key() {
        if let Some(value) = selector.get(&column.source) {
            merged.insert(column.source.clone(), value.clone());
        }
    }
    for (key, value) in replacement {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Write one document by key. Returns the affected row count.
pub async fn upsert_document<C>(conn: &mut C, spec: &CollectionSpec, doc: &Document) -> TargetResult<u64>
where
    C: TargetConnection + ?Sized,
{
    let values: Vec<SqlValue> = codec::transform_values(spec, doc).collect();
    let statements = UpsertStatements::build(spec);

    let affected = if spec.partitioned {
        match conn.execute(&statements.insert, &values).await {
            Ok(n) => n,
            Err(e) if e.is_unique_violation() => match &statements.update {
                Some(update) => conn.execute(update, &values).await?,
                None => 0,
            },
            Err(e) => return Err(e),
        }
    } else {
        conn.execute(&statements.upsert, &values).await?
    };

    if affected > 1 {
        warn!(
            namespace = %spec.namespace,
            document_id = %codec::document_id(doc),
            rows = affected,
            "Upsert affected more than one row"
        );
        metrics::record_row_count_anomaly(&spec.namespace, "upsert");
    }
    Ok(affected)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Applier
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies feed events to the target, one namespace lock per write.
pub struct ChangeEventApplier<S: DocumentSource, T: TargetStore> {
    specs: Arc<SpecSet>,
    source: Arc<S>,
    target: Arc<T>,
    concurrency: Arc<ConcurrencyController>,
    delete_mode: DeleteMode,
    /// Events at or before this time were replayed from before startup.
    catch_up_until: Option<Timestamp>,
}

impl<S: DocumentSource, T: TargetStore> ChangeEventApplier<S, T> {
    pub fn new(
        specs: Arc<SpecSet>,
        source: Arc<S>,
        target: Arc<T>,
        concurrency: Arc<ConcurrencyController>,
        delete_mode: DeleteMode,
    ) -> Self {
        Self {
            specs,
            source,
            target,
            concurrency,
            delete_mode,
            catch_up_until: None,
        }
    }

    /// Set the end of the catch-up window used by [`DeleteMode::IgnorePast`].
    pub fn with_catch_up_boundary(mut self, boundary: Option<Timestamp>) -> Self {
        self.catch_up_until = boundary;
        self
    }

    pub fn delete_mode(&self) -> DeleteMode {
        self.delete_mode
    }

    fn in_catch_up(&self, event: &FeedEvent) -> bool {
        let event_ts = event.position.as_ref().and_then(|p| p.timestamp());
        match (self.catch_up_until, event_ts) {
            (Some(boundary), Some(ts)) => timestamp_key(ts) <= timestamp_key(boundary),
            // Without a position the event can't be placed after the window.
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Apply one event. Batches are applied leaf by leaf, in order; the
    /// first failure aborts the rest of the batch.
    pub async fn apply(&self, event: &FeedEvent) -> Result<ApplyOutcome> {
        let in_catch_up = self.in_catch_up(event);
        let mut outcome = ApplyOutcome::default();
        for change in event.change.flatten() {
            outcome.merge(self.apply_change(change, in_catch_up).await?);
        }
        Ok(outcome)
    }

    async fn apply_change(&self, change: &Change, in_catch_up: bool) -> Result<ApplyOutcome> {
        let started = Instant::now();
        let namespace = match change {
            Change::Noop => return Ok(ApplyOutcome::ignored()),
            Change::Unrecognized { namespace, reason } => {
                warn!(namespace = ?namespace, reason = %reason, "Ignoring unrecognized change");
                metrics::record_event_ignored("unrecognized");
                return Ok(ApplyOutcome::ignored());
            }
            other => other.namespace().unwrap_or_default(),
        };

        let Some(spec) = self.specs.get(namespace) else {
            debug!(namespace = %namespace, kind = change.kind(), "Skipping change for unmapped namespace");
            metrics::record_event_ignored("unknown_namespace");
            return Ok(ApplyOutcome::ignored());
        };

        let outcome = match change {
            Change::Insert { document, .. } => {
                self.upsert(spec, document).await?;
                ApplyOutcome { upserted: 1, ..Default::default() }
            }
            Change::UpdateByPatch { selector, .. } => {
                match self.source.find_one(spec, selector.clone()).await? {
                    Some(document) => {
                        self.upsert(spec, &document).await?;
                        ApplyOutcome { upserted: 1, ..Default::default() }
                    }
                    None => {
                        warn!(
                            namespace = %namespace,
                            selector = %selector,
                            "Updated document no longer exists, ignoring update"
                        );
                        metrics::record_event_ignored("update_target_gone");
                        return Ok(ApplyOutcome::ignored());
                    }
                }
            }
            Change::UpdateByReplacement { selector, replacement, .. } => {
                let document = merge_replacement(spec, selector, replacement);
                self.upsert(spec, &document).await?;
                ApplyOutcome { upserted: 1, ..Default::default() }
            }
            Change::Delete { selector, .. } => {
                let skip = match self.delete_mode {
                    DeleteMode::Ignore => Some("delete_mode_ignore"),
                    DeleteMode::IgnorePast if in_catch_up => Some("delete_before_start"),
                    _ => None,
                };
                if let Some(reason) = skip {
                    debug!(namespace = %namespace, selector = %selector, reason, "Ignoring delete");
                    metrics::record_event_ignored(reason);
                    return Ok(ApplyOutcome::ignored());
                }
                let deleted = self.delete(spec, selector).await?;
                ApplyOutcome { deleted, ..Default::default() }
            }
            Change::Batch(_) | Change::Noop | Change::Unrecognized { .. } => {
                return Ok(ApplyOutcome::ignored());
            }
        };

        metrics::record_event_applied(namespace, change.kind(), started.elapsed());
        Ok(outcome)
    }

    async fn upsert(&self, spec: &CollectionSpec, document: &Document) -> Result<u64> {
        let _guard = self.concurrency.lock_namespace(&spec.namespace).await;
        let mut conn = self.target.acquire().await?;
        upsert_document(&mut conn, spec, document)
            .await
            .map_err(|e| ReplicationError::row(&spec.namespace, codec::document_id(document), e))
    }

    async fn delete(&self, spec: &CollectionSpec, selector: &Document) -> Result<u64> {
        let Some((sql, params)) = delete_statement(spec, selector) else {
            warn!(namespace = %spec.namespace, selector = %selector, "Delete selector has no key fields, ignoring");
            metrics::record_event_ignored("delete_without_key");
            return Ok(0);
        };

        let _guard = self.concurrency.lock_namespace(&spec.namespace).await;
        let mut conn = self.target.acquire().await?;
        let deleted = conn
            .execute(&sql, &params)
            .await
            .map_err(|e| ReplicationError::row(&spec.namespace, codec::document_id(selector), e))?;

        if deleted != 1 {
            warn!(
                namespace = %spec.namespace,
                selector = %selector,
                rows = deleted,
                "Delete did not affect exactly one row"
            );
            metrics::record_row_count_anomaly(&spec.namespace, "delete");
        }
        Ok(deleted)
    }
}
