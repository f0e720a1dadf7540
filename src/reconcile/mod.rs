// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deletion reconciliation.
//!
//! An incremental import only sees documents whose incremental key moved
//! past the target's high-water mark. Documents deleted from the source
//! before that never show up, so their rows linger in the target. The
//! reconciler removes them before the import runs.
//!
//! # Strategies
//!
//! ```text
//! LogReplay:  earliest temporal high-water mark → read operation log
//!             forward → group delete ids per namespace → staged
//!             DELETE ... USING in batches of 1000
//!
//! Bisection:  source and target keys ≤ high-water mark, both sorted
//!             here by (incremental key, primary key bytes) → bisect →
//!             DELETE the target keys missing on the source side
//! ```
//!
//! `Auto` picks log replay when the source exposes an operation log and
//! bisection otherwise. Log replay needs a delete key; namespaces without
//! one are skipped and listed in the [`ReconcileReport`].

mod bisect;
mod replay;

pub use bisect::find_deleted;

use crate::codec::{self, quote_ident, SqlValue};
use crate::concurrency::ConcurrencyController;
use crate::config::ReconcileStrategy;
use crate::error::{ReplicationError, Result, TargetError};
use crate::metrics;
use crate::source::{DocumentSource, FindQuery};
use crate::spec::{CollectionSpec, Column, SpecSet};
use crate::target::{read_high_water_mark, HighWaterMark, TargetConnection, TargetStore};
use bson::{doc, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Why a namespace was left out of reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Log replay matches deleted ids against the delete key.
    NoDeleteKey,
    /// Log replay positions the log by time; other keys can't be mapped.
    NonTemporalKey,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoDeleteKey => "no_delete_key",
            SkipReason::NonTemporalKey => "non_temporal_key",
        }
    }
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows deleted per namespace.
    pub deleted: BTreeMap<String, u64>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Operation log entries read by log replay.
    pub operations_scanned: u64,
}

impl ReconcileReport {
    pub fn total_deleted(&self) -> u64 {
        self.deleted.values().sum()
    }

    pub fn skipped_namespaces(&self) -> Vec<&str> {
        self.skipped.iter().map(|(ns, _)| ns.as_str()).collect()
    }

    fn add_deleted(&mut self, namespace: &str, count: u64) {
        *self.deleted.entry(namespace.to_string()).or_default() += count;
    }

    fn skip(&mut self, namespace: &str, reason: SkipReason) {
        warn!(namespace = %namespace, reason = reason.as_str(), "Skipping deletion reconciliation");
        metrics::record_reconcile_skipped(namespace, reason.as_str());
        self.skipped.push((namespace.to_string(), reason));
    }

    fn merge(&mut self, other: ReconcileReport) {
        for (namespace, count) in other.deleted {
            self.add_deleted(&namespace, count);
        }
        self.skipped.extend(other.skipped);
        self.operations_scanned += other.operations_scanned;
    }
}

/// Removes target rows whose documents were deleted from the source.
pub struct DeletionReconciler<S: DocumentSource, T: TargetStore> {
    specs: Arc<SpecSet>,
    source: Arc<S>,
    target: Arc<T>,
    concurrency: Arc<ConcurrencyController>,
}

impl<S: DocumentSource, T: TargetStore> DeletionReconciler<S, T> {
    pub fn new(
        specs: Arc<SpecSet>,
        source: Arc<S>,
        target: Arc<T>,
        concurrency: Arc<ConcurrencyController>,
    ) -> Self {
        Self {
            specs,
            source,
            target,
            concurrency,
        }
    }

    /// Reconcile every incrementally replicated namespace.
    pub async fn run(&self, strategy: ReconcileStrategy) -> Result<ReconcileReport> {
        let strategy = match strategy {
            ReconcileStrategy::Auto => {
                if self.source.has_operation_log().await? {
                    ReconcileStrategy::LogReplay
                } else {
                    ReconcileStrategy::Bisection
                }
            }
            other => other,
        };

        let marks = self.high_water_marks().await?;
        info!(strategy = ?strategy, namespaces = marks.len(), "Reconciling deletions");
        if marks.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let mut report = ReconcileReport::default();
        if matches!(strategy, ReconcileStrategy::LogReplay | ReconcileStrategy::Both) {
            report.merge(self.replay_operation_log(&marks).await?);
        }
        if matches!(strategy, ReconcileStrategy::Bisection | ReconcileStrategy::Both) {
            report.merge(self.bisect_all(&marks).await?);
        }

        info!(
            deleted = report.total_deleted(),
            skipped = report.skipped.len(),
            operations_scanned = report.operations_scanned,
            "Deletion reconciliation complete"
        );
        Ok(report)
    }

    /// High-water marks of every namespace with an incremental key and a
    /// non-empty table, in namespace order.
    async fn high_water_marks(&self) -> Result<Vec<(Arc<CollectionSpec>, HighWaterMark)>> {
        let mut conn = self.target.acquire().await?;
        let mut marks = Vec::new();
        for namespace in self.specs.namespaces() {
            let Some(spec) = self.specs.get(&namespace) else { continue };
            if spec.incremental_key().is_none() {
                continue;
            }
            match read_high_water_mark(&mut conn, spec)
                .await
                .map_err(|e| ReplicationError::reconcile(&namespace, e.into()))?
            {
                Some(mark) => {
                    debug!(namespace = %namespace, high_water_mark = %mark, "Read high-water mark");
                    marks.push((Arc::clone(spec), mark));
                }
                None => debug!(namespace = %namespace, "Empty target table, nothing to reconcile"),
            }
        }
        Ok(marks)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Bisection
    // ═══════════════════════════════════════════════════════════════════════════

    async fn bisect_all(&self, marks: &[(Arc<CollectionSpec>, HighWaterMark)]) -> Result<ReconcileReport> {
        let capacity = self.concurrency.capacity();
        let results: Vec<(String, u64)> = futures::stream::iter(marks)
            .map(|(spec, mark)| async move {
                let deleted = self
                    .bisect_namespace(spec, mark)
                    .await
                    .map_err(|e| ReplicationError::reconcile(&spec.namespace, e))?;
                Ok::<_, ReplicationError>((spec.namespace.clone(), deleted))
            })
            .buffer_unordered(capacity)
            .try_collect()
            .await?;

        let mut report = ReconcileReport::default();
        for (namespace, deleted) in results {
            report.add_deleted(&namespace, deleted);
        }
        Ok(report)
    }

    async fn bisect_namespace(&self, spec: &CollectionSpec, mark: &HighWaterMark) -> Result<u64> {
        let span = info_span!("bisect", namespace = %spec.namespace);
        async {
            let Some(key) = spec.incremental_key() else { return Ok(0) };
            let _guard = self.concurrency.lock_namespace(&spec.namespace).await;

            let mut filter = Document::new();
            filter.insert(key.source.clone(), doc! { "$lte": mark.to_bson() });
            let query = FindQuery::new(filter).projection(Some(spec.key_projection()));

            let mut source_records: Vec<(KeyValue, Vec<String>)> = self
                .source
                .find(spec, query)
                .await?
                .try_filter_map(|document| async move { Ok(source_record(spec, key, &document)) })
                .try_collect()
                .await?;

            let mut conn = self.target.acquire().await?;
            let mut target_records = conn
                .query_text(&target_keys_sql(spec), &[mark.to_param()])
                .await?
                .into_iter()
                .map(|row| target_record(spec, key, row))
                .collect::<Result<Vec<_>>>()?;

            // The stores disagree on tie order and text collation.
            source_records.sort();
            target_records.sort();
            let source_keys: Vec<Vec<String>> = source_records.into_iter().map(|(_, k)| k).collect();
            let target_keys: Vec<Vec<String>> = target_records.into_iter().map(|(_, k)| k).collect();

            let doomed = find_deleted(&source_keys, &target_keys);
            info!(
                source = source_keys.len(),
                target = target_keys.len(),
                deleted = doomed.len(),
                "Bisection diff complete"
            );
            if doomed.is_empty() {
                return Ok(0);
            }

            let deleted = delete_keys(&mut conn, spec, &doomed).await?;
            metrics::record_reconcile_deleted(&spec.namespace, "bisection", deleted);
            Ok::<_, ReplicationError>(deleted)
        }
        .instrument(span)
        .await
    }
}

/// Incremental key value as both stores can produce it: epoch milliseconds
/// for temporal keys, numbers for numeric keys, text otherwise.
///
/// Records are bisected in `(KeyValue, primary key text)` order. Text
/// compares bytewise.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl KeyValue {
    /// Parse the text form of an incremental key value of `column`.
    pub fn parse(column: &Column, raw: &str) -> Option<Self> {
        if column.is_temporal() || column.is_integer() {
            raw.trim().parse().ok().map(KeyValue::Int)
        } else if column.is_floating() {
            raw.trim().parse().ok().map(KeyValue::Float)
        } else {
            Some(KeyValue::Text(raw.to_string()))
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyValue::Int(_) | KeyValue::Float(_) => 0,
            KeyValue::Text(_) => 1,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => a.total_cmp(b),
            (KeyValue::Int(a), KeyValue::Float(b)) => (*a as f64).total_cmp(b),
            (KeyValue::Float(a), KeyValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (KeyValue::Text(a), KeyValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

/// Primary key of a source document, as the text the target would return.
fn record_key(spec: &CollectionSpec, document: &Document) -> Vec<String> {
    spec.primary_key()
        .map(|column| {
            codec::coerce(column, codec::lookup_path(document, &column.source))
                .to_plain_text()
                .unwrap_or_default()
        })
        .collect()
}

/// Incremental key value and primary key of a source document. `None` when
/// the key field is absent or has no comparable form.
fn source_record(
    spec: &CollectionSpec,
    key: &Column,
    document: &Document,
) -> Option<(KeyValue, Vec<String>)> {
    let value = codec::lookup_path(document, &key.source)?;
    let raw = if key.is_temporal() {
        match value {
            Bson::DateTime(dt) => dt.timestamp_millis().to_string(),
            _ => return None,
        }
    } else {
        codec::coerce(key, Some(value)).to_plain_text()?
    };
    Some((KeyValue::parse(key, &raw)?, record_key(spec, document)))
}

/// Split a row of [`target_keys_sql`] into its incremental key value and
/// primary key.
fn target_record(
    spec: &CollectionSpec,
    key: &Column,
    mut row: Vec<Option<String>>,
) -> Result<(KeyValue, Vec<String>)> {
    let raw = row.pop().flatten().unwrap_or_default();
    let value = KeyValue::parse(key, &raw).ok_or_else(|| {
        TargetError::new(
            None,
            format!("unexpected {} value {:?} in \"{}\"", key.name, raw, spec.target_table),
        )
    })?;
    Ok((value, row.into_iter().map(Option::unwrap_or_default).collect()))
}

/// Target primary keys and incremental key values at or below the
/// high-water mark bound to `$1`. NULL keys never match, like the source's
/// `$lte`.
fn target_keys_sql(spec: &CollectionSpec) -> String {
    let mut selected: Vec<String> = spec
        .primary_key()
        .map(|c| format!("{}::text", quote_ident(&c.name)))
        .collect();
    let Some(key) = spec.incremental_key() else {
        return format!("SELECT {} FROM {}", selected.join(", "), quote_ident(&spec.target_table));
    };
    let column = quote_ident(&key.name);
    let (value, bound) = if key.is_temporal() {
        let millis = format!("(EXTRACT(EPOCH FROM {}) * 1000)::bigint", column);
        (format!("{}::text", millis), format!("{} <= $1", millis))
    } else if key.is_integer() || key.is_floating() {
        (format!("{}::text", column), format!("{} <= $1", column))
    } else {
        (
            format!("{}::text", column),
            format!("{}::text COLLATE \"C\" <= $1", column),
        )
    };
    selected.push(value);
    format!(
        "SELECT {} FROM {} WHERE {}",
        selected.join(", "),
        quote_ident(&spec.target_table),
        bound
    )
}

fn delete_by_key_sql(spec: &CollectionSpec) -> String {
    let matches: Vec<String> = spec
        .primary_key()
        .enumerate()
        .map(|(i, c)| format!("{}::text = ${}", quote_ident(&c.name), i + 1))
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&spec.target_table),
        matches.join(" AND ")
    )
}

/// Delete `keys` in one transaction.
async fn delete_keys<C>(conn: &mut C, spec: &CollectionSpec, keys: &[Vec<String>]) -> Result<u64>
where
    C: TargetConnection + ?Sized,
{
    let sql = delete_by_key_sql(spec);
    conn.begin().await?;
    let mut deleted = 0;
    for key in keys {
        let params: Vec<SqlValue> = key.iter().cloned().map(SqlValue::Text).collect();
        match conn.execute(&sql, &params).await {
            Ok(n) => deleted += n,
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!(error = %rollback, "Rollback after failed delete failed");
                }
                return Err(e.into());
            }
        }
    }
    conn.commit().await?;
    Ok(deleted)
}
