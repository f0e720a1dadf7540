// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation log replay.

use super::{DeletionReconciler, ReconcileReport, SkipReason};
use crate::codec::{self, quote_ident};
use crate::error::{ReplicationError, Result};
use crate::feed::{parse_oplog_entry, Change};
use crate::metrics;
use crate::source::DocumentSource;
use crate::spec::CollectionSpec;
use crate::target::{HighWaterMark, TargetConnection, TargetResult, TargetStore};
use bson::Timestamp;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Deleted ids staged per namespace before a batch delete is issued.
pub(crate) const DELETE_BATCH_SIZE: usize = 1000;

impl<S: DocumentSource, T: TargetStore> DeletionReconciler<S, T> {
    pub(super) async fn replay_operation_log(
        &self,
        marks: &[(Arc<CollectionSpec>, HighWaterMark)],
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut replicable: HashMap<String, Arc<CollectionSpec>> = HashMap::new();
        let mut earliest: Option<DateTime<Utc>> = None;

        for (spec, mark) in marks {
            if spec.delete_key.is_none() {
                report.skip(&spec.namespace, SkipReason::NoDeleteKey);
                continue;
            }
            let Some(time) = mark.as_time() else {
                report.skip(&spec.namespace, SkipReason::NonTemporalKey);
                continue;
            };
            earliest = Some(earliest.map_or(time, |e| e.min(time)));
            replicable.insert(spec.namespace.clone(), Arc::clone(spec));
        }

        let Some(earliest) = earliest else {
            return Ok(report);
        };
        let start = Timestamp {
            time: u32::try_from(earliest.timestamp()).unwrap_or(0),
            increment: 0,
        };
        info!(
            from = %earliest.to_rfc3339(),
            namespaces = replicable.len(),
            "Replaying operation log for deletions"
        );

        let mut entries = self.source.read_operation_log(start).await?;
        let mut pending: HashMap<String, Vec<String>> = HashMap::new();
        let mut scanned: u64 = 0;

        while let Some(entry) = entries.try_next().await? {
            scanned += 1;
            let event = parse_oplog_entry(&entry);
            for change in event.change.flatten() {
                let Change::Delete { namespace, selector } = change else { continue };
                let Some(spec) = replicable.get(namespace) else { continue };
                let Some(id) = selector.get("_id") else {
                    warn!(namespace = %namespace, "Delete entry without _id");
                    continue;
                };

                let ids = pending.entry(namespace.clone()).or_default();
                ids.push(codec::key_text(id));
                if ids.len() >= DELETE_BATCH_SIZE {
                    let batch = std::mem::take(ids);
                    let deleted = self.flush_deletions(spec, batch).await?;
                    report.add_deleted(namespace, deleted);
                }
            }
        }
        metrics::record_oplog_scanned(scanned);
        report.operations_scanned = scanned;

        let remainder: Vec<(String, u64)> = futures::stream::iter(
            pending.into_iter().filter(|(_, ids)| !ids.is_empty()),
        )
        .map(|(namespace, ids)| {
            let spec = replicable.get(&namespace).cloned();
            async move {
                let deleted = match spec {
                    Some(spec) => self.flush_deletions(&spec, ids).await?,
                    None => 0,
                };
                Ok::<_, ReplicationError>((namespace, deleted))
            }
        })
        .buffer_unordered(self.concurrency.capacity())
        .try_collect()
        .await?;

        for (namespace, deleted) in remainder {
            report.add_deleted(&namespace, deleted);
        }
        Ok(report)
    }

    /// Delete the rows whose delete key matches one of `ids`.
    async fn flush_deletions(&self, spec: &CollectionSpec, mut ids: Vec<String>) -> Result<u64> {
        let Some(delete_key) = spec.delete_key.as_deref() else {
            return Ok(0);
        };
        ids.sort_unstable();
        ids.dedup();

        let _guard = self.concurrency.lock_namespace(&spec.namespace).await;
        let mut conn = self
            .target
            .acquire()
            .await
            .map_err(|e| ReplicationError::reconcile(&spec.namespace, e.into()))?;

        let staging = format!("{}_del_temp", spec.target_table);
        let deleted = match staged_delete(&mut conn, spec, delete_key, &staging, &ids).await {
            Ok(deleted) => deleted,
            Err(e) => {
                if let Err(drop_err) = conn.execute(&codec::drop_table_sql(&staging), &[]).await {
                    warn!(error = %drop_err, "Could not drop staging table");
                }
                return Err(ReplicationError::reconcile(&spec.namespace, e.into()));
            }
        };

        metrics::record_reconcile_deleted(&spec.namespace, "log_replay", deleted);
        info!(
            namespace = %spec.namespace,
            ids = ids.len(),
            deleted,
            "Flushed replayed deletions"
        );
        Ok(deleted)
    }
}

pub(crate) fn staged_delete_sql(spec: &CollectionSpec, delete_key: &str, staging: &str) -> String {
    let target = quote_ident(&spec.target_table);
    let staged = quote_ident(staging);
    let key = quote_ident(delete_key);
    format!(
        "DELETE FROM {} USING {} WHERE {}.{}::text = {}.{}",
        target, staged, target, key, staged, key
    )
}

async fn staged_delete<C>(
    conn: &mut C,
    spec: &CollectionSpec,
    delete_key: &str,
    staging: &str,
    ids: &[String],
) -> TargetResult<u64>
where
    C: TargetConnection + ?Sized,
{
    let staged = quote_ident(staging);
    let key = quote_ident(delete_key);

    conn.execute(&codec::drop_table_sql(staging), &[]).await?;
    conn.execute(
        &format!("CREATE TEMP TABLE {} ({} TEXT PRIMARY KEY)", staged, key),
        &[],
    )
    .await?;

    let mut data = String::new();
    for id in ids {
        data.push_str(&codec::escape_text(id));
        data.push('\n');
    }
    conn.copy_in(&format!("COPY {} ({}) FROM STDIN", staged, key), data.into_bytes())
        .await?;

    let deleted = conn
        .execute(&staged_delete_sql(spec, delete_key, staging), &[])
        .await?;
    conn.execute(&format!("DROP TABLE {}", staged), &[]).await?;
    Ok(deleted)
}
