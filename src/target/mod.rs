// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational target abstraction.
//!
//! The importer, reconciler and applier talk to the target only through
//! these traits, so tests can run against an in-memory mock and production
//! runs against [`PgTarget`].
//!
//! # Connections
//!
//! A [`TargetConnection`] is one session checked out of the pool. Staging
//! tables are session-local, so everything that stages data (incremental
//! imports, log replay deletions) does its work on a single connection.

pub mod postgres;

pub use postgres::{PgTarget, PgTargetConnection};

use crate::codec::{quote_ident, SqlValue};
use crate::error::TargetError;
use crate::spec::CollectionSpec;
use bson::Bson;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Boxed future returned by target operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TargetResult<T>> + Send + 'a>>;

/// One session on the relational target.
pub trait TargetConnection: Send {
    /// Execute one statement and return the affected row count.
    ///
    /// Statements without parameters may contain several `;`-separated
    /// commands.
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [SqlValue]) -> BoxFuture<'a, u64>;

    /// Stream `data` (COPY text format) into a `COPY ... FROM STDIN` statement.
    fn copy_in<'a>(&'a mut self, statement: &'a str, data: Vec<u8>) -> BoxFuture<'a, u64>;

    /// Run a query whose selected columns are all text (or cast to text).
    fn query_text<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, Vec<Vec<Option<String>>>>;

    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.execute("BEGIN", &[]).await.map(drop) })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.execute("COMMIT", &[]).await.map(drop) })
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.execute("ROLLBACK", &[]).await.map(drop) })
    }
}

/// Connection pool on the relational target.
pub trait TargetStore: Send + Sync + 'static {
    type Connection: TargetConnection + 'static;

    /// Check a connection out of the pool. Returned on drop.
    fn acquire(&self) -> BoxFuture<'_, Self::Connection>;

    /// Pool size.
    fn capacity(&self) -> usize;
}

// ═══════════════════════════════════════════════════════════════════════════════
// High-water marks
// ═══════════════════════════════════════════════════════════════════════════════

/// Largest incremental key value present in a target table.
#[derive(Debug, Clone, PartialEq)]
pub enum HighWaterMark {
    Time(DateTime<Utc>),
    Int(i64),
    Float(f64),
    Text(String),
}

impl HighWaterMark {
    /// Value usable in a source query filter.
    pub fn to_bson(&self) -> Bson {
        match self {
            HighWaterMark::Time(t) => Bson::DateTime(bson::DateTime::from_chrono(*t)),
            HighWaterMark::Int(i) => Bson::Int64(*i),
            HighWaterMark::Float(f) => Bson::Double(*f),
            HighWaterMark::Text(s) => Bson::String(s.clone()),
        }
    }

    /// Bound parameter for target filters. Temporal marks are epoch
    /// milliseconds, like the `MAX()` they were read from.
    pub fn to_param(&self) -> SqlValue {
        match self {
            HighWaterMark::Time(t) => SqlValue::Int(t.timestamp_millis()),
            HighWaterMark::Int(i) => SqlValue::Int(*i),
            HighWaterMark::Float(f) => SqlValue::Float(*f),
            HighWaterMark::Text(s) => SqlValue::Text(s.clone()),
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            HighWaterMark::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl std::fmt::Display for HighWaterMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HighWaterMark::Time(t) => write!(f, "{}", t.to_rfc3339()),
            HighWaterMark::Int(i) => write!(f, "{}", i),
            HighWaterMark::Float(v) => write!(f, "{}", v),
            HighWaterMark::Text(s) => f.write_str(s),
        }
    }
}

/// `SELECT MAX(key)` as text. Temporal keys come back as epoch milliseconds.
pub fn max_value_sql(spec: &CollectionSpec) -> Option<String> {
    let key = spec.incremental_key()?;
    let column = quote_ident(&key.name);
    let table = quote_ident(&spec.target_table);
    Some(if key.is_temporal() {
        format!(
            "SELECT (EXTRACT(EPOCH FROM MAX({})) * 1000)::bigint::text FROM {}",
            column, table
        )
    } else {
        format!("SELECT MAX({})::text FROM {}", column, table)
    })
}

/// Read the high-water mark of `spec`'s table. `None` when the namespace has
/// no incremental key or the table is empty.
pub async fn read_high_water_mark<C>(
    conn: &mut C,
    spec: &CollectionSpec,
) -> TargetResult<Option<HighWaterMark>>
where
    C: TargetConnection + ?Sized,
{
    let (Some(sql), Some(key)) = (max_value_sql(spec), spec.incremental_key()) else {
        return Ok(None);
    };
    let rows = conn.query_text(&sql, &[]).await?;
    let Some(raw) = rows.into_iter().next().and_then(|row| row.into_iter().next()).flatten() else {
        return Ok(None);
    };

    let unexpected = || {
        TargetError::new(
            None,
            format!("unexpected MAX({}) value {:?} in \"{}\"", key.name, raw, spec.target_table),
        )
    };
    let mark = if key.is_temporal() {
        let millis: i64 = raw.trim().parse().map_err(|_| unexpected())?;
        HighWaterMark::Time(DateTime::from_timestamp_millis(millis).ok_or_else(unexpected)?)
    } else if key.is_integer() {
        HighWaterMark::Int(raw.trim().parse().map_err(|_| unexpected())?)
    } else if key.is_floating() {
        HighWaterMark::Float(raw.trim().parse().map_err(|_| unexpected())?)
    } else {
        HighWaterMark::Text(raw)
    };
    Ok(Some(mark))
}
