// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL target backed by an sqlx pool.
//!
//! Statements without parameters go through the simple query protocol, so
//! multi-command strings (`CREATE ...; DROP ...`) and transaction control
//! work. Parameterized statements are prepared and bound with the types from
//! [`SqlValue`]; the `$n::type` casts in the SQL do the final conversion.

use super::{BoxFuture, TargetConnection, TargetStore};
use crate::codec::SqlValue;
use crate::config::TargetConfig;
use crate::error::{ReplicationError, Result, TargetError};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Connection pool on a PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgTarget {
    pool: PgPool,
    capacity: usize,
}

impl PgTarget {
    /// Open a pool of `capacity` connections and check one out to verify
    /// the server is reachable.
    pub async fn connect(config: &TargetConfig, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| ReplicationError::Config(format!("Invalid target url: {}", e)))?
            .application_name(&config.application_name);

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(u32::try_from(capacity).unwrap_or(u32::MAX))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| ReplicationError::connection("postgres", e.to_string()))?;

        info!(capacity, "Connected to target database");
        Ok(Self { pool, capacity })
    }

    pub fn from_pool(pool: PgPool, capacity: usize) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Target pool closed");
    }
}

impl TargetStore for PgTarget {
    type Connection = PgTargetConnection;

    fn acquire(&self) -> BoxFuture<'_, Self::Connection> {
        Box::pin(async move {
            let conn = self.pool.acquire().await?;
            Ok::<_, TargetError>(PgTargetConnection { conn })
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One pooled PostgreSQL session.
pub struct PgTargetConnection {
    conn: PoolConnection<Postgres>,
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) | SqlValue::Json(s) => query.bind(s.as_str()),
        };
    }
    query
}

impl TargetConnection for PgTargetConnection {
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [SqlValue]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let conn: &'a mut sqlx::PgConnection = &mut self.conn;
            let result = if params.is_empty() {
                sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?
            } else {
                bind_params(sqlx::query(sql), params)
                    .execute(conn)
                    .await?
            };
            Ok::<_, TargetError>(result.rows_affected())
        })
    }

    fn copy_in<'a>(&'a mut self, statement: &'a str, data: Vec<u8>) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut copy = self.conn.copy_in_raw(statement).await?;
            let sent = copy.send(data).await.map(drop);
            if let Err(e) = sent {
                // Leave the session usable for the row-level fallback.
                let _ = copy.abort(e.to_string()).await;
                return Err(e.into());
            }
            let rows = copy.finish().await?;
            Ok::<_, TargetError>(rows)
        })
    }

    fn query_text<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, Vec<Vec<Option<String>>>> {
        Box::pin(async move {
            let rows = bind_params(sqlx::query(sql), params)
                .fetch_all(&mut *self.conn)
                .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let mut values = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    values.push(row.try_get::<Option<String>, _>(i)?);
                }
                out.push(values);
            }
            Ok::<_, TargetError>(out)
        })
    }
}
