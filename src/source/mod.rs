// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document source abstraction.
//!
//! Everything the engine reads from the document store goes through
//! [`DocumentSource`]: collection scans for import and bisection, point
//! lookups for patch updates, the operation log for deletion replay, and
//! the live change feed.

pub mod mongo;

pub use mongo::MongoSource;

use crate::error::Result;
use crate::spec::CollectionSpec;
use bson::{Document, Timestamp};
use chrono::Utc;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by source operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of raw documents (collection rows, oplog entries or change events).
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// A collection query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Document,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

impl FindQuery {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn projection(mut self, projection: Option<Document>) -> Self {
        self.projection = projection;
        self
    }
}

/// Where the live feed starts.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedStart {
    /// Oplog entries strictly after `after`.
    Oplog { after: Timestamp },
    /// Change stream resumed after a token, or started at a cluster time.
    ChangeStream {
        resume_after: Option<Document>,
        start_at: Option<Timestamp>,
    },
}

/// Read side of the replication engine.
pub trait DocumentSource: Send + Sync + 'static {
    /// Scan a collection.
    fn find<'a>(&'a self, spec: &'a CollectionSpec, query: FindQuery) -> BoxFuture<'a, DocumentStream>;

    /// Fetch the current version of one document, projected to the mapped columns.
    fn find_one<'a>(
        &'a self,
        spec: &'a CollectionSpec,
        selector: Document,
    ) -> BoxFuture<'a, Option<Document>>;

    /// Whether the deployment exposes an operation log.
    fn has_operation_log(&self) -> BoxFuture<'_, bool>;

    /// Timestamp of the newest operation log entry, if there is a log.
    fn head_timestamp(&self) -> BoxFuture<'_, Option<Timestamp>>;

    /// Operation log entries after `after`. The stream ends at the current head.
    fn read_operation_log(&self, after: Timestamp) -> BoxFuture<'_, DocumentStream>;

    /// Open the live feed restricted to `namespaces`. The stream does not end
    /// on its own.
    fn open_feed<'a>(&'a self, start: FeedStart, namespaces: &'a [String]) -> BoxFuture<'a, DocumentStream>;
}

/// Timestamp for "now" on the local clock, used when the source has no log head.
pub fn local_timestamp() -> Timestamp {
    let secs = Utc::now().timestamp().max(0);
    Timestamp {
        time: u32::try_from(secs).unwrap_or(u32::MAX),
        increment: 0,
    }
}

/// Order two timestamps by time, then increment.
pub fn timestamp_key(ts: Timestamp) -> (u32, u32) {
    (ts.time, ts.increment)
}
