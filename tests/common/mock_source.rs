// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory document source.
//!
//! Holds collections, an operation log and a scripted change feed. Supports
//! the subset of query syntax the engine sends: equality plus `$gt`, `$gte`,
//! `$lt` and `$lte` on dotted paths, and multi-key sorts.

use bson::{Bson, Document, Timestamp};
use doc_replication_engine::codec::lookup_path;
use doc_replication_engine::error::{ReplicationError, Result};
use doc_replication_engine::source::{BoxFuture, DocumentSource, DocumentStream, FeedStart, FindQuery};
use doc_replication_engine::spec::CollectionSpec;
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct SourceState {
    collections: HashMap<String, Vec<Document>>,
    oplog: Vec<Document>,
    has_log: bool,
    head: Option<Timestamp>,
    feed: Vec<Result<Document>>,
    feed_stays_open: bool,
    find_failure: Option<String>,
    finds: Vec<(String, FindQuery)>,
    lookups: Vec<(String, Document)>,
    feed_starts: Vec<(FeedStart, Vec<String>)>,
    oplog_reads: Vec<Timestamp>,
}

/// Mock [`DocumentSource`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<SourceState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source with an operation log whose head is `head`.
    pub fn with_log(head: Timestamp) -> Self {
        let source = Self::new();
        {
            let mut state = source.lock();
            state.has_log = true;
            state.head = Some(head);
        }
        source
    }

    pub fn insert(&self, namespace: &str, document: Document) {
        self.lock()
            .collections
            .entry(namespace.to_string())
            .or_default()
            .push(document);
    }

    pub fn insert_many(&self, namespace: &str, documents: impl IntoIterator<Item = Document>) {
        for document in documents {
            self.insert(namespace, document);
        }
    }

    /// Remove documents whose `_id` equals `id`.
    pub fn remove(&self, namespace: &str, id: &Bson) {
        if let Some(documents) = self.lock().collections.get_mut(namespace) {
            documents.retain(|d| d.get("_id") != Some(id));
        }
    }

    pub fn push_oplog(&self, entry: Document) {
        self.lock().oplog.push(entry);
    }

    pub fn set_head(&self, head: Option<Timestamp>) {
        self.lock().head = head;
    }

    /// Queue a raw event on the live feed.
    pub fn push_feed(&self, event: Document) {
        self.lock().feed.push(Ok(event));
    }

    /// Queue a feed error; the feed yields it after the events before it.
    pub fn push_feed_error(&self, message: &str) {
        self.lock().feed.push(Err(ReplicationError::mongo_msg("change feed", message)));
    }

    /// Keep the feed open after the queued events instead of ending it.
    pub fn keep_feed_open(&self) {
        self.lock().feed_stays_open = true;
    }

    pub fn fail_finds(&self, message: &str) {
        self.lock().find_failure = Some(message.to_string());
    }

    pub fn finds(&self) -> Vec<(String, FindQuery)> {
        self.lock().finds.clone()
    }

    pub fn lookups(&self) -> Vec<(String, Document)> {
        self.lock().lookups.clone()
    }

    pub fn feed_starts(&self) -> Vec<(FeedStart, Vec<String>)> {
        self.lock().feed_starts.clone()
    }

    pub fn oplog_reads(&self) -> Vec<Timestamp> {
        self.lock().oplog_reads.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().expect("mock source poisoned")
    }
}

impl DocumentSource for MockSource {
    fn find<'a>(&'a self, spec: &'a CollectionSpec, query: FindQuery) -> BoxFuture<'a, DocumentStream> {
        let result = (|| -> Result<DocumentStream> {
            let mut state = self.lock();
            state.finds.push((spec.namespace.clone(), query.clone()));
            if let Some(message) = &state.find_failure {
                return Err(ReplicationError::mongo_msg("find", message.clone()));
            }
            let mut documents: Vec<Document> = state
                .collections
                .get(&spec.namespace)
                .map(|docs| docs.iter().filter(|d| matches(d, &query.filter)).cloned().collect())
                .unwrap_or_default();
            if let Some(sort) = &query.sort {
                documents.sort_by(|a, b| sort_order(a, b, sort));
            }
            let stream: DocumentStream = stream::iter(documents.into_iter().map(Ok)).boxed();
            Ok(stream)
        })();
        Box::pin(async move { result })
    }

    fn find_one<'a>(&'a self, spec: &'a CollectionSpec, selector: Document) -> BoxFuture<'a, Option<Document>> {
        let found = {
            let mut state = self.lock();
            state.lookups.push((spec.namespace.clone(), selector.clone()));
            state
                .collections
                .get(&spec.namespace)
                .and_then(|docs| docs.iter().find(|d| matches(d, &selector)).cloned())
        };
        Box::pin(async move { Ok(found) })
    }

    fn has_operation_log(&self) -> BoxFuture<'_, bool> {
        let has_log = self.lock().has_log;
        Box::pin(async move { Ok(has_log) })
    }

    fn head_timestamp(&self) -> BoxFuture<'_, Option<Timestamp>> {
        let head = self.lock().head;
        Box::pin(async move { Ok(head) })
    }

    fn read_operation_log(&self, after: Timestamp) -> BoxFuture<'_, DocumentStream> {
        let entries: Vec<Document> = {
            let mut state = self.lock();
            state.oplog_reads.push(after);
            state
                .oplog
                .iter()
                .filter(|e| {
                    e.get_timestamp("ts")
                        .map(|ts| (ts.time, ts.increment) > (after.time, after.increment))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        Box::pin(async move {
            let stream: DocumentStream = stream::iter(entries.into_iter().map(Ok)).boxed();
            Ok(stream)
        })
    }

    fn open_feed<'a>(&'a self, start: FeedStart, namespaces: &'a [String]) -> BoxFuture<'a, DocumentStream> {
        let (events, stays_open) = {
            let mut state = self.lock();
            state.feed_starts.push((start, namespaces.to_vec()));
            (std::mem::take(&mut state.feed), state.feed_stays_open)
        };
        Box::pin(async move {
            let queued = stream::iter(events);
            let stream: DocumentStream = if stays_open {
                queued.chain(stream::pending()).boxed()
            } else {
                queued.boxed()
            };
            Ok(stream)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Query evaluation
// ═══════════════════════════════════════════════════════════════════════════════

fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    let number = |v: &Bson| match v {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    };
    match (a, b) {
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => number(a)?.partial_cmp(&number(b)?),
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, condition)| {
        let value = lookup_path(document, path);
        match condition {
            Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) => ops.iter().all(|(op, bound)| {
                let Some(ordering) = value.and_then(|v| compare(v, bound)) else {
                    return false;
                };
                match op.as_str() {
                    "$gt" => ordering == Ordering::Greater,
                    "$gte" => ordering != Ordering::Less,
                    "$lt" => ordering == Ordering::Less,
                    "$lte" => ordering != Ordering::Greater,
                    _ => false,
                }
            }),
            expected => value == Some(expected),
        }
    })
}

fn sort_order(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort {
        let ordering = match (lookup_path(a, path), lookup_path(b, path)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = if direction.as_i32() == Some(-1) { ordering.reverse() } else { ordering };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}
