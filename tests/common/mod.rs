//! Shared test utilities for engine, chaos and integration tests.
//!
//! This module provides:
//! - PostgreSQL/MongoDB testcontainer setup
//! - In-memory `DocumentSource` and `TargetStore` mocks
//! - Mapping and oplog entry helpers

#![allow(dead_code)]

pub mod containers;
pub mod mock_source;
pub mod mock_target;

pub use containers::*;
pub use mock_source::*;
pub use mock_target::*;

use bson::{doc, Bson, Document, Timestamp};
use doc_replication_engine::spec::{
    CollectionMapping, CollectionSpec, ColumnMapping, MappingDocument, MetaMapping, SpecSet,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DB: &str = "app";
pub const USERS: &str = "app.users";
pub const ORDERS: &str = "app.orders";

/// `users(id text pk <- _id, name text, age integer)`
pub fn users_mapping() -> CollectionMapping {
    CollectionMapping {
        columns: vec![
            ColumnMapping::new("id", "text").with_source("_id"),
            ColumnMapping::new("name", "text"),
            ColumnMapping::new("age", "integer"),
        ],
        meta: MetaMapping::default(),
    }
}

/// `orders(id text pk <- _id, total bigint, updated_at timestamptz <- updatedAt)`
/// with `updated_at` as the incremental key.
pub fn orders_mapping() -> CollectionMapping {
    CollectionMapping {
        columns: vec![
            ColumnMapping::new("id", "text").with_source("_id"),
            ColumnMapping::new("total", "bigint"),
            ColumnMapping::new("updated_at", "timestamptz").with_source("updatedAt"),
        ],
        meta: MetaMapping {
            incremental_replication_key: Some("updated_at".into()),
            ..Default::default()
        },
    }
}

pub fn single_mapping(collections: Vec<(&str, CollectionMapping)>) -> MappingDocument {
    MappingDocument::Single(
        collections
            .into_iter()
            .map(|(name, mapping)| (name.to_string(), mapping))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn spec_set(collections: Vec<(&str, CollectionMapping)>) -> Arc<SpecSet> {
    Arc::new(SpecSet::build(&single_mapping(collections), Some(DB)).expect("valid mapping"))
}

pub fn spec(specs: &SpecSet, namespace: &str) -> Arc<CollectionSpec> {
    Arc::clone(specs.get(namespace).expect("namespace mapped"))
}

/// Target mock with every spec's table registered.
pub fn target_for(specs: &SpecSet, capacity: usize) -> MockTarget {
    let target = MockTarget::new(capacity);
    for spec in specs.iter() {
        target.register(spec);
    }
    target
}

pub fn ts(time: u32, increment: u32) -> Timestamp {
    Timestamp { time, increment }
}

pub fn date(rfc3339: &str) -> bson::DateTime {
    bson::DateTime::parse_rfc3339_str(rfc3339).expect("valid date")
}

pub fn user(id: &str, name: &str, age: i32) -> Document {
    doc! { "_id": id, "name": name, "age": age }
}

pub fn order(id: &str, total: i64, updated_at: &str) -> Document {
    doc! { "_id": id, "total": total, "updatedAt": date(updated_at) }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Oplog entries
// ═══════════════════════════════════════════════════════════════════════════════

pub fn op_insert(at: Timestamp, ns: &str, document: Document) -> Document {
    doc! { "ts": at, "op": "i", "ns": ns, "o": document }
}

pub fn op_patch(at: Timestamp, ns: &str, id: impl Into<Bson>, patch: Document) -> Document {
    let id: Bson = id.into();
    doc! { "ts": at, "op": "u", "ns": ns, "o2": { "_id": id }, "o": patch }
}

pub fn op_replace(at: Timestamp, ns: &str, id: impl Into<Bson>, replacement: Document) -> Document {
    let id: Bson = id.into();
    doc! { "ts": at, "op": "u", "ns": ns, "o2": { "_id": id }, "o": replacement }
}

pub fn op_delete(at: Timestamp, ns: &str, id: impl Into<Bson>) -> Document {
    let id: Bson = id.into();
    doc! { "ts": at, "op": "d", "ns": ns, "o": { "_id": id } }
}

pub fn op_batch(at: Timestamp, ops: Vec<Document>) -> Document {
    doc! { "ts": at, "op": "c", "ns": "admin.$cmd", "o": { "applyOps": ops } }
}
