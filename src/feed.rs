// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed normalization.
//!
//! Oplog entries and change stream events are turned into one [`Change`]
//! vocabulary before anything is applied. Parsing never fails: input the
//! engine does not understand becomes [`Change::Unrecognized`] and is logged
//! by the applier.
//!
//! # Oplog Mapping
//!
//! | `op` | Condition | Change |
//! |------|-----------|--------|
//! | `i` | namespace ends in `.system.indexes` | `Noop` |
//! | `i` | | `Insert { document: o }` |
//! | `u` | `o` has `$`-prefixed keys | `UpdateByPatch { selector: o2 }` |
//! | `u` | | `UpdateByReplacement { selector: o2, replacement: o }` |
//! | `d` | | `Delete { selector: o }` |
//! | `c` | `o.applyOps` present | `Batch` of the nested entries |
//! | `c` | | `Noop` |
//! | `n` | | `Noop` |
//!
//! # Positions
//!
//! Every event carries the position it was read at. Positions encode to a
//! string for the cursor store:
//!
//! ```text
//! oplog:<seconds>:<increment>
//! change_stream:<hex of the BSON resume token>
//! ```

use crate::config::FeedKind;
use crate::error::{ReplicationError, Result};
use crate::source::FeedStart;
use bson::{Bson, Document, Timestamp};

/// Position of an event in the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPosition {
    Oplog(Timestamp),
    ChangeStream {
        token: Document,
        cluster_time: Option<Timestamp>,
    },
}

impl FeedPosition {
    /// Cluster time of the event, when known.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            FeedPosition::Oplog(ts) => Some(*ts),
            FeedPosition::ChangeStream { cluster_time, .. } => *cluster_time,
        }
    }

    pub fn kind(&self) -> FeedKind {
        match self {
            FeedPosition::Oplog(_) => FeedKind::Oplog,
            FeedPosition::ChangeStream { .. } => FeedKind::ChangeStream,
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            FeedPosition::Oplog(ts) => Ok(format!("oplog:{}:{}", ts.time, ts.increment)),
            FeedPosition::ChangeStream { token, .. } => {
                let bytes = bson::to_vec(token).map_err(|e| {
                    ReplicationError::Internal(format!("could not encode resume token: {}", e))
                })?;
                Ok(format!("change_stream:{}", hex::encode(bytes)))
            }
        }
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let invalid = |why: &str| ReplicationError::Stream(format!("invalid feed cursor {:?}: {}", encoded, why));

        if let Some(rest) = encoded.strip_prefix("oplog:") {
            let (time, increment) = rest.split_once(':').ok_or_else(|| invalid("missing increment"))?;
            return Ok(FeedPosition::Oplog(Timestamp {
                time: time.parse().map_err(|_| invalid("bad seconds"))?,
                increment: increment.parse().map_err(|_| invalid("bad increment"))?,
            }));
        }
        if let Some(rest) = encoded.strip_prefix("change_stream:") {
            let bytes = hex::decode(rest).map_err(|_| invalid("bad hex"))?;
            let token = Document::from_reader(bytes.as_slice()).map_err(|_| invalid("bad token"))?;
            return Ok(FeedPosition::ChangeStream {
                token,
                cluster_time: None,
            });
        }
        Err(invalid("unknown feed kind"))
    }

    /// Feed start that resumes strictly after this position.
    pub fn resume_point(&self) -> FeedStart {
        match self {
            FeedPosition::Oplog(ts) => FeedStart::Oplog { after: *ts },
            FeedPosition::ChangeStream { token, .. } => FeedStart::ChangeStream {
                resume_after: Some(token.clone()),
                start_at: None,
            },
        }
    }
}

/// A normalized change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        namespace: String,
        document: Document,
    },
    /// Field-level update; the full document has to be fetched again.
    UpdateByPatch {
        namespace: String,
        selector: Document,
    },
    /// Whole-document replacement.
    UpdateByReplacement {
        namespace: String,
        selector: Document,
        replacement: Document,
    },
    Delete {
        namespace: String,
        selector: Document,
    },
    /// Nested changes applied in order (`applyOps`).
    Batch(Vec<Change>),
    Noop,
    Unrecognized {
        namespace: Option<String>,
        reason: String,
    },
}

impl Change {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Change::Insert { namespace, .. }
            | Change::UpdateByPatch { namespace, .. }
            | Change::UpdateByReplacement { namespace, .. }
            | Change::Delete { namespace, .. } => Some(namespace),
            Change::Unrecognized { namespace, .. } => namespace.as_deref(),
            Change::Batch(_) | Change::Noop => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::UpdateByPatch { .. } => "update_patch",
            Change::UpdateByReplacement { .. } => "update_replace",
            Change::Delete { .. } => "delete",
            Change::Batch(_) => "batch",
            Change::Noop => "noop",
            Change::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Leaf changes in application order. Nested batches are expanded
    /// without recursion.
    pub fn flatten(&self) -> Vec<&Change> {
        let mut leaves = Vec::new();
        let mut stack = vec![self];
        while let Some(change) = stack.pop() {
            match change {
                Change::Batch(children) => stack.extend(children.iter().rev()),
                leaf => leaves.push(leaf),
            }
        }
        leaves
    }
}

/// One event read from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    /// `None` when the raw event carried no usable position.
    pub position: Option<FeedPosition>,
    pub change: Change,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Oplog
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_oplog_entry(entry: &Document) -> FeedEvent {
    FeedEvent {
        position: entry.get_timestamp("ts").ok().map(FeedPosition::Oplog),
        change: oplog_change(entry),
    }
}

fn oplog_change(entry: &Document) -> Change {
    let namespace = entry.get_str("ns").ok().map(str::to_string);
    let unrecognized = |reason: &str| Change::Unrecognized {
        namespace: namespace.clone(),
        reason: reason.to_string(),
    };

    let Ok(op) = entry.get_str("op") else {
        return unrecognized("entry has no op");
    };

    match op {
        "n" => Change::Noop,
        "c" => match entry.get_document("o").and_then(|o| o.get_array("applyOps")) {
            Ok(ops) => Change::Batch(
                ops.iter()
                    .map(|op| match op {
                        Bson::Document(inner) => oplog_change(inner),
                        _ => Change::Unrecognized {
                            namespace: None,
                            reason: "applyOps item is not a document".to_string(),
                        },
                    })
                    .collect(),
            ),
            Err(_) => Change::Noop,
        },
        "i" | "u" | "d" => {
            let Some(ns) = namespace.clone() else {
                return unrecognized("entry has no namespace");
            };
            let Ok(o) = entry.get_document("o") else {
                return unrecognized("entry has no o document");
            };
            match op {
                "i" if ns.ends_with(".system.indexes") => Change::Noop,
                "i" => Change::Insert {
                    namespace: ns,
                    document: o.clone(),
                },
                "d" => Change::Delete {
                    namespace: ns,
                    selector: o.clone(),
                },
                _ => {
                    let Ok(selector) = entry.get_document("o2") else {
                        return unrecognized("update has no o2 selector");
                    };
                    if o.keys().any(|k| k.starts_with('$')) {
                        Change::UpdateByPatch {
                            namespace: ns,
                            selector: selector.clone(),
                        }
                    } else {
                        Change::UpdateByReplacement {
                            namespace: ns,
                            selector: selector.clone(),
                            replacement: o.clone(),
                        }
                    }
                }
            }
        }
        other => unrecognized(&format!("unknown op {:?}", other)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change streams
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_change_event(event: &Document) -> FeedEvent {
    let position = event.get_document("_id").ok().map(|token| FeedPosition::ChangeStream {
        token: token.clone(),
        cluster_time: event.get_timestamp("clusterTime").ok(),
    });
    FeedEvent {
        position,
        change: change_stream_change(event),
    }
}

fn change_stream_change(event: &Document) -> Change {
    let namespace = event.get_document("ns").ok().and_then(|ns| {
        let db = ns.get_str("db").ok()?;
        let coll = ns.get_str("coll").ok()?;
        Some(format!("{}.{}", db, coll))
    });
    let unrecognized = |reason: String| Change::Unrecognized {
        namespace: namespace.clone(),
        reason,
    };

    let Ok(operation) = event.get_str("operationType") else {
        return unrecognized("event has no operationType".to_string());
    };
    let Some(ns) = namespace.clone() else {
        return unrecognized(format!("{} event has no namespace", operation));
    };
    let key = event.get_document("documentKey").ok().cloned();
    let full = event.get_document("fullDocument").ok().cloned();

    match (operation, key, full) {
        ("insert", _, Some(document)) => Change::Insert {
            namespace: ns,
            document,
        },
        ("replace", Some(selector), Some(replacement)) => Change::UpdateByReplacement {
            namespace: ns,
            selector,
            replacement,
        },
        // Update lookup already fetched the post-image.
        ("update", Some(selector), Some(replacement)) => Change::UpdateByReplacement {
            namespace: ns,
            selector,
            replacement,
        },
        ("update", Some(selector), None) => Change::UpdateByPatch {
            namespace: ns,
            selector,
        },
        ("delete", Some(selector), _) => Change::Delete {
            namespace: ns,
            selector,
        },
        ("drop" | "rename" | "dropDatabase" | "invalidate", _, _) => {
            unrecognized(format!("{} is not replicated", operation))
        }
        (other, _, _) => unrecognized(format!("incomplete {} event", other)),
    }
}
