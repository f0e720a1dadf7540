//! # Document Replication Engine
//!
//! Continuously replicates MongoDB collections into PostgreSQL tables: a
//! bulk initial import, then live, ordered application of the change feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        doc-replication-engine                            │
//! │                                                                          │
//! │  MappingDocument ──► SpecSet (immutable, shared by Arc)                  │
//! │                         │                                                │
//! │        ┌────────────────┼──────────────────────┐                         │
//! │        ▼                ▼                      ▼                         │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────┐                │
//! │  │ Deletion    │─►│ BulkImporter │─►│ ChangeEventApplier│◄── oplog tail  │
//! │  │ Reconciler  │  │ (COPY + row  │  │ (upsert / delete) │    or change   │
//! │  │ (log replay │  │  fallback)   │  └───────────────────┘    stream      │
//! │  │  / bisect)  │  └──────────────┘            │                          │
//! │  └─────────────┘         │                    ▼                          │
//! │        └─────────────────┴──► ConcurrencyController   FeedCursorStore    │
//! │                              (namespace locks + slots)   (SQLite)        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component reads through [`DocumentSource`] and writes through
//! [`TargetStore`]; production uses [`MongoSource`] and [`PgTarget`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replication_engine::{MappingDocument, ReplicationConfig, ReplicationEngine};
//!
//! # async fn run(mapping: MappingDocument) -> doc_replication_engine::Result<()> {
//! let config = ReplicationConfig::default();
//! let mut engine = ReplicationEngine::connect(config, &mapping).await?;
//! engine.start().await?;
//!
//! let stop = engine.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     stop.trigger();
//! });
//! engine.run_until_stopped().await
//! # }
//! ```

pub mod applier;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod importer;
pub mod metrics;
pub mod reconcile;
pub mod resilience;
pub mod source;
pub mod spec;
pub mod target;

// Re-exports for convenience
pub use applier::{ApplyOutcome, ChangeEventApplier};
pub use concurrency::ConcurrencyController;
pub use config::{DeleteMode, FeedKind, ReconcileStrategy, ReplicationConfig};
pub use coordinator::{EngineState, ReplicationEngine, ShutdownHandle};
pub use cursor::FeedCursorStore;
pub use error::{ReplicationError, Result, TargetError};
pub use feed::{Change, FeedEvent, FeedPosition};
pub use importer::{BulkImporter, ImportReport, ImportSettings};
pub use reconcile::{DeletionReconciler, ReconcileReport};
pub use source::{DocumentSource, MongoSource};
pub use spec::{CollectionSpec, MappingDocument, SpecSet};
pub use target::{PgTarget, TargetConnection, TargetStore};
