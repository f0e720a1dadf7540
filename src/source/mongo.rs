// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB source.
//!
//! The oplog lives in `local.oplog.rs` and only exists on replica set
//! members. Change streams need a replica set or sharded cluster too, but
//! go through the server's `$changeStream` aggregation instead of reading
//! the log directly.

use super::{BoxFuture, DocumentSource, DocumentStream, FeedStart, FindQuery};
use crate::config::SourceConfig;
use crate::error::{ReplicationError, Result};
use crate::spec::CollectionSpec;
use bson::{doc, Bson, Document, Timestamp};
use futures::{StreamExt, TryStreamExt};
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::{ClientOptions, CursorType, FullDocumentType};
use mongodb::{Client, Collection};
use tracing::{debug, info};

const OPLOG_DATABASE: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

/// Document source backed by a MongoDB client.
#[derive(Debug, Clone)]
pub struct MongoSource {
    client: Client,
    default_database: Option<String>,
}

impl MongoSource {
    /// Connect and ping the deployment.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| ReplicationError::Config(format!("Invalid source uri: {}", e)))?;
        options.app_name = Some(config.app_name.clone());
        let default_database = config
            .db_name
            .clone()
            .or_else(|| options.default_database.clone());

        let client = Client::with_options(options)
            .map_err(|e| ReplicationError::connection("mongodb", e.to_string()))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| ReplicationError::connection("mongodb", e.to_string()))?;

        info!(default_database = ?default_database, "Connected to source database");
        Ok(Self {
            client,
            default_database,
        })
    }

    pub fn from_client(client: Client, default_database: Option<String>) -> Self {
        Self {
            client,
            default_database,
        }
    }

    /// Database named by configuration or the connection string.
    pub fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    fn collection(&self, spec: &CollectionSpec) -> Collection<Document> {
        self.client.database(&spec.database).collection(&spec.collection)
    }

    fn oplog(&self) -> Collection<Document> {
        self.client.database(OPLOG_DATABASE).collection(OPLOG_COLLECTION)
    }

    async fn open_oplog_tail(&self, after: Timestamp) -> Result<DocumentStream> {
        let cursor = self
            .oplog()
            .find(doc! { "ts": { "$gt": after } })
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true)
            .await
            .map_err(|e| ReplicationError::mongo("oplog tail", e))?;
        info!(time = after.time, increment = after.increment, "Tailing oplog");
        Ok(cursor
            .map_err(|e| ReplicationError::mongo("oplog tail", e))
            .boxed())
    }

    async fn open_change_stream(
        &self,
        resume_after: Option<Document>,
        start_at: Option<Timestamp>,
        namespaces: &[String],
    ) -> Result<DocumentStream> {
        let matches: Vec<Bson> = namespaces
            .iter()
            .filter_map(|ns| ns.split_once('.'))
            .map(|(db, coll)| Bson::Document(doc! { "ns.db": db, "ns.coll": coll }))
            .collect();
        let pipeline = vec![doc! { "$match": { "$or": matches } }];

        let mut action = self
            .client
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_after {
            let token: ResumeToken = bson::from_bson(Bson::Document(token))
                .map_err(|e| ReplicationError::Stream(format!("invalid resume token: {}", e)))?;
            action = action.start_after(token);
        } else if let Some(ts) = start_at {
            action = action.start_at_operation_time(ts);
        }

        let stream = action
            .await
            .map_err(|e| ReplicationError::mongo("change stream", e))?
            .with_type::<Document>();
        info!(namespaces = namespaces.len(), "Watching change stream");
        Ok(stream
            .map_err(|e| ReplicationError::mongo("change stream", e))
            .boxed())
    }
}

impl DocumentSource for MongoSource {
    fn find<'a>(&'a self, spec: &'a CollectionSpec, query: FindQuery) -> BoxFuture<'a, DocumentStream> {
        Box::pin(async move {
            debug!(namespace = %spec.namespace, filter = %query.filter, "Querying collection");
            let collection = self.collection(spec);
            let mut action = collection.find(query.filter).batch_size(1000);
            if let Some(sort) = query.sort {
                action = action.sort(sort);
            }
            if let Some(projection) = query.projection {
                action = action.projection(projection);
            }
            let cursor = action.await.map_err(|e| ReplicationError::mongo("find", e))?;
            let stream: DocumentStream = cursor
                .map_err(|e| ReplicationError::mongo("find", e))
                .boxed();
            Ok::<_, ReplicationError>(stream)
        })
    }

    fn find_one<'a>(
        &'a self,
        spec: &'a CollectionSpec,
        selector: Document,
    ) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            let collection = self.collection(spec);
            let mut action = collection.find_one(selector);
            if let Some(projection) = spec.projection() {
                action = action.projection(projection);
            }
            action.await.map_err(|e| ReplicationError::mongo("find_one", e))
        })
    }

    fn has_operation_log(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let names = self
                .client
                .database(OPLOG_DATABASE)
                .list_collection_names()
                .await
                .map_err(|e| ReplicationError::mongo("list collections", e))?;
            Ok::<_, ReplicationError>(names.iter().any(|n| n == OPLOG_COLLECTION))
        })
    }

    fn head_timestamp(&self) -> BoxFuture<'_, Option<Timestamp>> {
        Box::pin(async move {
            let mut cursor = self
                .oplog()
                .find(doc! {})
                .sort(doc! { "$natural": -1 })
                .limit(1)
                .projection(doc! { "ts": 1 })
                .await
                .map_err(|e| ReplicationError::mongo("oplog head", e))?;
            let head = cursor
                .try_next()
                .await
                .map_err(|e| ReplicationError::mongo("oplog head", e))?;
            Ok::<_, ReplicationError>(head.and_then(|entry| entry.get_timestamp("ts").ok()))
        })
    }

    fn read_operation_log(&self, after: Timestamp) -> BoxFuture<'_, DocumentStream> {
        Box::pin(async move {
            let cursor = self
                .oplog()
                .find(doc! { "ts": { "$gt": after } })
                .batch_size(1000)
                .await
                .map_err(|e| ReplicationError::mongo("oplog scan", e))?;
            let stream: DocumentStream = cursor
                .map_err(|e| ReplicationError::mongo("oplog scan", e))
                .boxed();
            Ok::<_, ReplicationError>(stream)
        })
    }

    fn open_feed<'a>(&'a self, start: FeedStart, namespaces: &'a [String]) -> BoxFuture<'a, DocumentStream> {
        Box::pin(async move {
            match start {
                FeedStart::Oplog { after } => self.open_oplog_tail(after).await,
                FeedStart::ChangeStream {
                    resume_after,
                    start_at,
                } => self.open_change_stream(resume_after, start_at, namespaces).await,
            }
        })
    }
}
