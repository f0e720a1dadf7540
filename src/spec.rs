// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection specs: how one source collection maps onto one target table.
//!
//! The mapping document (parsed from YAML by the caller) is turned into a
//! [`SpecSet`] once at startup. After that the specs are immutable and are
//! shared by `Arc` between the importer, the reconciler and the applier.
//!
//! # Mapping Model
//!
//! ```text
//! MappingDocument::Multi                 MappingDocument::Single
//! ├── <database>                         ├── <collection>: CollectionMapping
//! │   └── <collection>: CollectionMapping
//!
//! CollectionMapping
//! ├── columns: [ColumnMapping { name, type, source?, retain_extra_prop? }]
//! └── meta: MetaMapping
//!     ├── table, table_init
//!     ├── composite_key
//!     ├── incremental_replication_key, incremental_replication_limit
//!     ├── extra_props { type, omit }
//!     ├── partitioned
//!     └── delete_key
//! ```
//!
//! # Column Order
//!
//! Column order is fixed when a `CollectionSpec` is built. DDL, placeholders, bound
//! parameters and COPY rows all iterate `columns` in that order, followed by
//! the extra-props column when one is configured.

use crate::error::{ReplicationError, Result};
use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Mapping model (input)
// ═══════════════════════════════════════════════════════════════════════════════

/// Collections of one database, keyed by collection name.
pub type DatabaseMapping = BTreeMap<String, CollectionMapping>;

/// A parsed mapping document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingDocument {
    /// Keyed by database, then collection.
    Multi(BTreeMap<String, DatabaseMapping>),
    /// Keyed by collection; the database comes from configuration.
    Single(DatabaseMapping),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub meta: MetaMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    /// Dotted field path in the source document. Defaults to `name`.
    #[serde(default)]
    pub source: Option<String>,
    /// Keep this field in the extra-props column as well.
    #[serde(default)]
    pub retain_extra_prop: bool,
}

impl ColumnMapping {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            source: None,
            retain_extra_prop: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain_extra_prop = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaMapping {
    #[serde(default)]
    pub table: Option<String>,
    /// SQL script run after a full import (indexes, grants, ...).
    #[serde(default)]
    pub table_init: Option<String>,
    #[serde(default)]
    pub composite_key: Option<Vec<String>>,
    #[serde(default)]
    pub incremental_replication_key: Option<String>,
    /// Duration such as `"P30D"` or `"30days"`; only honoured for temporal keys.
    #[serde(default)]
    pub incremental_replication_limit: Option<String>,
    #[serde(default)]
    pub extra_props: Option<ExtraPropsMapping>,
    #[serde(default)]
    pub partitioned: bool,
    #[serde(default)]
    pub delete_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraPropsMapping {
    #[serde(rename = "type")]
    pub props_type: String,
    #[serde(default)]
    pub omit: Vec<String>,
}

impl ExtraPropsMapping {
    pub fn new(props_type: impl Into<String>) -> Self {
        Self {
            props_type: props_type.into(),
            omit: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Spec model (output)
// ═══════════════════════════════════════════════════════════════════════════════

/// One target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Dotted path into the source document.
    pub source: String,
    /// Declared SQL type, lowercased.
    pub sql_type: String,
    pub is_primary_key: bool,
    pub retain_in_extra_props: bool,
}

impl Column {
    /// Integer-typed columns receive truncated numbers.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.sql_type.as_str(),
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8"
                | "smallserial" | "serial" | "bigserial"
        )
    }

    /// Timestamp or date columns.
    pub fn is_temporal(&self) -> bool {
        self.sql_type.contains("timestamp") || self.sql_type == "date"
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.sql_type.as_str(), "real" | "float4" | "float8" | "double precision")
            || self.sql_type.starts_with("numeric")
            || self.sql_type.starts_with("decimal")
    }

    /// Type used in parameter casts. Serial pseudo-types are not castable.
    pub fn cast_type(&self) -> &str {
        match self.sql_type.as_str() {
            "smallserial" => "smallint",
            "serial" => "integer",
            "bigserial" => "bigint",
            other => other,
        }
    }

    fn is_deep(&self) -> bool {
        self.source.contains('.')
    }
}

/// Storage type of the extra-props column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraPropsType {
    Json,
    Jsonb,
    Text,
}

impl ExtraPropsType {
    /// Parse a declared type; anything unsupported falls back to text.
    pub fn parse(declared: &str) -> Self {
        match declared.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "jsonb" => Self::Jsonb,
            "text" => Self::Text,
            other => {
                warn!(declared = %other, "Unsupported extra props type, using text");
                Self::Text
            }
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Jsonb => "JSONB",
            Self::Text => "TEXT",
        }
    }
}

/// Catch-all column for document fields not mapped to a named column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraPropsPolicy {
    pub column_type: ExtraPropsType,
    /// Top-level fields left out of the extra-props JSON.
    pub omitted_fields: Vec<String>,
}

/// How one source collection is projected onto one target table.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    /// `database.collection`
    pub namespace: String,
    pub database: String,
    pub collection: String,
    pub target_table: String,
    pub columns: Vec<Column>,
    primary_key: Vec<usize>,
    incremental_key: Option<usize>,
    pub incremental_limit: Option<Duration>,
    /// Target column matched against deleted document ids during log replay.
    pub delete_key: Option<String>,
    pub extra_props: Option<ExtraPropsPolicy>,
    /// Partitioned tables don't get `ON CONFLICT` upserts.
    pub partitioned: bool,
    pub table_init_statements: Vec<String>,
}

impl CollectionSpec {
    /// Build a spec from one collection entry of the mapping document.
    pub fn from_mapping(
        database: &str,
        collection: &str,
        mapping: &CollectionMapping,
    ) -> Result<Self> {
        let namespace = format!("{}.{}", database, collection);
        let invalid = |msg: String| ReplicationError::Config(format!("[{}] {}", namespace, msg));

        if mapping.columns.is_empty() {
            return Err(invalid("no columns declared".to_string()));
        }

        let mut columns: Vec<Column> = Vec::with_capacity(mapping.columns.len());
        for c in &mapping.columns {
            if c.name.is_empty() {
                return Err(invalid("column with empty name".to_string()));
            }
            if columns.iter().any(|existing| existing.name == c.name) {
                return Err(invalid(format!("duplicate column {}", c.name)));
            }
            columns.push(Column {
                name: c.name.clone(),
                source: c.source.clone().unwrap_or_else(|| c.name.clone()),
                sql_type: c.sql_type.trim().to_lowercase(),
                is_primary_key: false,
                retain_in_extra_props: c.retain_extra_prop,
            });
        }

        let by_name = |name: &str| {
            columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| invalid(format!("could not find column {}", name)))
        };

        let meta = &mapping.meta;
        let primary_key: Vec<usize> = match &meta.composite_key {
            Some(names) if !names.is_empty() => {
                names.iter().map(|n| by_name(n)).collect::<Result<_>>()?
            }
            Some(_) => return Err(invalid("composite_key is empty".to_string())),
            None => vec![columns
                .iter()
                .position(|c| c.source == "_id")
                .ok_or_else(|| invalid("could not find column with source _id".to_string()))?],
        };

        let incremental_key = meta
            .incremental_replication_key
            .as_deref()
            .map(by_name)
            .transpose()?;

        let incremental_limit = meta
            .incremental_replication_limit
            .as_deref()
            .map(|raw| {
                parse_limit(raw)
                    .map_err(|e| invalid(format!("invalid incremental_replication_limit {:?}: {}", raw, e)))
            })
            .transpose()?;

        let delete_key = match &meta.delete_key {
            Some(name) => Some(columns[by_name(name)?].name.clone()),
            None => None,
        };

        for &idx in &primary_key {
            columns[idx].is_primary_key = true;
        }

        let delete_key = delete_key.or_else(|| {
            primary_key
                .iter()
                .any(|&idx| columns[idx].name == "id")
                .then(|| "id".to_string())
        });

        let extra_props = meta.extra_props.as_ref().map(|props| {
            let mut omitted_fields: Vec<String> = Vec::new();
            let candidates = columns
                .iter()
                .filter(|c| !c.retain_in_extra_props && !c.is_deep())
                .map(|c| c.source.clone())
                .chain(props.omit.iter().cloned());
            for field in candidates {
                if !omitted_fields.contains(&field) {
                    omitted_fields.push(field);
                }
            }
            ExtraPropsPolicy {
                column_type: ExtraPropsType::parse(&props.props_type),
                omitted_fields,
            }
        });

        let table_init_statements = meta
            .table_init
            .as_deref()
            .map(script_to_statements)
            .unwrap_or_default();

        debug!(
            namespace = %namespace,
            columns = columns.len(),
            primary_key = primary_key.len(),
            "Built collection spec"
        );

        Ok(Self {
            target_table: meta.table.clone().unwrap_or_else(|| collection.to_string()),
            namespace,
            database: database.to_string(),
            collection: collection.to_string(),
            columns,
            primary_key,
            incremental_key,
            incremental_limit,
            delete_key,
            extra_props,
            partitioned: meta.partitioned,
            table_init_statements,
        })
    }

    /// Primary key columns in key order.
    pub fn primary_key(&self) -> impl Iterator<Item = &Column> + '_ {
        self.primary_key.iter().map(move |&idx| &self.columns[idx])
    }

    pub fn incremental_key(&self) -> Option<&Column> {
        self.incremental_key.map(|idx| &self.columns[idx])
    }

    /// Number of values produced per row (columns plus extra props).
    pub fn value_count(&self) -> usize {
        self.columns.len() + usize::from(self.extra_props.is_some())
    }

    /// Source projection. `None` means the whole document is needed (extra
    /// props collect every unmapped field).
    pub fn projection(&self) -> Option<Document> {
        if self.extra_props.is_some() {
            return None;
        }
        let mut projection = Document::new();
        let mut sources: Vec<&str> = self.columns.iter().map(|c| c.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        for source in &sources {
            // MongoDB rejects overlapping paths such as `a` and `a.b`.
            let covered = sources
                .iter()
                .any(|other| other != source && source.starts_with(&format!("{}.", other)));
            if !covered {
                projection.insert(source.to_string(), 1);
            }
        }
        Some(projection)
    }

    /// Projection of primary key and incremental key fields only.
    pub fn key_projection(&self) -> Document {
        let mut projection = doc! {};
        for column in self.primary_key().chain(self.incremental_key()) {
            projection.insert(column.source.clone(), 1);
        }
        projection
    }
}

/// Split a SQL script into statements.
///
/// Line breaks and runs of whitespace collapse to one space; statements are
/// split on `;` and empty ones dropped.
pub fn script_to_statements(script: &str) -> Vec<String> {
    script
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SpecSet
// ═══════════════════════════════════════════════════════════════════════════════

/// Every collection spec, keyed by namespace.
#[derive(Debug, Clone, Default)]
pub struct SpecSet {
    specs: HashMap<String, Arc<CollectionSpec>>,
}

impl SpecSet {
    /// Build the set from a mapping document.
    ///
    /// `default_database` is required for [`MappingDocument::Single`].
    pub fn build(mapping: &MappingDocument, default_database: Option<&str>) -> Result<Self> {
        let mut set = Self::default();
        match mapping {
            MappingDocument::Multi(databases) => {
                for (database, collections) in databases {
                    set.add_database(database, collections)?;
                }
            }
            MappingDocument::Single(collections) => {
                let database = default_database.ok_or_else(|| {
                    ReplicationError::Config(
                        "single database mode needs a database name".to_string(),
                    )
                })?;
                set.add_database(database, collections)?;
            }
        }
        Ok(set)
    }

    fn add_database(&mut self, database: &str, collections: &DatabaseMapping) -> Result<()> {
        for (collection, mapping) in collections {
            let spec = CollectionSpec::from_mapping(database, collection, mapping)?;
            self.insert(spec)?;
        }
        Ok(())
    }

    /// Add one spec. Two namespaces may not share a target table.
    pub fn insert(&mut self, spec: CollectionSpec) -> Result<()> {
        if let Some(other) = self.specs.values().find(|s| s.target_table == spec.target_table) {
            return Err(ReplicationError::Config(format!(
                "{} and {} both map to table \"{}\"",
                other.namespace, spec.namespace, spec.target_table
            )));
        }
        self.specs.insert(spec.namespace.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, namespace: &str) -> Option<&Arc<CollectionSpec>> {
        self.specs.get(namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CollectionSpec>> {
        self.specs.values()
    }

    /// Namespaces in sorted order.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.specs.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Incremental limits are ISO-8601 durations (`P30D`, `PT12H`) or
/// humantime strings (`30days`). Months count as 30 days and years as 365.
fn parse_limit(raw: &str) -> std::result::Result<Duration, String> {
    if !raw.starts_with('P') {
        return humantime::parse_duration(raw).map_err(|e| e.to_string());
    }
    const DAY: u64 = 86_400;
    let duration = match iso8601::duration(raw)? {
        iso8601::Duration::YMDHMS {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millisecond,
        } => {
            let secs = u64::from(year) * 365 * DAY
                + u64::from(month) * 30 * DAY
                + u64::from(day) * DAY
                + u64::from(hour) * 3_600
                + u64::from(minute) * 60
                + u64::from(second);
            Duration::from_secs(secs) + Duration::from_millis(u64::from(millisecond))
        }
        iso8601::Duration::Weeks(weeks) => Duration::from_secs(u64::from(weeks) * 7 * DAY),
    };
    Ok(duration)
}
