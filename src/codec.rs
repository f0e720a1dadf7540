// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document to row encoding.
//!
//! Everything here is pure: given a [`CollectionSpec`] and a document, build
//! the DDL, statement fragments, bound parameter values and COPY text rows
//! the target needs.
//!
//! # Value Coercion
//!
//! | Source value | Column | Result |
//! |--------------|--------|--------|
//! | missing / null / undefined | any | `NULL` |
//! | ObjectId | any | 24 char hex text |
//! | Double | integer typed | truncated toward zero |
//! | DateTime | any | RFC 3339 with milliseconds, `Z` suffix |
//! | Document / Array | any | JSON text |
//! | String | any | text with NUL characters removed |
//!
//! # COPY Text Format
//!
//! Fields are tab separated, rows end with `\n`, NULL is `\N`. Backslash,
//! newline, carriage return and tab inside a field are backslash escaped.

use crate::spec::{Column, CollectionSpec, ExtraPropsPolicy};
use bson::{Bson, Document};
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};
use std::borrow::Cow;

/// Name of the catch-all column.
pub const EXTRA_PROPS_COLUMN: &str = "_extra_props";

/// A value bound to a statement parameter or written into a COPY row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Serialized JSON document.
    Json(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Unescaped text form, as PostgreSQL prints it with `::text`.
    pub fn to_plain_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Text(s) | SqlValue::Json(s) => Some(s.clone()),
        }
    }

    /// Field as written into a COPY text row.
    pub fn to_copy_field(&self) -> Cow<'_, str> {
        match self {
            SqlValue::Null => Cow::Borrowed("\\N"),
            SqlValue::Bool(true) => Cow::Borrowed("true"),
            SqlValue::Bool(false) => Cow::Borrowed("false"),
            SqlValue::Int(i) => Cow::Owned(i.to_string()),
            SqlValue::Float(f) => Cow::Owned(f.to_string()),
            SqlValue::Text(s) | SqlValue::Json(s) => escape_text(s),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statement fragments
// ═══════════════════════════════════════════════════════════════════════════════

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quoted column names in row order, extra-props column last.
pub fn column_names(spec: &CollectionSpec) -> Vec<String> {
    spec.columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .chain(spec.extra_props.iter().map(|_| quote_ident(EXTRA_PROPS_COLUMN)))
        .collect()
}

/// `$n::type` placeholders in row order.
pub fn placeholders(spec: &CollectionSpec) -> Vec<String> {
    spec.columns
        .iter()
        .map(|c| c.cast_type().to_string())
        .chain(
            spec.extra_props
                .iter()
                .map(|p| p.column_type.sql_name().to_lowercase()),
        )
        .enumerate()
        .map(|(i, cast)| format!("${}::{}", i + 1, cast))
        .collect()
}

/// Column definitions plus the primary key clause.
pub fn table_ddl(spec: &CollectionSpec) -> String {
    let mut parts: Vec<String> = spec
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.to_uppercase()))
        .collect();
    if let Some(policy) = &spec.extra_props {
        parts.push(format!(
            "{} {}",
            quote_ident(EXTRA_PROPS_COLUMN),
            policy.column_type.sql_name()
        ));
    }
    let keys: Vec<String> = spec.primary_key().map(|c| quote_ident(&c.name)).collect();
    parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    parts.join(", ")
}

pub fn create_table_sql(spec: &CollectionSpec, table: &str) -> String {
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), table_ddl(spec))
}

/// Session-local staging table with the same layout as the target.
pub fn create_temp_table_sql(spec: &CollectionSpec, table: &str) -> String {
    format!("CREATE TEMPORARY TABLE {} ({})", quote_ident(table), table_ddl(spec))
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}

/// Plain INSERT of every column.
pub fn insert_sql(spec: &CollectionSpec, table: &str) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_names(spec).join(", "),
        placeholders(spec).join(", ")
    )
}

/// `COPY ... FROM STDIN` in text format.
pub fn copy_statement(spec: &CollectionSpec, table: &str) -> String {
    format!(
        "COPY {} ({}) FROM STDIN",
        quote_ident(table),
        column_names(spec).join(", ")
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Value extraction
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Row values in column order. Lazily evaluated so the extra-props JSON is
/// only built when consumed.
pub fn transform_values<'a>(
    spec: &'a CollectionSpec,
    doc: &'a Document,
) -> impl Iterator<Item = SqlValue> + 'a {
    spec.columns
        .iter()
        .map(move |column| coerce(column, lookup_path(doc, &column.source)))
        .chain(
            spec.extra_props
                .iter()
                .map(move |policy| SqlValue::Json(extra_props_json(doc, policy))),
        )
}

/// Convert one source value for one column.
pub fn coerce(column: &Column, value: Option<&Bson>) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };
    match value {
        Bson::Null | Bson::Undefined => SqlValue::Null,
        Bson::Boolean(b) => SqlValue::Bool(*b),
        Bson::Int32(i) => SqlValue::Int(i64::from(*i)),
        Bson::Int64(i) => SqlValue::Int(*i),
        Bson::Double(f) if !f.is_finite() => SqlValue::Null,
        Bson::Double(f) if column.is_integer() => SqlValue::Int(f.trunc() as i64),
        Bson::Double(f) => SqlValue::Float(*f),
        Bson::String(s) => SqlValue::Text(sanitize(s).into_owned()),
        Bson::ObjectId(oid) => SqlValue::Text(oid.to_hex()),
        Bson::DateTime(dt) => SqlValue::Text(format_datetime(dt)),
        Bson::Document(_) | Bson::Array(_) => SqlValue::Json(bson_to_json(value).to_string()),
        other => SqlValue::Text(sanitize(&bson_to_json(other).to_string()).into_owned()),
    }
}

/// JSON of every top-level field not in the omitted list.
pub fn extra_props_json(doc: &Document, policy: &ExtraPropsPolicy) -> String {
    let mut map = Map::new();
    for (key, value) in doc {
        if policy.omitted_fields.iter().any(|f| f == key) {
            continue;
        }
        map.insert(sanitize(key).into_owned(), bson_to_json(value));
    }
    Value::Object(map).to_string()
}

/// JSON form used for embedded documents and extra props.
///
/// ObjectIds keep the `{"$oid": ...}` wrapper, dates become RFC 3339 text,
/// NUL characters are removed from strings and non-finite numbers become
/// `null`.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Number(Number::from(*i)),
        Bson::Int64(i) => Value::Number(Number::from(*i)),
        Bson::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Bson::String(s) => Value::String(sanitize(s).into_owned()),
        Bson::ObjectId(oid) => {
            let mut map = Map::new();
            map.insert("$oid".to_string(), Value::String(oid.to_hex()));
            Value::Object(map)
        }
        Bson::DateTime(dt) => Value::String(format_datetime(dt)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (sanitize(k).into_owned(), bson_to_json(v)))
                .collect(),
        ),
        other => other.clone().into_relaxed_extjson(),
    }
}

fn format_datetime(dt: &bson::DateTime) -> String {
    dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Canonical text of an identifier value: hex for ObjectIds, the raw string
/// for strings, JSON otherwise.
pub fn key_text(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => sanitize(s).into_owned(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => bson_to_json(other).to_string(),
    }
}

/// `_id` of a document for logs and error context.
pub fn document_id(doc: &Document) -> String {
    doc.get("_id")
        .map(key_text)
        .unwrap_or_else(|| "<no _id>".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// COPY text rows
// ═══════════════════════════════════════════════════════════════════════════════

/// Remove NUL characters, which PostgreSQL text cannot hold.
pub fn sanitize(s: &str) -> Cow<'_, str> {
    if s.contains('\0') {
        Cow::Owned(s.replace('\0', ""))
    } else {
        Cow::Borrowed(s)
    }
}

/// Backslash escape `\`, `\n`, `\r` and `\t` for the COPY text format.
pub fn escape_text(s: &str) -> Cow<'_, str> {
    if !s.contains(['\\', '\n', '\r', '\t']) {
        return Cow::Borrowed(s);
    }
    let mut escaped = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// One COPY row, newline terminated.
pub fn to_text_row(spec: &CollectionSpec, doc: &Document) -> String {
    let mut row = String::new();
    for (i, value) in transform_values(spec, doc).enumerate() {
        if i > 0 {
            row.push('\t');
        }
        row.push_str(&value.to_copy_field());
    }
    row.push('\n');
    row
}
