// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory relational target.
//!
//! Interprets the statement shapes the engine emits (DDL, COPY, upserts,
//! keyed updates/deletes, staged `DELETE ... USING`, `MAX()` and ordered key
//! selects) against tables of text cells, records everything, and injects
//! failures by statement pattern.
//!
//! # Example
//! ```rust,ignore
//! let target = MockTarget::new(2);
//! target.register(&spec);
//! target.fail_on("COPY", "22P02");
//!
//! // run the importer...
//!
//! assert_eq!(target.rows("users").len(), 1499);
//! assert!(target.executed().iter().any(|s| s.sql.starts_with("INSERT")));
//! ```

use doc_replication_engine::codec::{SqlValue, EXTRA_PROPS_COLUMN};
use doc_replication_engine::error::TargetError;
use doc_replication_engine::spec::CollectionSpec;
use doc_replication_engine::target::{BoxFuture, TargetConnection, TargetResult, TargetStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Cell = Option<String>;
pub type Row = Vec<Cell>;

/// A recorded `execute()` or `query_text()` call.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Cell>,
}

/// A recorded `copy_in()` call.
#[derive(Debug, Clone)]
pub struct CopyCall {
    pub statement: String,
    pub data: String,
}

#[derive(Debug, Clone)]
struct MockTable {
    columns: Vec<String>,
    key: Vec<usize>,
    rows: Vec<Row>,
}

impl MockTable {
    fn key_of(&self, row: &Row) -> Vec<Cell> {
        self.key.iter().map(|&i| row[i].clone()).collect()
    }

    fn position(&self, key: &[Cell]) -> Option<usize> {
        self.rows.iter().position(|r| self.key_of(r) == key)
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    /// Only fail when some parameter (or COPY line) contains this text.
    containing: Option<String>,
    code: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct TargetState {
    tables: HashMap<String, MockTable>,
    snapshot: Option<HashMap<String, MockTable>>,
    statements: Vec<Statement>,
    copies: Vec<CopyCall>,
    failures: Vec<FailureRule>,
    responses: Vec<(String, Vec<Row>)>,
    acquired: usize,
    refuse_connections: bool,
}

/// Mock [`TargetStore`] sharing one in-memory database across connections.
#[derive(Clone)]
pub struct MockTarget {
    state: Arc<Mutex<TargetState>>,
    capacity: usize,
}

impl MockTarget {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState::default())),
            capacity,
        }
    }

    /// Declare the layout of `spec`'s table.
    pub fn register(&self, spec: &CollectionSpec) {
        let mut columns: Vec<String> = spec.columns.iter().map(|c| c.name.clone()).collect();
        if spec.extra_props.is_some() {
            columns.push(EXTRA_PROPS_COLUMN.to_string());
        }
        let key = spec
            .primary_key()
            .filter_map(|k| columns.iter().position(|c| *c == k.name))
            .collect();
        self.lock().tables.insert(
            spec.target_table.clone(),
            MockTable {
                columns,
                key,
                rows: Vec::new(),
            },
        );
    }

    /// Put rows straight into a registered table. `\N` seeds a NULL.
    pub fn seed(&self, table: &str, rows: Vec<Vec<&str>>) {
        let mut state = self.lock();
        let table = state.tables.get_mut(table).expect("table registered");
        for row in rows {
            table
                .rows
                .push(row.into_iter().map(|c| (c != "\\N").then(|| c.to_string())).collect());
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, table: &str, column: &str) -> Vec<Cell> {
        let state = self.lock();
        let Some(table) = state.tables.get(table) else { return Vec::new() };
        let Some(idx) = table.column(column) else { return Vec::new() };
        table.rows.iter().map(|r| r[idx].clone()).collect()
    }

    /// Sorted non-null values of one column.
    pub fn sorted_values(&self, table: &str, column: &str) -> Vec<String> {
        let mut values: Vec<String> = self.column_values(table, column).into_iter().flatten().collect();
        values.sort();
        values
    }

    pub fn executed(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    pub fn executed_matching(&self, pattern: &str) -> Vec<Statement> {
        self.executed().into_iter().filter(|s| s.sql.contains(pattern)).collect()
    }

    pub fn copies(&self) -> Vec<CopyCall> {
        self.lock().copies.clone()
    }

    pub fn connections_acquired(&self) -> usize {
        self.lock().acquired
    }

    /// Make every `acquire()` fail as if the server were unreachable.
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// Fail every statement containing `pattern` with SQLSTATE `code`.
    pub fn fail_on(&self, pattern: &str, code: &str) {
        self.add_failure(pattern, None, code, None);
    }

    /// Fail the first `times` statements containing `pattern`.
    pub fn fail_times(&self, pattern: &str, code: &str, times: usize) {
        self.add_failure(pattern, None, code, Some(times));
    }

    /// Fail statements containing `pattern` whose parameters (or COPY data)
    /// contain `value`.
    pub fn fail_on_value(&self, pattern: &str, value: &str, code: &str) {
        self.add_failure(pattern, Some(value.to_string()), code, None);
    }

    fn add_failure(&self, pattern: &str, containing: Option<String>, code: &str, remaining: Option<usize>) {
        self.lock().failures.push(FailureRule {
            pattern: pattern.to_string(),
            containing,
            code: code.to_string(),
            remaining,
        });
    }

    /// Answer queries containing `pattern` with fixed rows.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.lock().responses.push((pattern.to_string(), rows));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().expect("mock target poisoned")
    }
}

impl TargetStore for MockTarget {
    type Connection = MockConnection;

    fn acquire(&self) -> BoxFuture<'_, Self::Connection> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            {
                let mut guard = state.lock().expect("mock target poisoned");
                if guard.refuse_connections {
                    return Err(TargetError::new(Some("08006"), "connection refused"));
                }
                guard.acquired += 1;
            }
            Ok(MockConnection { state })
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct MockConnection {
    state: Arc<Mutex<TargetState>>,
}

impl MockConnection {
    fn run(&self, sql: &str, params: &[SqlValue]) -> TargetResult<(u64, Vec<Row>)> {
        let mut state = self.state.lock().expect("mock target poisoned");
        let cells: Vec<Cell> = params.iter().map(SqlValue::to_plain_text).collect();
        state.statements.push(Statement {
            sql: sql.to_string(),
            params: cells.clone(),
        });
        check_failures(&mut state, sql, &cells.iter().flatten().cloned().collect::<Vec<_>>())?;
        interpret(&mut state, sql, &cells)
    }
}

impl TargetConnection for MockConnection {
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [SqlValue]) -> BoxFuture<'a, u64> {
        let result = self.run(sql, params).map(|(n, _)| n);
        Box::pin(async move { result })
    }

    fn copy_in<'a>(&'a mut self, statement: &'a str, data: Vec<u8>) -> BoxFuture<'a, u64> {
        let result = (|| -> TargetResult<u64> {
            let mut state = self.state.lock().expect("mock target poisoned");
            let text = String::from_utf8(data).map_err(|_| TargetError::new(Some("22021"), "invalid utf8"))?;
            state.copies.push(CopyCall {
                statement: statement.to_string(),
                data: text.clone(),
            });
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            check_failures(&mut state, statement, &lines)?;
            copy_rows(&mut state, statement, &text)
        })();
        Box::pin(async move { result })
    }

    fn query_text<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, Vec<Vec<Option<String>>>> {
        let result = self.run(sql, params).map(|(_, rows)| rows);
        Box::pin(async move { result })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statement interpretation
// ═══════════════════════════════════════════════════════════════════════════════

fn check_failures(state: &mut TargetState, sql: &str, values: &[String]) -> TargetResult<()> {
    for rule in state.failures.iter_mut() {
        if !sql.contains(&rule.pattern) || rule.remaining == Some(0) {
            continue;
        }
        if let Some(needle) = &rule.containing {
            if !values.iter().any(|v| v.contains(needle.as_str())) {
                continue;
            }
        }
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        return Err(TargetError::new(
            Some(rule.code.as_str()),
            format!("injected failure on {:?}", rule.pattern),
        ));
    }
    Ok(())
}

fn violation(table: &str) -> TargetError {
    TargetError::new(
        Some("23505"),
        format!("duplicate key value violates unique constraint \"{}_pkey\"", table),
    )
}

fn missing(table: &str) -> TargetError {
    TargetError::new(Some("42P01"), format!("relation \"{}\" does not exist", table))
}

/// Identifier in double quotes at the start of `s`.
fn leading_ident(s: &str) -> Option<(String, &str)> {
    let rest = s.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((rest[..end].to_string(), &rest[end + 1..]))
}

fn ident_after<'a>(sql: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    leading_ident(sql.strip_prefix(prefix)?)
}

/// Every quoted identifier in `s`, in order.
fn idents(s: &str) -> Vec<String> {
    s.split('"').skip(1).step_by(2).map(str::to_string).collect()
}

fn unescape(field: &str) -> Cell {
    if field == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

fn staging_base(name: &str) -> Option<&str> {
    name.strip_suffix("_copy_temp")
}

fn interpret(state: &mut TargetState, sql: &str, params: &[Cell]) -> TargetResult<(u64, Vec<Row>)> {
    if let Some((_, rows)) = state.responses.iter().find(|(p, _)| sql.contains(p.as_str())) {
        return Ok((rows.len() as u64, rows.clone()));
    }

    match sql {
        "BEGIN" => {
            state.snapshot = Some(state.tables.clone());
            return Ok((0, vec![]));
        }
        "COMMIT" => {
            state.snapshot = None;
            return Ok((0, vec![]));
        }
        "ROLLBACK" => {
            if let Some(snapshot) = state.snapshot.take() {
                state.tables = snapshot;
            }
            return Ok((0, vec![]));
        }
        _ => {}
    }

    if let Some((name, _)) = ident_after(sql, "DROP TABLE IF EXISTS ").or_else(|| ident_after(sql, "DROP TABLE ")) {
        if name.ends_with("_temp") {
            state.tables.remove(&name);
        } else if let Some(table) = state.tables.get_mut(&name) {
            table.rows.clear();
        }
        return Ok((0, vec![]));
    }

    if let Some((name, _)) = ident_after(sql, "CREATE TABLE IF NOT EXISTS ") {
        if !state.tables.contains_key(&name) {
            return Err(TargetError::new(None, format!("mock table \"{}\" was never registered", name)));
        }
        return Ok((0, vec![]));
    }

    if let Some((name, _)) = ident_after(sql, "CREATE TEMPORARY TABLE ") {
        let base = staging_base(&name).and_then(|b| state.tables.get(b)).cloned();
        let mut layout = base.ok_or_else(|| missing(&name))?;
        layout.rows.clear();
        state.tables.insert(name, layout);
        return Ok((0, vec![]));
    }

    if let Some((name, rest)) = ident_after(sql, "CREATE TEMP TABLE ") {
        let column = idents(rest).into_iter().next().unwrap_or_default();
        state.tables.insert(
            name,
            MockTable {
                columns: vec![column],
                key: vec![0],
                rows: Vec::new(),
            },
        );
        return Ok((0, vec![]));
    }

    if let Some((name, rest)) = ident_after(sql, "INSERT INTO ") {
        return insert(state, &name, rest, params).map(|n| (n, vec![]));
    }

    if let Some((name, _)) = ident_after(sql, "UPDATE ") {
        let table = state.tables.get_mut(&name).ok_or_else(|| missing(&name))?;
        let row: Row = params.to_vec();
        let key = table.key_of(&row);
        return Ok(match table.position(&key) {
            Some(pos) => {
                table.rows[pos] = row;
                (1, vec![])
            }
            None => (0, vec![]),
        });
    }

    if let Some((name, rest)) = ident_after(sql, "DELETE FROM ") {
        return delete(state, &name, rest, params).map(|n| (n, vec![]));
    }

    if sql.starts_with("SELECT") {
        return select(state, sql, params).map(|rows| (rows.len() as u64, rows));
    }

    Err(TargetError::new(None, format!("mock target can't interpret: {}", sql)))
}

fn insert(state: &mut TargetState, name: &str, rest: &str, params: &[Cell]) -> TargetResult<u64> {
    // INSERT INTO "t" (...) SELECT ... FROM "s"
    if let Some(idx) = rest.find(" FROM ") {
        if rest.contains(" SELECT ") {
            let (staging, _) = leading_ident(&rest[idx + " FROM ".len()..]).ok_or_else(|| missing(name))?;
            let staged = state.tables.get(&staging).ok_or_else(|| missing(&staging))?.rows.clone();
            let table = state.tables.get_mut(name).ok_or_else(|| missing(name))?;
            for row in &staged {
                if table.position(&table.key_of(row)).is_some() {
                    return Err(violation(name));
                }
            }
            table.rows.extend(staged.iter().cloned());
            return Ok(staged.len() as u64);
        }
    }

    let table = state.tables.get_mut(name).ok_or_else(|| missing(name))?;
    let row: Row = params.to_vec();
    if row.len() != table.columns.len() {
        return Err(TargetError::new(Some("42601"), "wrong number of values"));
    }
    let key = table.key_of(&row);
    match table.position(&key) {
        None => {
            table.rows.push(row);
            Ok(1)
        }
        Some(_) if rest.contains("DO NOTHING") => Ok(0),
        Some(pos) if rest.contains("ON CONFLICT") => {
            table.rows[pos] = row;
            Ok(1)
        }
        Some(_) => Err(violation(name)),
    }
}

fn delete(state: &mut TargetState, name: &str, rest: &str, params: &[Cell]) -> TargetResult<u64> {
    // DELETE FROM "t" USING "s" WHERE ...
    if let Some(using) = rest.trim_start().strip_prefix("USING ") {
        let (staging, _) = leading_ident(using).ok_or_else(|| missing(name))?;
        let staged = state.tables.get(&staging).ok_or_else(|| missing(&staging))?.clone();
        let table = state.tables.get_mut(name).ok_or_else(|| missing(name))?;
        let before = table.rows.len();
        if staged.columns.len() == 1 {
            let column = table.column(&staged.columns[0]).ok_or_else(|| missing(&staged.columns[0]))?;
            table
                .rows
                .retain(|r| !staged.rows.iter().any(|s| s[0] == r[column]));
        } else {
            let keys: Vec<Vec<Cell>> = staged.rows.iter().map(|r| staged.key_of(r)).collect();
            let key_idx = table.key.clone();
            table
                .rows
                .retain(|r| !keys.contains(&key_idx.iter().map(|&i| r[i].clone()).collect()));
        }
        return Ok((before - table.rows.len()) as u64);
    }

    // DELETE FROM "t" WHERE "a" = $1::text AND "b"::text = $2
    let where_clause = rest.trim_start().strip_prefix("WHERE ").unwrap_or_default();
    let table = state.tables.get_mut(name).ok_or_else(|| missing(name))?;
    let mut columns = Vec::new();
    for clause in where_clause.split(" AND ") {
        let (column, _) = leading_ident(clause).ok_or_else(|| missing(name))?;
        columns.push(table.column(&column).ok_or_else(|| missing(&column))?);
    }
    let before = table.rows.len();
    table
        .rows
        .retain(|r| !columns.iter().zip(params).all(|(&c, p)| r[c] == *p));
    Ok((before - table.rows.len()) as u64)
}

fn select(state: &TargetState, sql: &str, params: &[Cell]) -> TargetResult<Vec<Row>> {
    let from = sql
        .match_indices(" FROM ")
        .map(|(i, _)| i)
        .find(|&i| !sql[..i].ends_with("EPOCH"))
        .ok_or_else(|| missing("?"))?;
    let (name, tail) = leading_ident(&sql[from + " FROM ".len()..]).ok_or_else(|| missing("?"))?;
    let table = state.tables.get(&name).ok_or_else(|| missing(&name))?;
    let projection = &sql[..from];

    // High-water marks.
    if projection.contains("MAX(") {
        let column_name = idents(projection).into_iter().next().unwrap_or_default();
        let column = table.column(&column_name).ok_or_else(|| missing(&column_name))?;
        let values = table.rows.iter().filter_map(|r| r[column].clone());
        let max = if projection.contains("EXTRACT(EPOCH") {
            values.filter_map(|v| epoch_millis(&v)).max().map(|m| m.to_string())
        } else if let Some(max) = values.clone().map(|v| v.parse::<i64>()).collect::<Result<Vec<_>, _>>().ok().and_then(|v| v.into_iter().max()) {
            Some(max.to_string())
        } else {
            values.max()
        };
        return Ok(vec![vec![max]]);
    }

    // Key selects: `"a"::text, (EXTRACT(EPOCH FROM "b") * 1000)::bigint::text`
    let selected: Vec<(usize, bool)> = projection
        .split(", ")
        .map(|item| {
            let name = idents(item).into_iter().next().unwrap_or_default();
            let column = table.column(&name).ok_or_else(|| missing(&name))?;
            Ok((column, item.contains("EXTRACT(EPOCH")))
        })
        .collect::<TargetResult<_>>()?;

    // `WHERE <key> <= $1`, NULL never matches.
    let bound = match tail.find("WHERE ") {
        Some(idx) => {
            let clause = &tail[idx..];
            let name = idents(clause).into_iter().next().unwrap_or_default();
            let column = table.column(&name).ok_or_else(|| missing(&name))?;
            let limit = params.first().cloned().flatten().unwrap_or_default();
            Some((column, clause.contains("EXTRACT(EPOCH"), limit))
        }
        None => None,
    };

    let order: Vec<usize> = match tail.find("ORDER BY ") {
        Some(idx) => idents(&tail[idx..])
            .iter()
            .map(|c| table.column(c).ok_or_else(|| missing(c)))
            .collect::<TargetResult<_>>()?,
        None => Vec::new(),
    };
    let mut rows: Vec<Row> = table
        .rows
        .iter()
        .filter(|r| match &bound {
            Some((column, epoch, limit)) => r[*column]
                .as_deref()
                .is_some_and(|v| at_or_below(v, limit, *epoch)),
            None => true,
        })
        .cloned()
        .collect();
    rows.sort_by(|a, b| {
        order
            .iter()
            .map(|&i| a[i].cmp(&b[i]))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(rows
        .into_iter()
        .map(|r| {
            selected
                .iter()
                .map(|&(i, epoch)| {
                    if epoch {
                        r[i].as_deref().and_then(epoch_millis).map(|m| m.to_string())
                    } else {
                        r[i].clone()
                    }
                })
                .collect()
        })
        .collect())
}

fn epoch_millis(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.timestamp_millis())
}

fn at_or_below(value: &str, limit: &str, epoch: bool) -> bool {
    if epoch {
        return match (epoch_millis(value), limit.parse::<i64>()) {
            (Some(v), Ok(l)) => v <= l,
            _ => false,
        };
    }
    if let (Ok(v), Ok(l)) = (value.parse::<i64>(), limit.parse::<i64>()) {
        return v <= l;
    }
    if let (Ok(v), Ok(l)) = (value.parse::<f64>(), limit.parse::<f64>()) {
        return v <= l;
    }
    value <= limit
}

fn copy_rows(state: &mut TargetState, statement: &str, data: &str) -> TargetResult<u64> {
    let (name, _) = ident_after(statement, "COPY ").ok_or_else(|| missing("?"))?;
    let table = state.tables.get_mut(&name).ok_or_else(|| missing(&name))?;

    let mut incoming: Vec<Row> = Vec::new();
    for line in data.lines() {
        let row: Row = line.split('\t').map(unescape).collect();
        if row.len() != table.columns.len() {
            return Err(TargetError::new(Some("22P04"), "missing data for column"));
        }
        let key = table.key_of(&row);
        if table.position(&key).is_some() || incoming.iter().any(|r| table.key_of(r) == key) {
            return Err(violation(&name));
        }
        incoming.push(row);
    }
    let count = incoming.len() as u64;
    table.rows.extend(incoming);
    Ok(count)
}
