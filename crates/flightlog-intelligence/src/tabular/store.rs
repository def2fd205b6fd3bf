//! Per-session in-memory SQL engine.
//!
//! One SQLite connection per session, created at ingest time and sealed
//! read-only before the first query is served. Integer cells keep their
//! full width inside the engine; narrowing to finite reals happens only
//! when a cell crosses a JSON boundary.

use anyhow::{anyhow, Result};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Real,
    Text,
}

impl ColumnType {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

/// A typed result cell. `Integer` preserves the engine's full i64 width.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Serialize for the wire. Wide integers are narrowed to finite reals
    /// so downstream JSON consumers never see values they cannot represent.
    /// Counts beyond the f64 mantissa range are out of support.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null => serde_json::Value::Null,
            Cell::Integer(v) => serde_json::json!(*v as f64),
            Cell::Real(v) => {
                if v.is_finite() {
                    serde_json::json!(v)
                } else {
                    serde_json::Value::Null
                }
            }
            Cell::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Real(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Quote an identifier for SQL. All generated identifiers go through this,
/// which also makes reserved-keyword column names (`offset`, `order`)
/// queryable.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_text_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Rows per generated INSERT statement.
const INSERT_CHUNK_ROWS: usize = 500;

pub struct TabularStore {
    conn: Mutex<Connection>,
}

impl TabularStore {
    pub fn new() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| anyhow!("Failed to open in-memory database: {}", e))?;
        register_percentile(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Table store lock poisoned"))
    }

    /// Fails if the table already exists; callers drop first.
    pub fn create_table(&self, name: &str, columns: &[ColumnDef]) -> Result<()> {
        if columns.is_empty() {
            return Err(anyhow!("Cannot create table '{}' with no columns", name));
        }
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;
        if exists {
            return Err(anyhow!("Table '{}' already exists", name));
        }

        let cols = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!("CREATE TABLE {} ({})", quote_ident(name), cols))?;
        debug!("Created table {} with {} columns", name, columns.len());
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
        Ok(())
    }

    pub fn create_index(&self, table: &str, column: &str) -> Result<()> {
        let conn = self.lock()?;
        let index_name = format!("idx_{}_{}", table, column);
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index_name),
            quote_ident(table),
            quote_ident(column)
        ))?;
        Ok(())
    }

    /// Insert rows via a single multi-row VALUES statement per chunk.
    /// Fails on any row whose width does not match the column list.
    pub fn bulk_insert(&self, name: &str, columns: &[String], rows: &[Vec<Cell>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(anyhow!(
                    "Row {} has {} cells but table '{}' has {} columns",
                    i,
                    row.len(),
                    name,
                    columns.len()
                ));
            }
        }

        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.lock()?;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let values = chunk
                .iter()
                .map(|row| {
                    let cells = row.iter().map(cell_literal).collect::<Vec<_>>().join(", ");
                    format!("({})", cells)
                })
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute_batch(&format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(name),
                col_list,
                values
            ))?;
        }
        Ok(())
    }

    /// Make the store read-only. Called by the ingester once all tables
    /// are loaded; every later write attempt fails at the engine level.
    pub fn seal(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(())
    }

    /// Execute a single read-only SELECT and return typed cells.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(anyhow!("Empty query"));
        }
        let is_select =
            trimmed.len() >= 6 && trimmed.as_bytes()[..6].eq_ignore_ascii_case(b"select");
        if !is_select {
            return Err(anyhow!("Only SELECT statements are allowed"));
        }
        if trimmed.contains(';') {
            return Err(anyhow!("Multiple statements are not allowed"));
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(trimmed)
            .map_err(|e| anyhow!("SQL error: {}", e))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let ncols = columns.len();

        let mut out_rows = Vec::new();
        let mut rows = stmt.query([]).map_err(|e| anyhow!("SQL error: {}", e))?;
        while let Some(row) = rows.next().map_err(|e| anyhow!("SQL error: {}", e))? {
            let mut cells = Vec::with_capacity(ncols);
            for i in 0..ncols {
                let cell = match row.get_ref(i)? {
                    ValueRef::Null => Cell::Null,
                    ValueRef::Integer(v) => Cell::Integer(v),
                    ValueRef::Real(v) => Cell::Real(v),
                    ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).to_string()),
                    ValueRef::Blob(_) => Cell::Null,
                };
                cells.push(cell);
            }
            out_rows.push(cells);
        }

        Ok(QueryResult {
            columns,
            rows: out_rows,
        })
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub fn describe(&self, name: &str) -> Result<Vec<ColumnDef>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let mut rows = stmt.query([])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            let col_name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            let column_type = if declared.eq_ignore_ascii_case("text") {
                ColumnType::Text
            } else {
                ColumnType::Real
            };
            columns.push(ColumnDef {
                name: col_name,
                column_type,
            });
        }
        if columns.is_empty() {
            return Err(anyhow!("No such table: {}", name));
        }
        Ok(columns)
    }
}

fn cell_literal(cell: &Cell) -> String {
    match cell {
        Cell::Null => "NULL".to_string(),
        Cell::Integer(v) => v.to_string(),
        Cell::Real(v) => {
            if v.is_finite() {
                format!("{:?}", v)
            } else {
                "NULL".to_string()
            }
        }
        Cell::Text(s) => quote_text_literal(s),
    }
}

/// `percentile(value, p)` aggregate with linear interpolation, p in [0, 100].
struct Percentile;

type PercentileState = (Vec<f64>, Option<f64>);

impl Aggregate<PercentileState, Option<f64>> for Percentile {
    fn init(&self, _: &mut Context<'_>) -> rusqlite::Result<PercentileState> {
        Ok((Vec::new(), None))
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut PercentileState) -> rusqlite::Result<()> {
        let value = match ctx.get_raw(0) {
            ValueRef::Integer(v) => v as f64,
            ValueRef::Real(v) => v,
            _ => return Ok(()),
        };
        let p: f64 = ctx.get(1)?;
        acc.0.push(value);
        acc.1 = Some(p);
        Ok(())
    }

    fn finalize(
        &self,
        _: &mut Context<'_>,
        acc: Option<PercentileState>,
    ) -> rusqlite::Result<Option<f64>> {
        let (mut values, p) = match acc {
            Some(state) => state,
            None => return Ok(None),
        };
        let p = match p {
            Some(p) => p.clamp(0.0, 100.0),
            None => return Ok(None),
        };
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (p / 100.0) * (values.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let result = if lo == hi {
            values[lo]
        } else {
            values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
        };
        Ok(Some(result))
    }
}

fn register_percentile(conn: &Connection) -> Result<()> {
    conn.create_aggregate_function(
        "percentile",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        Percentile,
    )
    .map_err(|e| anyhow!("Failed to register percentile aggregate: {}", e))
}
