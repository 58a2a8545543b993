//! SQLite execution backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::debug;

use super::{BackendError, DatabaseApi, Table};
use crate::blocking::quote_identifier;

/// Runs pipelines against a single SQLite connection.
///
/// Registers `levenshtein(a, b)` and `jaro_winkler(a, b)` so comparison
/// levels can use fuzzy string matching.
#[derive(Clone)]
pub struct SqliteBackend {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn in_memory() -> Result<Self, BackendError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn, Some(path))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, BackendError> {
        register_functions(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Database file, `None` for an in-memory backend.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&Connection) -> Result<R, BackendError>,
    {
        let guard = self.conn.lock().map_err(|_| BackendError::Poisoned)?;
        f(&guard)
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&Connection) -> Result<R, BackendError> + Send + 'static,
        R: Send + 'static,
    {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.with_conn(f))
            .await
            .map_err(|e| BackendError::Join(e.to_string()))?
    }
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("levenshtein", 2, flags, |ctx| {
        Ok(match (text_arg(ctx, 0), text_arg(ctx, 1)) {
            (Some(a), Some(b)) => Some(strsim::levenshtein(&a, &b) as i64),
            _ => None,
        })
    })?;
    conn.create_scalar_function("jaro_winkler", 2, flags, |ctx| {
        Ok(match (text_arg(ctx, 0), text_arg(ctx, 1)) {
            (Some(a), Some(b)) => Some(strsim::jaro_winkler(&a, &b)),
            _ => None,
        })
    })?;
    Ok(())
}

/// Text form of a function argument; NULL stays `None`.
fn text_arg(ctx: &Context<'_>, idx: usize) -> Option<String> {
    match ctx.get_raw(idx) {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

#[async_trait]
impl DatabaseApi for SqliteBackend {
    fn dialect_name(&self) -> &'static str {
        "sqlite"
    }

    async fn register_table(&self, physical_name: &str, table: &Table) -> Result<(), BackendError> {
        if table.columns.is_empty() {
            return Err(BackendError::InvalidValue(format!(
                "cannot register `{physical_name}` without columns"
            )));
        }
        let name = quote_identifier(physical_name);
        let columns: Vec<String> = table.columns.iter().map(|c| quote_identifier(c)).collect();
        let create = format!("CREATE TABLE {name} ({})", columns.join(", "));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert = format!("INSERT INTO {name} VALUES ({})", placeholders.join(", "));
        let rows: Vec<Vec<SqlValue>> = table
            .rows
            .iter()
            .map(|row| row.iter().map(json_to_sql).collect())
            .collect();
        let width = columns.len();
        debug!(table = %physical_name, rows = rows.len(), "registering table");

        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(&create, [])?;
            {
                let mut stmt = tx.prepare(&insert)?;
                for row in &rows {
                    if row.len() != width {
                        return Err(BackendError::InvalidValue(format!(
                            "row has {} values, expected {width}",
                            row.len()
                        )));
                    }
                    stmt.execute(params_from_iter(row.iter()))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn materialise(&self, sql: &str, physical_name: &str) -> Result<(), BackendError> {
        let statement = format!("CREATE TABLE {} AS {sql}", quote_identifier(physical_name));
        debug!(table = %physical_name, "materialising pipeline");
        self.run_blocking(move |conn| {
            conn.execute_batch(&statement)?;
            Ok(())
        })
        .await
    }

    async fn fetch(&self, physical_name: &str, limit: Option<usize>) -> Result<Table, BackendError> {
        let physical_name = physical_name.to_string();
        self.run_blocking(move |conn| {
            let exists: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&physical_name],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(BackendError::MissingTable(physical_name));
            }
            let mut sql = format!("SELECT * FROM {}", quote_identifier(&physical_name));
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {n}"));
            }
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut table = Table::new(columns);
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(sql_to_json(row.get_ref(idx)?));
                }
                table.push_row(values);
            }
            Ok(table)
        })
        .await
    }

    async fn drop_table(&self, physical_name: &str) -> Result<(), BackendError> {
        let statement = format!("DROP TABLE IF EXISTS {}", quote_identifier(physical_name));
        self.run_blocking(move |conn| {
            conn.execute_batch(&statement)?;
            Ok(())
        })
        .await
    }
}
