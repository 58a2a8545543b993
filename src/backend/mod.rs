//! Execution backend contract.
//!
//! The core never runs SQL itself: it enqueues named stages into a
//! [`SqlPipeline`], hands the pipeline to a [`DatabaseApi`], and reads the
//! materialised result through a [`StagedTable`] handle. Staged results are
//! ephemeral and must be released with [`StagedTable::drop_table`] (or one of
//! the consuming `into_*` readers) once their consumer has read them.

pub mod error;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::blocking::quote_identifier;

pub use error::BackendError;
pub use sqlite::SqliteBackend;

/// One result row keyed by column name.
pub type Record = serde_json::Map<String, Value>;

/// A tabular result: ordered column names plus rows of JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table whose columns are the union of record keys in first-seen order.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Relational execution service.
///
/// Implementations own physical storage; the core addresses it only by the
/// physical names it asks to be created.
#[async_trait]
pub trait DatabaseApi: Send + Sync {
    fn dialect_name(&self) -> &'static str;

    /// Whether blocked pairs should be materialised before computing
    /// comparison vectors (useful for distributed engines).
    fn supports_repartition_after_blocking(&self) -> bool {
        false
    }

    /// Load caller-supplied rows under `physical_name`.
    async fn register_table(&self, physical_name: &str, table: &Table) -> Result<(), BackendError>;

    /// Run `sql` and store its result under `physical_name`.
    async fn materialise(&self, sql: &str, physical_name: &str) -> Result<(), BackendError>;

    async fn fetch(&self, physical_name: &str, limit: Option<usize>) -> Result<Table, BackendError>;

    async fn drop_table(&self, physical_name: &str) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
struct PipelineStage {
    sql: String,
    output_table_name: String,
}

/// Ordered named query stages executed as one `WITH` statement.
#[derive(Debug, Clone, Default)]
pub struct SqlPipeline {
    stages: Vec<PipelineStage>,
}

impl SqlPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_sql(&mut self, sql: impl Into<String>, output_table_name: impl Into<String>) {
        self.stages.push(PipelineStage {
            sql: sql.into(),
            output_table_name: output_table_name.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn output_table_name(&self) -> Option<&str> {
        self.stages.last().map(|s| s.output_table_name.as_str())
    }

    /// Compile to a single statement. Inputs are aliased under their templated names.
    pub fn compile(&self, inputs: &[&StagedTable]) -> Result<String, BackendError> {
        let last = self
            .output_table_name()
            .ok_or_else(|| BackendError::InvalidValue("cannot execute an empty pipeline".into()))?;
        let mut ctes: Vec<String> = inputs
            .iter()
            .map(|t| format!("{} AS (SELECT * FROM {})", t.templated_name, quote_identifier(&t.physical_name)))
            .collect();
        ctes.extend(
            self.stages
                .iter()
                .map(|s| format!("{} AS (\n{}\n)", s.output_table_name, s.sql)),
        );
        Ok(format!("WITH {}\nSELECT * FROM {last}", ctes.join(",\n")))
    }
}

/// Handle to a materialised result.
pub struct StagedTable {
    api: Arc<dyn DatabaseApi>,
    templated_name: String,
    physical_name: String,
}

impl std::fmt::Debug for StagedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedTable")
            .field("templated_name", &self.templated_name)
            .field("physical_name", &self.physical_name)
            .finish()
    }
}

impl StagedTable {
    pub fn templated_name(&self) -> &str {
        &self.templated_name
    }

    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    pub async fn as_table(&self, limit: Option<usize>) -> Result<Table, BackendError> {
        self.api.fetch(&self.physical_name, limit).await
    }

    pub async fn as_records(&self, limit: Option<usize>) -> Result<Vec<Record>, BackendError> {
        Ok(self.as_table(limit).await?.records())
    }

    /// First row only; `None` when the table is empty.
    pub async fn first_record(&self) -> Result<Option<Record>, BackendError> {
        Ok(self.as_records(Some(1)).await?.into_iter().next())
    }

    /// Read the whole table, then release it whatever the read outcome.
    pub async fn into_table(self) -> Result<Table, BackendError> {
        let result = self.as_table(None).await;
        release(result, vec![self]).await
    }

    pub async fn into_records(self) -> Result<Vec<Record>, BackendError> {
        Ok(self.into_table().await?.records())
    }

    pub async fn drop_table(self) -> Result<(), BackendError> {
        self.api.drop_table(&self.physical_name).await
    }
}

fn physical_name_for(templated_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{templated_name}_{}", &suffix[..12])
}

/// Fresh physical name for the final stage of `pipeline`.
pub fn pipeline_physical_name(pipeline: &SqlPipeline) -> String {
    physical_name_for(pipeline.output_table_name().unwrap_or_default())
}

/// Execute `pipeline` and materialise its final stage.
pub async fn execute_pipeline(
    api: &Arc<dyn DatabaseApi>,
    pipeline: &SqlPipeline,
    inputs: &[&StagedTable],
) -> Result<StagedTable, BackendError> {
    execute_pipeline_into(api, pipeline, inputs, pipeline_physical_name(pipeline)).await
}

/// Execute `pipeline`, materialising its final stage as `physical_name`.
pub async fn execute_pipeline_into(
    api: &Arc<dyn DatabaseApi>,
    pipeline: &SqlPipeline,
    inputs: &[&StagedTable],
    physical_name: String,
) -> Result<StagedTable, BackendError> {
    let sql = pipeline.compile(inputs)?;
    let templated_name = pipeline.output_table_name().unwrap_or_default().to_string();
    api.materialise(&sql, &physical_name).await?;
    Ok(StagedTable {
        api: Arc::clone(api),
        templated_name,
        physical_name,
    })
}

/// Load rows as a new staged table addressable as `templated_name`.
pub async fn register_table(
    api: &Arc<dyn DatabaseApi>,
    templated_name: &str,
    table: &Table,
) -> Result<StagedTable, BackendError> {
    let physical_name = physical_name_for(templated_name);
    api.register_table(&physical_name, table).await?;
    Ok(StagedTable {
        api: Arc::clone(api),
        templated_name: templated_name.to_string(),
        physical_name,
    })
}

/// Drop every table, then return `result`. A drop failure only surfaces when
/// `result` itself succeeded.
pub async fn release<T, E>(result: Result<T, E>, tables: Vec<StagedTable>) -> Result<T, E>
where
    E: From<BackendError>,
{
    let mut drop_error = None;
    for table in tables {
        let name = table.physical_name.clone();
        if let Err(e) = table.drop_table().await {
            warn!(table = %name, error = %e, "failed to drop staged table");
            drop_error.get_or_insert(e);
        }
    }
    match (result, drop_error) {
        (Ok(_), Some(e)) => Err(E::from(e)),
        (result, _) => result,
    }
}
