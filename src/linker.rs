//! Public facade: input tables, canonical settings and the execution backend.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::analyse_blocking::{self, CumulativeComparisons};
use crate::backend::{self, BackendError, DatabaseApi, Record, SqlPipeline, StagedTable, Table};
use crate::blocking::{quote_identifier, BlockingContext, BlockingRule};
use crate::comparison_vectors::{self, ComparisonVectorTable, AGGREGATED_VECTORS_TABLE, BLOCKED_TABLE};
use crate::em_training_session::{EmTrainingOptions, EmTrainingSession};
use crate::error::{LinkageError, Result};
use crate::estimate_u;
use crate::model::{Comparison, LinkType, Settings};

pub const CONCAT_TABLE: &str = "__linkage__df_concat";
pub const CONCAT_WITH_TF_TABLE: &str = "__linkage__df_concat_with_tf";
pub const CONCAT_WITH_TF_LEFT_TABLE: &str = "__linkage__df_concat_with_tf_left";
pub const CONCAT_WITH_TF_RIGHT_TABLE: &str = "__linkage__df_concat_with_tf_right";

/// A named input dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTable {
    pub name: String,
    pub records: Vec<Record>,
}

impl InputTable {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    /// Parse JSON Lines: one flat object per non-blank line.
    pub fn from_json_lines(name: impl Into<String>, raw: &str) -> Result<Self> {
        let name = name.into();
        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line)? {
                Value::Object(map) => records.push(map),
                other => {
                    return Err(LinkageError::config(format!(
                        "{name} line {}: expected a JSON object, got {other}",
                        idx + 1
                    )))
                }
            }
        }
        Ok(Self { name, records })
    }

    pub fn from_json_lines_path(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_lines(name, &raw)
    }
}

struct RegisteredInput {
    name: String,
    columns: Vec<String>,
    table: StagedTable,
}

/// Holds the canonical model and the registered input datasets.
///
/// Training and estimation operate on private copies of the settings; the
/// canonical settings are only written at their fold-back points. Running two
/// operations against the same linker concurrently is not supported.
pub struct Linker {
    api: Arc<dyn DatabaseApi>,
    settings: Settings,
    settings_original: Settings,
    inputs: Vec<RegisteredInput>,
    columns: Vec<String>,
}

impl std::fmt::Debug for Linker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linker")
            .field("dialect", &self.api.dialect_name())
            .field("link_type", &self.settings.link_type)
            .field("inputs", &self.input_names())
            .finish()
    }
}

impl Linker {
    pub async fn new(inputs: Vec<InputTable>, settings: Settings, api: Arc<dyn DatabaseApi>) -> Result<Self> {
        settings.validate()?;
        match (settings.link_type, inputs.len()) {
            (_, 0) => return Err(LinkageError::config("at least one input table is required")),
            (LinkType::DedupeOnly, n) if n > 1 => {
                return Err(LinkageError::config(format!(
                    "dedupe_only takes exactly one input table, got {n}"
                )))
            }
            (LinkType::LinkOnly, 1) => {
                return Err(LinkageError::config("link_only needs at least two input tables"))
            }
            _ => {}
        }
        let mut seen = BTreeSet::new();
        for input in &inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(LinkageError::config(format!("duplicate input table name `{}`", input.name)));
            }
            if let Some(idx) = input
                .records
                .iter()
                .position(|r| !r.contains_key(&settings.unique_id_column_name))
            {
                return Err(LinkageError::config(format!(
                    "{} record {idx} has no `{}` column",
                    input.name, settings.unique_id_column_name
                )));
            }
        }

        let mut registered = Vec::with_capacity(inputs.len());
        let mut columns: Vec<String> = Vec::new();
        for (i, input) in inputs.into_iter().enumerate() {
            let mut table = Table::from_records(&input.records);
            if table.columns.is_empty() {
                table.columns.push(settings.unique_id_column_name.clone());
            }
            for column in &table.columns {
                if *column != settings.source_dataset_column_name && !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
            let staged = backend::register_table(&api, &format!("__linkage__input_table_{i}"), &table).await?;
            debug!(name = %input.name, rows = table.len(), physical = %staged.physical_name(), "registered input table");
            registered.push(RegisteredInput {
                name: input.name,
                columns: table.columns,
                table: staged,
            });
        }

        Ok(Self {
            api,
            settings_original: settings.clone(),
            settings,
            inputs: registered,
            columns,
        })
    }

    /// Convenience constructor over a fresh in-memory SQLite backend.
    pub async fn with_sqlite(inputs: Vec<InputTable>, settings: Settings) -> Result<Self> {
        let api: Arc<dyn DatabaseApi> = Arc::new(backend::SqliteBackend::in_memory()?);
        Self::new(inputs, settings, api).await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Settings exactly as supplied at construction.
    pub fn settings_original(&self) -> &Settings {
        &self.settings_original
    }

    pub fn api(&self) -> &Arc<dyn DatabaseApi> {
        &self.api
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|i| i.name.as_str()).collect()
    }

    /// Union of input columns, excluding the source dataset column.
    pub fn input_columns(&self) -> &[String] {
        &self.columns
    }

    /// Link-only over exactly two datasets: left and right are blocked as separate tables.
    pub fn two_dataset_link_only(&self) -> bool {
        self.settings.link_type == LinkType::LinkOnly && self.inputs.len() == 2
    }

    pub(crate) fn input_templated_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|i| i.table.templated_name()).collect()
    }

    // -----------------------------------------------------------------
    //  Public operations
    // -----------------------------------------------------------------

    /// Exact count of pairs satisfying the rule's equi-join conditions only.
    pub async fn count_num_comparisons_from_blocking_rule(&self, rule: impl Into<BlockingRule>) -> Result<u64> {
        analyse_blocking::count_comparisons_from_blocking_rule_pre_filter_conditions(self, &rule.into()).await
    }

    /// Exact count of pairs the full rule generates, filters included.
    pub async fn count_comparisons_from_blocking_rule_post_filters(
        &self,
        rule: impl Into<BlockingRule>,
    ) -> Result<u64> {
        analyse_blocking::count_comparisons_from_blocking_rule_post_filters(self, &rule.into()).await
    }

    /// Per-rule and cumulative pair counts. Empty `rules` uses the prediction rules.
    pub async fn cumulative_comparisons_generated_by_blocking_rules(
        &self,
        rules: &[BlockingRule],
        output_chart: bool,
        return_dataframe: bool,
    ) -> Result<CumulativeComparisons> {
        analyse_blocking::cumulative_comparisons_generated_by_blocking_rules(self, rules, output_chart, return_dataframe)
            .await
    }

    /// Estimate u probabilities from roughly `target_rows` random pairs.
    pub async fn estimate_u_using_random_sampling(&mut self, target_rows: u64) -> Result<()> {
        estimate_u::estimate_u_values(self, target_rows).await
    }

    /// Run one EM training session and fold its result into the canonical model.
    pub async fn estimate_parameters_using_expectation_maximisation(
        &mut self,
        blocking_rule: impl Into<BlockingRule>,
        options: EmTrainingOptions,
    ) -> Result<EmTrainingSession> {
        let mut session = EmTrainingSession::new(self, blocking_rule.into(), options)?;
        session.train(self).await?;
        Ok(session)
    }

    // -----------------------------------------------------------------
    //  Pipeline building blocks
    // -----------------------------------------------------------------

    /// Vertically concatenate every input under the union of their columns.
    pub(crate) fn enqueue_df_concat(&self, pipeline: &mut SqlPipeline) {
        let sd = &self.settings.source_dataset_column_name;
        let branches: Vec<String> = self
            .inputs
            .iter()
            .map(|input| {
                let mut select = Vec::with_capacity(self.columns.len() + 1);
                if input.columns.contains(sd) {
                    select.push(quote_identifier(sd));
                } else {
                    select.push(format!("{} AS {}", sql_string(&input.name), quote_identifier(sd)));
                }
                for column in &self.columns {
                    let q = quote_identifier(column);
                    if input.columns.contains(column) {
                        select.push(q);
                    } else {
                        select.push(format!("NULL AS {q}"));
                    }
                }
                format!("select {} from {}", select.join(", "), input.table.templated_name())
            })
            .collect();
        pipeline.enqueue_sql(branches.join("\nUNION ALL\n"), CONCAT_TABLE);
    }

    /// Concatenation plus a `tf_<col>` relative-frequency column per term
    /// frequency adjusted column named in `settings`.
    pub(crate) fn enqueue_df_concat_with_tf(&self, pipeline: &mut SqlPipeline, settings: &Settings) {
        self.enqueue_df_concat(pipeline);
        let tf_columns = settings.tf_adjustment_columns();
        if tf_columns.is_empty() {
            pipeline.enqueue_sql(format!("select * from {CONCAT_TABLE}"), CONCAT_WITH_TF_TABLE);
        } else {
            let mut selects = vec![format!("{CONCAT_TABLE}.*")];
            let mut joins = Vec::new();
            for column in &tf_columns {
                let q = quote_identifier(column);
                let tf_name = format!("tf_{column}");
                let tf_table = format!("__linkage__df_tf_{column}");
                pipeline.enqueue_sql(
                    format!(
                        "select {q}, CAST(count(*) AS DOUBLE) / (select count({q}) from {CONCAT_TABLE}) AS {tf} \
                         from {CONCAT_TABLE} where {q} is not null group by {q}",
                        tf = quote_identifier(&tf_name),
                    ),
                    tf_table.clone(),
                );
                selects.push(format!("{tf_table}.{}", quote_identifier(&tf_name)));
                joins.push(format!("left join {tf_table} on {CONCAT_TABLE}.{q} = {tf_table}.{q}"));
            }
            pipeline.enqueue_sql(
                format!("select {} from {CONCAT_TABLE} {}", selects.join(", "), joins.join(" ")),
                CONCAT_WITH_TF_TABLE,
            );
        }
        if self.two_dataset_link_only() {
            let sd = quote_identifier(&settings.source_dataset_column_name);
            for (input, table) in self.inputs.iter().zip([CONCAT_WITH_TF_LEFT_TABLE, CONCAT_WITH_TF_RIGHT_TABLE]) {
                pipeline.enqueue_sql(
                    format!(
                        "select * from {CONCAT_WITH_TF_TABLE} where {sd} = {}",
                        sql_string(&input.name)
                    ),
                    table,
                );
            }
        }
    }

    /// Blocking context over the concatenated-with-tf tables.
    pub(crate) fn blocking_context<'a>(&'a self, settings: &'a Settings) -> BlockingContext<'a> {
        let two = self.two_dataset_link_only();
        BlockingContext {
            link_type: settings.link_type,
            two_dataset_link_only: two,
            unique_id_column_name: &settings.unique_id_column_name,
            source_dataset_column_name: &settings.source_dataset_column_name,
            input_tablename_l: if two { CONCAT_WITH_TF_LEFT_TABLE } else { CONCAT_WITH_TF_TABLE },
            input_tablename_r: if two { CONCAT_WITH_TF_RIGHT_TABLE } else { CONCAT_WITH_TF_TABLE },
        }
    }

    /// Execute `pipeline` with the input tables (and `extra_inputs`) in scope.
    pub(crate) async fn execute(
        &self,
        pipeline: &SqlPipeline,
        extra_inputs: &[&StagedTable],
        phase: &str,
    ) -> Result<StagedTable> {
        let mut inputs: Vec<&StagedTable> = self.inputs.iter().map(|i| &i.table).collect();
        inputs.extend_from_slice(extra_inputs);
        let physical_name = backend::pipeline_physical_name(pipeline);
        let result = self
            .with_timeout(
                phase,
                backend::execute_pipeline_into(&self.api, pipeline, &inputs, physical_name.clone()),
            )
            .await;
        if matches!(result, Err(LinkageError::Timeout { .. })) {
            // The backend may still finish creating the table after the caller gave up.
            warn!(table = %physical_name, phase, "dropping table abandoned by timeout");
            if let Err(e) = self.api.drop_table(&physical_name).await {
                warn!(table = %physical_name, error = %e, "failed to drop abandoned table");
            }
        }
        result
    }

    pub(crate) async fn with_timeout<T, F>(&self, phase: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        match self.settings.phase_timeout_secs {
            Some(secs) => {
                let after = Duration::from_secs(secs);
                tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| LinkageError::Timeout {
                        phase: phase.to_string(),
                        after,
                    })?
                    .map_err(LinkageError::from)
            }
            None => fut.await.map_err(LinkageError::from),
        }
    }

    /// Execute a pipeline ending in the blocking stage, then compute comparison
    /// vectors from it. Backends that ask for it get the blocked pairs
    /// materialised first.
    pub(crate) async fn comparison_vectors_after_blocking(
        &self,
        mut pipeline: SqlPipeline,
        comparisons: &[Comparison],
        unique_id_column_name: &str,
        inputs: &[&StagedTable],
        phase: &str,
    ) -> Result<StagedTable> {
        if !self.api.supports_repartition_after_blocking() {
            comparison_vectors::enqueue_comparison_vectors(&mut pipeline, comparisons, unique_id_column_name);
            return self.execute(&pipeline, inputs, phase).await;
        }
        debug!(table = BLOCKED_TABLE, "materialising blocked pairs before computing comparison vectors");
        let blocked = self.execute(&pipeline, inputs, phase).await?;
        let mut next = SqlPipeline::new();
        comparison_vectors::enqueue_comparison_vectors(&mut next, comparisons, unique_id_column_name);
        let result = self.execute(&next, &[&blocked], phase).await;
        backend::release(result, vec![blocked]).await
    }

    /// Aggregate staged comparison vectors into the table EM consumes.
    pub(crate) async fn load_comparison_vector_table(
        &self,
        vectors: &StagedTable,
        comparisons: &[Comparison],
        phase: &str,
    ) -> Result<ComparisonVectorTable> {
        let mut pipeline = SqlPipeline::new();
        pipeline.enqueue_sql(
            comparison_vectors::aggregate_comparison_vectors_sql(comparisons),
            AGGREGATED_VECTORS_TABLE,
        );
        let counts = self.execute(&pipeline, &[vectors], phase).await?;
        let table = self.with_timeout(phase, counts.into_table()).await?;
        let vectors = ComparisonVectorTable::from_table(&table, comparisons)?;
        info!(
            distinct_vectors = vectors.rows.len(),
            pairs = vectors.total_count(),
            "loaded comparison vectors"
        );
        Ok(vectors)
    }
}

/// Single-quoted SQL string literal.
pub(crate) fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Read an integer count from the first row of a staged result, then release it.
pub(crate) async fn single_count(linker: &Linker, staged: StagedTable, column: &str, phase: &str) -> Result<u64> {
    let records = linker.with_timeout(phase, staged.into_records()).await?;
    let value = records.first().and_then(|r| r.get(column)).cloned().unwrap_or(Value::Null);
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .ok_or_else(|| LinkageError::Backend(BackendError::InvalidValue(format!("negative count {n}")))),
        other => Err(LinkageError::Backend(BackendError::InvalidValue(format!(
            "expected a count in `{column}`, got {other}"
        )))),
    }
}
