#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use linkage_harness::{BlockingRule, EmTrainingOptions, InputTable, Linker, ParameterHistory, Settings};

#[derive(Parser)]
#[command(name = "linkage", version, about = "Record linkage parameter estimation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Inputs {
    /// Model settings JSON
    #[arg(long)]
    settings: PathBuf,
    /// Input dataset as NAME=PATH to a JSON lines file (repeatable)
    #[arg(long = "input", required = true)]
    inputs: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Count pairs generated by a blocking rule's equi-join conditions
    Count {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long)]
        rule: String,
        /// Run the full rule, filters included
        #[arg(long)]
        post_filters: bool,
    },
    /// Cumulative pair counts for a list of blocking rules
    Cumulative {
        #[command(flatten)]
        inputs: Inputs,
        /// Defaults to the settings' prediction rules
        #[arg(long = "rule")]
        rules: Vec<String>,
        #[arg(long)]
        no_chart: bool,
        /// Emit a column/row table instead of records
        #[arg(long)]
        table: bool,
    },
    /// Estimate u probabilities by random sampling and write the updated settings
    EstimateU {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, default_value_t = 1_000_000)]
        target_rows: u64,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Run one EM training session and write its parameter history
    Train {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long)]
        rule: String,
        #[arg(long)]
        fix_m: bool,
        #[arg(long)]
        fix_u: bool,
        #[arg(long)]
        fix_lambda: bool,
        /// Comparison to deactivate (repeatable)
        #[arg(long = "deactivate")]
        deactivate: Vec<String>,
        #[arg(long)]
        without_tf: bool,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkage_harness=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count {
            inputs,
            rule,
            post_filters,
        } => {
            let linker = load_linker(&inputs, None).await?;
            let count = if post_filters {
                linker.count_comparisons_from_blocking_rule_post_filters(rule).await?
            } else {
                linker.count_num_comparisons_from_blocking_rule(rule).await?
            };
            println!("{count}");
        }
        Commands::Cumulative {
            inputs,
            rules,
            no_chart,
            table,
        } => {
            let linker = load_linker(&inputs, None).await?;
            let rules: Vec<BlockingRule> = rules.into_iter().map(BlockingRule::from).collect();
            let result = linker
                .cumulative_comparisons_generated_by_blocking_rules(&rules, !no_chart, table)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::EstimateU {
            inputs,
            target_rows,
            seed,
            out,
        } => {
            let mut linker = load_linker(&inputs, seed).await?;
            linker.estimate_u_using_random_sampling(target_rows).await?;
            write_json(&out, linker.settings())?;
        }
        Commands::Train {
            inputs,
            rule,
            fix_m,
            fix_u,
            fix_lambda,
            deactivate,
            without_tf,
            out,
            overwrite,
        } => {
            let mut linker = load_linker(&inputs, None).await?;
            let options = EmTrainingOptions {
                fix_m_probabilities: fix_m,
                fix_u_probabilities: fix_u,
                fix_probability_two_random_records_match: fix_lambda,
                comparisons_to_deactivate: (!deactivate.is_empty()).then_some(deactivate),
                estimate_without_term_frequencies: without_tf,
            };
            let session = linker
                .estimate_parameters_using_expectation_maximisation(rule, options)
                .await?;
            eprintln!("{session}");
            ParameterHistory::from_session(&session, &linker).save_to_json_file(&out, overwrite)?;
        }
    }

    Ok(())
}

async fn load_linker(inputs: &Inputs, seed: Option<u64>) -> Result<Linker, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&inputs.settings)?;
    let mut settings = Settings::from_json_str(&raw)?;
    if let Some(seed) = seed {
        settings = settings.with_seed(seed);
    }
    let mut tables = Vec::with_capacity(inputs.inputs.len());
    for entry in &inputs.inputs {
        let (name, path) = entry
            .split_once('=')
            .ok_or_else(|| format!("--input expects NAME=PATH, got `{entry}`"))?;
        tables.push(InputTable::from_json_lines_path(name.trim(), path.trim())?);
    }
    Ok(Linker::with_sqlite(tables, settings).await?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}
