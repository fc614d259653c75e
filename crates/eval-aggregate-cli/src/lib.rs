//! Command surface for benchmark result aggregation.
//!
//! - [`run_cli`] executes the parsed command graph.
//! - [`load_taxonomy_csv`] loads the four-column task taxonomy table.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use eval_aggregate_core::{
    AggregateRecord, Aggregator, TaskEntry, Taxonomy, RECORD_FILE_NAME,
};
use serde::Serialize;

const TAXONOMY_HEADER: [&str; 4] = ["column", "path", "key", "max_score"];

#[derive(Debug, Parser)]
#[command(name = "evagg")]
#[command(about = "Benchmark evaluation result aggregation")]
pub struct Cli {
    /// Base directory under which all models' evaluation outputs live.
    #[arg(long, default_value = "./results")]
    result_root: PathBuf,

    /// Task taxonomy table (column,path,key,max_score).
    #[arg(long, default_value = "./column-path-key.csv")]
    taxonomy: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve and normalize every taxonomy task for one model and persist
    /// the aggregate record.
    Aggregate(AggregateArgs),
    /// Report task columns left unresolved in persisted aggregate records.
    Missing(MissingArgs),
}

#[derive(Debug, Args)]
pub struct AggregateArgs {
    /// Model identifier (may contain slashes, e.g. org/model-7b).
    #[arg(long)]
    model: String,
}

#[derive(Debug, Args)]
pub struct MissingArgs {
    /// Restrict the report to one model; otherwise every model directory
    /// with a persisted record is scanned.
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MissingReport {
    pub model: String,
    pub missing: Vec<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the taxonomy table cannot be loaded, the aggregate
/// record cannot be persisted, or a requested record is missing.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Aggregate(args) => run_aggregate(&cli.result_root, &cli.taxonomy, &args),
        Command::Missing(args) => run_missing(&cli.result_root, &args),
    }
}

fn run_aggregate(result_root: &Path, taxonomy_path: &Path, args: &AggregateArgs) -> Result<()> {
    let taxonomy = load_taxonomy_csv(taxonomy_path)?;
    let aggregator = Aggregator::new(result_root, taxonomy);
    let record = aggregator.aggregate(&args.model)?;

    let unresolved = record.unresolved_columns();
    if unresolved.is_empty() {
        tracing::info!(model = %record.model, tasks = record.tasks.len(), "all tasks resolved");
    } else {
        tracing::info!(
            model = %record.model,
            tasks = record.tasks.len(),
            unresolved = %unresolved.join(","),
            "aggregation finished with unresolved tasks"
        );
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_missing(result_root: &Path, args: &MissingArgs) -> Result<()> {
    let models = match &args.model {
        Some(model) => vec![model.clone()],
        None => discover_models(result_root),
    };

    let mut reports = Vec::new();
    for model in models {
        let path = result_root.join(&model).join(RECORD_FILE_NAME);
        let body = fs::read_to_string(&path)
            .with_context(|| format!("no aggregate record for {model} at {}", path.display()))?;
        let record: AggregateRecord = serde_json::from_str(&body)
            .with_context(|| format!("invalid aggregate record at {}", path.display()))?;
        reports.push(MissingReport {
            model: record.model.clone(),
            missing: record.unresolved_columns(),
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_missing_reports(&reports);
    }
    Ok(())
}

/// Model directories under `result_root` holding a persisted record, sorted
/// for deterministic output. Model identifiers may span several path
/// components (org/model), so the scan is recursive.
fn discover_models(result_root: &Path) -> Vec<String> {
    let mut models = Vec::new();
    let mut stack = vec![result_root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if path.join(RECORD_FILE_NAME).is_file() {
                if let Ok(relative) = path.strip_prefix(result_root) {
                    models.push(relative.to_string_lossy().into_owned());
                }
            }
            stack.push(path);
        }
    }

    models.sort();
    models
}

fn print_missing_reports(reports: &[MissingReport]) {
    println!("{:<48} missing_tasks", "model");
    println!("{}", "-".repeat(72));
    for report in reports {
        let missing = if report.missing.is_empty() {
            "-".to_string()
        } else {
            report.missing.join(",")
        };
        println!("{:<48} {missing}", report.model);
    }
}

/// Loads the taxonomy table from a `column,path,key,max_score` CSV file.
///
/// The table is plain comma-separated text: a header row followed by rows of
/// exactly four fields, no quoting dialect. Any deviation is a configuration
/// error that aborts the run before any task is processed.
///
/// # Errors
/// Returns an error when the file cannot be read, the header or a row does
/// not have the four expected fields, `max_score` is not a number, or the
/// resulting taxonomy fails validation.
pub fn load_taxonomy_csv(path: &Path) -> Result<Taxonomy> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read taxonomy table {}", path.display()))?;
    let mut lines = body.lines();

    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| anyhow!("taxonomy table {} is empty", path.display()))?
        .split(',')
        .map(str::trim)
        .collect();
    if header != TAXONOMY_HEADER {
        return Err(anyhow!(
            "taxonomy table {} must start with header {}",
            path.display(),
            TAXONOMY_HEADER.join(",")
        ));
    }

    let mut entries = Vec::new();
    for (index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != TAXONOMY_HEADER.len() {
            return Err(anyhow!(
                "taxonomy row {} has {} fields, expected {}",
                index + 2,
                fields.len(),
                TAXONOMY_HEADER.len()
            ));
        }

        let max_score: f64 = fields[3]
            .trim()
            .parse()
            .with_context(|| format!("taxonomy row {}: invalid max_score", index + 2))?;
        entries.push(TaskEntry {
            column: fields[0].trim().to_string(),
            result_path: fields[1].trim().to_string(),
            key_spec: fields[2].trim().to_string(),
            max_score,
        });
    }

    Taxonomy::with_default_groups(entries).map_err(|err| anyhow!(err))
}
