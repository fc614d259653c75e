//! Result-resolution core for benchmark evaluation aggregation.
//!
//! Each evaluation harness writes timestamped `results_*.json` files under a
//! model's result tree. This crate locates every candidate file for a task,
//! extracts metrics from nested JSON, resolves the best available value
//! (newest run first), and folds the whole task taxonomy into one
//! [`AggregateRecord`] per model.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed prefix of every harness result file.
pub const RESULT_FILE_PREFIX: &str = "results_";
/// Fixed suffix of every harness result file.
pub const RESULT_FILE_SUFFIX: &str = ".json";
/// Placeholder token in key specs, replaced with the model identifier.
pub const MODEL_PLACEHOLDER: &str = "MODEL_NAME";
/// File name of the persisted aggregate record, under the model's root.
pub const RECORD_FILE_NAME: &str = "aggregated_result.json";
/// Serialized form of [`Score::Unresolved`].
pub const UNRESOLVED_SENTINEL: f64 = -1.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AggregateError {
    #[error("taxonomy error: {0}")]
    Taxonomy(String),
    #[error("no result files for model {model} under {directory}")]
    NoCandidates { model: String, directory: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("malformed result file: {0}")]
    Malformed(String),
    #[error("record error: {0}")]
    Record(String),
}

/// A metric value that may legitimately be absent.
///
/// "Unresolved" is ordinary data, not an error: it propagates through
/// averaging and normalization and only becomes the `-1.0` sentinel at the
/// serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Resolved(f64),
    Unresolved,
}

impl Score {
    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    #[must_use]
    pub fn to_sentinel(self) -> f64 {
        match self {
            Self::Resolved(value) => value,
            Self::Unresolved => UNRESOLVED_SENTINEL,
        }
    }

    /// Divides a resolved score by `max_score`; an unresolved score stays the
    /// sentinel (never `-1.0 / max_score`).
    #[must_use]
    pub fn normalized(self, max_score: f64) -> f64 {
        match self {
            Self::Resolved(value) => value / max_score,
            Self::Unresolved => UNRESOLVED_SENTINEL,
        }
    }
}

/// One row of the task taxonomy table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    /// Unique task identifier.
    pub column: String,
    /// Result subdirectory under the model's result root.
    pub result_path: String,
    /// `.`-separated key tokens, possibly containing [`MODEL_PLACEHOLDER`].
    pub key_spec: String,
    /// Positive per-task maximum used for normalization.
    pub max_score: f64,
}

/// Composite columns whose score is the per-file average of their
/// constituents' metrics.
#[must_use]
pub fn default_composite_groups() -> BTreeMap<String, Vec<String>> {
    let mut groups = BTreeMap::new();
    groups.insert("MC".to_string(), vec!["jcommonsenseqa".to_string()]);
    groups.insert(
        "NLI".to_string(),
        vec![
            "jamp (NLI)".to_string(),
            "janli (NLI)".to_string(),
            "jnli".to_string(),
            "jsem".to_string(),
            "jsick (NLI)".to_string(),
        ],
    );
    groups.insert(
        "QA".to_string(),
        vec!["jemhopqa".to_string(), "niilc".to_string()],
    );
    groups.insert("RC".to_string(), vec!["jsquad".to_string()]);
    groups
}

/// Ordered task taxonomy plus the static composite-group map.
///
/// Loaded once per run and passed explicitly into the [`Aggregator`];
/// immutable during aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    entries: Vec<TaskEntry>,
    composite: BTreeMap<String, Vec<String>>,
}

impl Taxonomy {
    /// Builds a validated taxonomy from table rows and composite groups.
    ///
    /// # Errors
    /// Returns [`AggregateError::Taxonomy`] when the table is empty, a column
    /// is duplicated, a `max_score` is not a positive finite number, a key
    /// spec is empty, or a composite group present in the table references a
    /// constituent column the table does not contain. Configuration errors
    /// are fatal before any task is processed.
    pub fn new(
        entries: Vec<TaskEntry>,
        composite: BTreeMap<String, Vec<String>>,
    ) -> Result<Self, AggregateError> {
        let taxonomy = Self { entries, composite };
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    /// Builds a validated taxonomy with [`default_composite_groups`].
    ///
    /// # Errors
    /// Same conditions as [`Taxonomy::new`].
    pub fn with_default_groups(entries: Vec<TaskEntry>) -> Result<Self, AggregateError> {
        Self::new(entries, default_composite_groups())
    }

    fn validate(&self) -> Result<(), AggregateError> {
        if self.entries.is_empty() {
            return Err(AggregateError::Taxonomy(
                "taxonomy table MUST contain at least one task".to_string(),
            ));
        }

        let mut seen = BTreeMap::new();
        for entry in &self.entries {
            if seen.insert(entry.column.as_str(), ()).is_some() {
                return Err(AggregateError::Taxonomy(format!(
                    "duplicate task column: {}",
                    entry.column
                )));
            }

            if !(entry.max_score.is_finite() && entry.max_score > 0.0) {
                return Err(AggregateError::Taxonomy(format!(
                    "max_score for {} MUST be a positive number",
                    entry.column
                )));
            }

            if entry.key_spec.trim().is_empty() {
                return Err(AggregateError::Taxonomy(format!(
                    "key spec for {} MUST NOT be empty",
                    entry.column
                )));
            }
        }

        // Only groups whose composite column appears in the table are live.
        for (composite, members) in &self.composite {
            if !seen.contains_key(composite.as_str()) {
                continue;
            }

            if members.is_empty() {
                return Err(AggregateError::Taxonomy(format!(
                    "composite group {composite} MUST have at least one constituent"
                )));
            }

            for member in members {
                if !seen.contains_key(member.as_str()) {
                    return Err(AggregateError::Taxonomy(format!(
                        "composite group {composite} references unknown column {member}"
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    /// Constituent columns when `column` is a live composite group.
    #[must_use]
    pub fn composite_members(&self, column: &str) -> Option<&[String]> {
        if !self.entries.iter().any(|entry| entry.column == column) {
            return None;
        }
        self.composite.get(column).map(Vec::as_slice)
    }

    /// Key tokens for `column` with the model identifier substituted into
    /// any placeholder token (slashes replaced by underscores).
    #[must_use]
    pub fn keys_for(&self, column: &str, model: &str) -> Option<Vec<String>> {
        let entry = self.entries.iter().find(|entry| entry.column == column)?;
        let flattened = model.replace('/', "_");
        Some(
            entry
                .key_spec
                .split('.')
                .map(|token| token.replace(MODEL_PLACEHOLDER, &flattened))
                .collect(),
        )
    }
}

/// One persisted evaluation-run output that may contain a task's metric.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResultCandidate {
    pub path: PathBuf,
    pub modified_at: SystemTime,
}

/// Directory-name substrings that may identify a run directory for `model`.
///
/// Different run tooling brackets the flattened model name inconsistently, so
/// the set covers both-bracketed, left-bracketed, right-bracketed, and bare
/// forms. Generated once per lookup.
#[must_use]
pub fn model_dir_patterns(model: &str) -> [String; 4] {
    let flattened = model.replace('/', "__");
    [
        format!("__{flattened}__"),
        format!("__{flattened}"),
        format!("{flattened}__"),
        flattened,
    ]
}

/// Finds every `results_*.json` file that plausibly belongs to `model`,
/// newest first.
///
/// Scans the parent of `directory` for subdirectories whose name contains a
/// [`model_dir_patterns`] variant and collects matching files inside each.
/// Ties on modification time break by ascending path so ordering is stable.
///
/// # Errors
/// Returns [`AggregateError::NoCandidates`] when zero candidate files exist
/// across all matching subdirectories (including when the parent directory
/// itself is missing or unreadable).
pub fn locate_result_files(
    directory: &Path,
    model: &str,
) -> Result<Vec<ResultCandidate>, AggregateError> {
    let patterns = model_dir_patterns(model);
    let mut candidates = Vec::new();

    if let Some(parent) = directory.parent() {
        if let Ok(entries) = fs::read_dir(parent) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !patterns.iter().any(|pattern| name.contains(pattern)) {
                    continue;
                }
                collect_result_files(&entry.path(), &mut candidates);
            }
        }
    }

    if candidates.is_empty() {
        return Err(AggregateError::NoCandidates {
            model: model.to_string(),
            directory: directory.display().to_string(),
        });
    }

    sort_candidates(&mut candidates);
    Ok(candidates)
}

fn collect_result_files(run_dir: &Path, candidates: &mut Vec<ResultCandidate>) {
    let Ok(entries) = fs::read_dir(run_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with(RESULT_FILE_PREFIX) && name.ends_with(RESULT_FILE_SUFFIX)) {
            continue;
        }

        let path = entry.path();
        match entry.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified_at) => candidates.push(ResultCandidate { path, modified_at }),
            Err(err) => {
                tracing::debug!(file = %path.display(), %err, "skipping candidate without mtime");
            }
        }
    }
}

fn sort_candidates(candidates: &mut [ResultCandidate]) {
    candidates.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// Extracts a single numeric metric from a JSON result file by walking the
/// ordered key sequence.
///
/// An absent key is not an error: it is logged and reported as
/// [`Score::Unresolved`].
///
/// # Errors
/// Returns [`AggregateError::Io`] when the file cannot be read,
/// [`AggregateError::Malformed`] when it is not valid JSON or the value at
/// the end of the key path is not a finite number. Both indicate a corrupted
/// run, distinguishable from an absent metric.
pub fn extract_metric(path: &Path, keys: &[String]) -> Result<Score, AggregateError> {
    let body = fs::read_to_string(path)
        .map_err(|err| AggregateError::Io(format!("failed to read {}: {err}", path.display())))?;
    let root: Value = serde_json::from_str(&body)
        .map_err(|err| AggregateError::Malformed(format!("{}: {err}", path.display())))?;

    let mut cursor = &root;
    for key in keys {
        match cursor.get(key) {
            Some(next) => cursor = next,
            None => {
                tracing::warn!(
                    file = %path.display(),
                    key_path = %keys.join("."),
                    "key not found in result file"
                );
                return Ok(Score::Unresolved);
            }
        }
    }

    match cursor.as_f64() {
        Some(value) if value.is_finite() => Ok(Score::Resolved(value)),
        _ => Err(AggregateError::Malformed(format!(
            "{}: value at {} is not a number",
            path.display(),
            keys.join(".")
        ))),
    }
}

/// Returns the first resolved metric over `candidates`, newest first.
///
/// Per-candidate errors (unreadable or corrupt files) are logged and that
/// candidate is skipped; a single bad file never aborts resolution.
#[must_use]
pub fn resolve_best(candidates: &[ResultCandidate], keys: &[String]) -> Score {
    for candidate in candidates {
        match extract_metric(&candidate.path, keys) {
            Ok(Score::Resolved(value)) => return Score::Resolved(value),
            Ok(Score::Unresolved) => {}
            Err(err) => {
                tracing::warn!(file = %candidate.path.display(), %err, "skipping candidate");
            }
        }
    }
    Score::Unresolved
}

/// Returns the first fully-resolved per-file average over `candidates`,
/// newest first.
///
/// The mean is computed across all key sequences within one file; if any
/// constituent is unresolved (or the file errors), that file's attempt is
/// unresolved and resolution moves to the next candidate. A composite score
/// therefore always reflects one coherent evaluation run.
#[must_use]
pub fn resolve_best_average(candidates: &[ResultCandidate], key_sets: &[Vec<String>]) -> Score {
    if key_sets.is_empty() {
        return Score::Unresolved;
    }

    'candidates: for candidate in candidates {
        let mut total = 0.0;
        for keys in key_sets {
            match extract_metric(&candidate.path, keys) {
                Ok(Score::Resolved(value)) => total += value,
                Ok(Score::Unresolved) => continue 'candidates,
                Err(err) => {
                    tracing::warn!(file = %candidate.path.display(), %err, "skipping candidate");
                    continue 'candidates;
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        return Score::Resolved(total / key_sets.len() as f64);
    }

    Score::Unresolved
}

/// The persisted per-model summary.
///
/// `result` keeps taxonomy insertion order (serde_json `preserve_order`);
/// `overall` mirrors that order as a plain sequence. The record embeds
/// nothing volatile, so unchanged inputs reproduce it byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRecord {
    pub model: String,
    pub result: serde_json::Map<String, Value>,
    pub overall: Vec<f64>,
    pub tasks: Vec<String>,
}

impl AggregateRecord {
    #[must_use]
    pub fn score(&self, column: &str) -> Option<f64> {
        self.result.get(column).and_then(Value::as_f64)
    }

    /// Task columns whose normalized score is the unresolved sentinel, in
    /// taxonomy order.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn unresolved_columns(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|column| self.score(column) == Some(UNRESOLVED_SENTINEL))
            .cloned()
            .collect()
    }
}

/// Drives resolution across the whole taxonomy for one model.
///
/// Owns the accumulating result mapping for the duration of one
/// [`Aggregator::aggregate`] call; single-threaded, blocking reads.
#[derive(Debug, Clone)]
pub struct Aggregator {
    result_root: PathBuf,
    taxonomy: Taxonomy,
}

impl Aggregator {
    #[must_use]
    pub fn new(result_root: impl Into<PathBuf>, taxonomy: Taxonomy) -> Self {
        Self {
            result_root: result_root.into(),
            taxonomy,
        }
    }

    /// Location of the persisted record for `model`.
    #[must_use]
    pub fn record_path(&self, model: &str) -> PathBuf {
        self.result_root.join(model).join(RECORD_FILE_NAME)
    }

    /// Resolves and normalizes every taxonomy task for `model`, then persists
    /// the record, fully overwriting any prior output for the same model.
    ///
    /// Per-task failures (no candidate files, all candidates unresolved or
    /// corrupt) never abort the run: the task's score is the sentinel and
    /// processing continues. Every taxonomy column yields exactly one
    /// `result` entry.
    ///
    /// # Errors
    /// Returns [`AggregateError::Record`] when the final record cannot be
    /// serialized or written.
    pub fn aggregate(&self, model: &str) -> Result<AggregateRecord, AggregateError> {
        let mut result = serde_json::Map::new();
        let mut overall = Vec::new();
        let mut tasks = Vec::new();

        for entry in self.taxonomy.entries() {
            let score = self.resolve_task(entry, model);
            let normalized = score.normalized(entry.max_score);
            tracing::debug!(column = %entry.column, normalized, "task resolved");
            result.insert(entry.column.clone(), Value::from(normalized));
            overall.push(normalized);
            tasks.push(entry.column.clone());
        }

        let record = AggregateRecord {
            model: model.to_string(),
            result,
            overall,
            tasks,
        };
        self.persist(&record)?;
        Ok(record)
    }

    fn resolve_task(&self, entry: &TaskEntry, model: &str) -> Score {
        let directory = self.result_root.join(model).join(&entry.result_path);
        let candidates = match locate_result_files(&directory, model) {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(column = %entry.column, %err, "task left unresolved");
                return Score::Unresolved;
            }
        };

        if let Some(members) = self.taxonomy.composite_members(&entry.column) {
            let key_sets: Vec<Vec<String>> = members
                .iter()
                .filter_map(|member| self.taxonomy.keys_for(member, model))
                .collect();
            resolve_best_average(&candidates, &key_sets)
        } else {
            match self.taxonomy.keys_for(&entry.column, model) {
                Some(keys) => resolve_best(&candidates, &keys),
                None => Score::Unresolved,
            }
        }
    }

    fn persist(&self, record: &AggregateRecord) -> Result<(), AggregateError> {
        let path = self.record_path(&record.model);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AggregateError::Record(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        let body = serde_json::to_string_pretty(record)
            .map_err(|err| AggregateError::Record(format!("failed to serialize record: {err}")))?;
        fs::write(&path, body).map_err(|err| {
            AggregateError::Record(format!("failed to write {}: {err}", path.display()))
        })
    }
}
