#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ak_frame::{DataFrame, FrameError, Series};
use ak_types::{Scalar, ScalarKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SEP: &str = ";";

/// Column name used when a series has no name of its own.
pub const DEFAULT_KEY_NAME: &str = "keys";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("column '{0}' not found in table")]
    ColumnNotFound(String),
    #[error("groupby and batch_size are mutually exclusive")]
    AmbiguousPartitioning,
    #[error("groupby requires a table context; a bare series has no grouping columns")]
    GroupByWithoutTable,
    #[error("batch_size must be a positive integer, got {0}")]
    InvalidBatchSize(i64),
    #[error("sample size must be a positive integer")]
    InvalidSampleSize,
    #[error(
        "sample size {requested} exceeds the {available} available values in partition '{partition}'"
    )]
    SampleExceedsAvailable {
        requested: usize,
        available: usize,
        partition: String,
    },
    #[error(
        "output files collide at '{}': partitions '{first}' and '{second}' sanitize identically",
        path.display()
    )]
    FileNameCollision {
        path: PathBuf,
        first: String,
        second: String,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Configuration ──────────────────────────────────────────────────────

/// Where the rendered result goes. One variant per output shape, so the
/// `to`-string/`to_file`-flag dual-control ambiguity cannot arise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Return the values (flat) or labeled partitions (grouped/batched).
    Collection,
    /// Return the joined/sectioned text.
    Text { sep: String },
    /// Print the text rendering to standard output, return the same text.
    Stdout { sep: String },
    /// Write one file (flat) or one file per partition (grouped/batched).
    File { path: PathBuf, sep: String },
}

impl Default for Destination {
    fn default() -> Self {
        Self::Collection
    }
}

impl Destination {
    #[must_use]
    pub fn text() -> Self {
        Self::Text {
            sep: DEFAULT_SEP.to_owned(),
        }
    }

    #[must_use]
    pub fn text_with_sep(sep: impl Into<String>) -> Self {
        Self::Text { sep: sep.into() }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::Stdout {
            sep: DEFAULT_SEP.to_owned(),
        }
    }

    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            sep: DEFAULT_SEP.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractOptions {
    /// Grouping columns, in label order. Table input only.
    pub groupby: Vec<String>,
    /// Fixed chunk size; mutually exclusive with `groupby`. Kept signed so
    /// zero and negative inputs are representable and rejected explicitly.
    pub batch_size: Option<i64>,
    /// Stable first-occurrence dedup per partition, before sampling.
    pub unique: bool,
    /// Random subset size per partition, without replacement. Must be
    /// positive when set.
    pub sample: Option<usize>,
    pub destination: Destination,
}

// ── Data model ─────────────────────────────────────────────────────────

/// The normalized input to the pipeline: one named sequence of values.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySequence {
    name: String,
    values: Vec<Scalar>,
}

impl KeySequence {
    /// Resolve a table column into a key sequence named after the column.
    pub fn from_frame_column(frame: &DataFrame, column: &str) -> Result<Self, ExtractError> {
        let col = frame
            .column(column)
            .ok_or_else(|| ExtractError::ColumnNotFound(column.to_owned()))?;
        Ok(Self {
            name: column.to_owned(),
            values: col.values().to_vec(),
        })
    }

    /// Use a series as-is; an unnamed series gets [`DEFAULT_KEY_NAME`].
    #[must_use]
    pub fn from_series(series: &Series) -> Self {
        let name = if series.name().is_empty() {
            DEFAULT_KEY_NAME.to_owned()
        } else {
            series.name().to_owned()
        };
        Self {
            name,
            values: series.values().to_vec(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartitionLabel {
    /// 1-based chunk index.
    Batch(u64),
    /// `(grouping column, group value)` pairs in groupby order.
    Group(Vec<(String, Scalar)>),
}

/// Header rendering: `batch: 3` or `group: category=A, subcategory=X`.
impl fmt::Display for PartitionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch(n) => write!(f, "batch: {n}"),
            Self::Group(pairs) => {
                write!(f, "group: ")?;
                for (idx, (column, value)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                Ok(())
            }
        }
    }
}

/// A labeled subsequence of keys. `label` is `None` only in flat mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub label: Option<PartitionLabel>,
    pub values: Vec<Scalar>,
}

/// The pipeline result, shaped by [`Destination`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Extracted {
    Values(Vec<Scalar>),
    Partitions(Vec<Partition>),
    Text(String),
    Files(Vec<PathBuf>),
}

// ── Entry points ───────────────────────────────────────────────────────

/// Extract the `column` of `frame` and run it through the pipeline.
pub fn frame_keys(
    frame: &DataFrame,
    column: &str,
    options: &ExtractOptions,
) -> Result<Extracted, ExtractError> {
    validate(options)?;
    let keys = KeySequence::from_frame_column(frame, column)?;
    let partitions = partition(keys, Some(frame), options)?;
    let partitions = apply_filters(partitions, options)?;
    render(partitions, options)
}

/// Run a bare series through the pipeline. Grouping is rejected here:
/// a series carries no table context to resolve grouping columns against.
pub fn series_keys(series: &Series, options: &ExtractOptions) -> Result<Extracted, ExtractError> {
    validate(options)?;
    if !options.groupby.is_empty() {
        return Err(ExtractError::GroupByWithoutTable);
    }
    let keys = KeySequence::from_series(series);
    let partitions = partition(keys, None, options)?;
    let partitions = apply_filters(partitions, options)?;
    render(partitions, options)
}

/// Configuration checks that must reject the call before any partitioning
/// or rendering work happens.
fn validate(options: &ExtractOptions) -> Result<(), ExtractError> {
    if !options.groupby.is_empty() && options.batch_size.is_some() {
        return Err(ExtractError::AmbiguousPartitioning);
    }
    if let Some(size) = options.batch_size {
        if size <= 0 {
            return Err(ExtractError::InvalidBatchSize(size));
        }
    }
    if options.sample == Some(0) {
        return Err(ExtractError::InvalidSampleSize);
    }
    Ok(())
}

// ── Partitioner ────────────────────────────────────────────────────────

fn partition(
    keys: KeySequence,
    table: Option<&DataFrame>,
    options: &ExtractOptions,
) -> Result<Vec<Partition>, ExtractError> {
    if !options.groupby.is_empty() {
        let table = table.ok_or(ExtractError::GroupByWithoutTable)?;
        return group_partitions(&keys, table, &options.groupby);
    }

    if let Some(size) = options.batch_size {
        // validate() already rejected non-positive sizes.
        let size = usize::try_from(size).map_err(|_| ExtractError::InvalidBatchSize(size))?;
        return Ok(batch_partitions(keys.values, size));
    }

    Ok(vec![Partition {
        label: None,
        values: keys.values,
    }])
}

/// One partition per distinct grouping-key combination, in the engine's
/// canonical (sorted-by-key) group order. Row alignment between the key
/// sequence and the grouping columns comes from the shared parent table.
fn group_partitions(
    keys: &KeySequence,
    table: &DataFrame,
    groupby: &[String],
) -> Result<Vec<Partition>, ExtractError> {
    let by: Vec<&str> = groupby.iter().map(String::as_str).collect();
    let groups = table.groupby(&by)?.partitions();

    Ok(groups
        .into_iter()
        .map(|group| Partition {
            values: group
                .rows
                .iter()
                .map(|&row| keys.values[row].clone())
                .collect(),
            label: Some(PartitionLabel::Group(group.keys)),
        })
        .collect())
}

/// Consecutive non-overlapping chunks, 1-based labels. Empty input
/// produces zero partitions.
fn batch_partitions(values: Vec<Scalar>, size: usize) -> Vec<Partition> {
    values
        .chunks(size)
        .enumerate()
        .map(|(idx, chunk)| Partition {
            label: Some(PartitionLabel::Batch(idx as u64 + 1)),
            values: chunk.to_vec(),
        })
        .collect()
}

// ── Filter Stage ───────────────────────────────────────────────────────

fn apply_filters(
    mut partitions: Vec<Partition>,
    options: &ExtractOptions,
) -> Result<Vec<Partition>, ExtractError> {
    for part in &mut partitions {
        if options.unique {
            dedup_stable(&mut part.values);
        }
        if let Some(requested) = options.sample {
            if requested > part.values.len() {
                return Err(ExtractError::SampleExceedsAvailable {
                    requested,
                    available: part.values.len(),
                    partition: partition_name(part),
                });
            }
            part.values = sample_values(&part.values, requested);
        }
    }
    Ok(partitions)
}

/// First-occurrence dedup; keyed by scalar identity with NaNs collapsed.
fn dedup_stable(values: &mut Vec<Scalar>) {
    let mut seen = HashSet::with_capacity(values.len());
    values.retain(|value| seen.insert(ScalarKey::from_scalar(value)));
}

/// Random subset without replacement from the process-wide rng source.
/// Output order follows the sampler's draw order, not the input order.
fn sample_values(values: &[Scalar], amount: usize) -> Vec<Scalar> {
    let mut rng = rand::rng();
    rand::seq::index::sample(&mut rng, values.len(), amount)
        .into_iter()
        .map(|idx| values[idx].clone())
        .collect()
}

fn partition_name(part: &Partition) -> String {
    part.label
        .as_ref()
        .map_or_else(|| "all values".to_owned(), ToString::to_string)
}

// ── Formatter / Sink ───────────────────────────────────────────────────

fn render(partitions: Vec<Partition>, options: &ExtractOptions) -> Result<Extracted, ExtractError> {
    let flat = options.groupby.is_empty() && options.batch_size.is_none();

    match &options.destination {
        Destination::Collection => {
            if flat {
                let values = partitions
                    .into_iter()
                    .next()
                    .map(|part| part.values)
                    .unwrap_or_default();
                Ok(Extracted::Values(values))
            } else {
                Ok(Extracted::Partitions(partitions))
            }
        }
        Destination::Text { sep } => Ok(Extracted::Text(render_text(&partitions, sep))),
        Destination::Stdout { sep } => {
            let text = render_text(&partitions, sep);
            println!("{text}");
            Ok(Extracted::Text(text))
        }
        Destination::File { path, sep } => write_files(&partitions, path, sep),
    }
}

/// Flat mode: the joined values. Partitioned mode: one section per
/// partition, `[<label>] (<count>)` header then the joined values line,
/// sections separated by a single blank line, no trailing blank.
fn render_text(partitions: &[Partition], sep: &str) -> String {
    match partitions {
        [single] if single.label.is_none() => join_values(&single.values, sep),
        _ => partitions
            .iter()
            .map(|part| {
                format!(
                    "[{}] ({})\n{}",
                    partition_name(part),
                    part.values.len(),
                    join_values(&part.values, sep)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn join_values(values: &[Scalar], sep: &str) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Flat mode writes the joined body to `base`. Partitioned mode derives
/// `<stem>.<label-stub><ext>` per partition and checks the whole plan for
/// name collisions before writing anything. File bodies carry no header
/// line, only the joined values and a trailing newline.
fn write_files(
    partitions: &[Partition],
    base: &Path,
    sep: &str,
) -> Result<Extracted, ExtractError> {
    if let [single] = partitions {
        if single.label.is_none() {
            fs::write(base, file_body(&single.values, sep))?;
            return Ok(Extracted::Files(vec![base.to_path_buf()]));
        }
    }

    let mut claimed: HashMap<PathBuf, String> = HashMap::with_capacity(partitions.len());
    let mut plan = Vec::with_capacity(partitions.len());
    for part in partitions {
        let path = partition_path(base, &label_file_stub(part));
        let name = partition_name(part);
        if let Some(first) = claimed.insert(path.clone(), name.clone()) {
            return Err(ExtractError::FileNameCollision {
                path,
                first,
                second: name,
            });
        }
        plan.push((path, part));
    }

    let mut written = Vec::with_capacity(plan.len());
    for (path, part) in plan {
        fs::write(&path, file_body(&part.values, sep))?;
        written.push(path);
    }
    Ok(Extracted::Files(written))
}

fn file_body(values: &[Scalar], sep: &str) -> String {
    let mut body = join_values(values, sep);
    body.push('\n');
    body
}

/// File-name fragment for a partition: `batch-N`, or the group's
/// `col-value` pairs joined with `_`. Anything outside `[A-Za-z0-9._-]`
/// becomes `_`.
fn label_file_stub(part: &Partition) -> String {
    let label = part
        .label
        .as_ref()
        .expect("non-flat partitions always carry a label");
    let raw = match label {
        PartitionLabel::Batch(n) => format!("batch-{n}"),
        PartitionLabel::Group(pairs) => pairs
            .iter()
            .map(|(column, value)| format!("{column}-{value}"))
            .collect::<Vec<_>>()
            .join("_"),
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn partition_path(base: &Path, stub: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_KEY_NAME);
    let file_name = match base.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem}.{stub}.{ext}"),
        None => format!("{stem}.{stub}"),
    };
    base.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use ak_types::Scalar;

    use super::{
        DEFAULT_SEP, Destination, ExtractError, ExtractOptions, Partition, PartitionLabel,
        batch_partitions, dedup_stable, label_file_stub, partition_path, render_text, validate,
    };

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().copied().map(Scalar::Int64).collect()
    }

    #[test]
    fn default_destination_is_collection_with_default_sep() {
        let options = ExtractOptions::default();
        assert_eq!(options.destination, Destination::Collection);
        assert!(!options.unique);
        assert_eq!(DEFAULT_SEP, ";");
    }

    #[test]
    fn groupby_and_batch_size_are_mutually_exclusive() {
        let options = ExtractOptions {
            groupby: vec!["category".to_owned()],
            batch_size: Some(2),
            ..ExtractOptions::default()
        };
        let err = validate(&options).expect_err("must fail");
        assert!(matches!(err, ExtractError::AmbiguousPartitioning));
    }

    #[test]
    fn zero_and_negative_batch_sizes_are_rejected() {
        for size in [0, -1] {
            let options = ExtractOptions {
                batch_size: Some(size),
                ..ExtractOptions::default()
            };
            let err = validate(&options).expect_err("must fail");
            assert!(matches!(err, ExtractError::InvalidBatchSize(got) if got == size));
        }
    }

    #[test]
    fn zero_sample_is_rejected() {
        let options = ExtractOptions {
            sample: Some(0),
            ..ExtractOptions::default()
        };
        let err = validate(&options).expect_err("must fail");
        assert!(matches!(err, ExtractError::InvalidSampleSize));
    }

    #[test]
    fn batching_is_exhaustive_and_one_based() {
        let parts = batch_partitions(ints(&[1, 2, 3, 4, 5]), 2);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].label, Some(PartitionLabel::Batch(1)));
        assert_eq!(parts[2].label, Some(PartitionLabel::Batch(3)));
        assert_eq!(parts[2].values, ints(&[5]));
    }

    #[test]
    fn batching_empty_input_yields_zero_partitions() {
        assert!(batch_partitions(Vec::new(), 3).is_empty());
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let mut values = ints(&[1, 1, 2, 3, 3]);
        dedup_stable(&mut values);
        assert_eq!(values, ints(&[1, 2, 3]));
    }

    #[test]
    fn dedup_collapses_nan_duplicates() {
        let mut values = vec![
            Scalar::Float64(f64::NAN),
            Scalar::Float64(1.0),
            Scalar::Float64(f64::NAN),
        ];
        dedup_stable(&mut values);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn group_label_header_rendering() {
        let label = PartitionLabel::Group(vec![
            ("category".to_owned(), Scalar::Utf8("A".into())),
            ("subcategory".to_owned(), Scalar::Utf8("X".into())),
        ]);
        assert_eq!(label.to_string(), "group: category=A, subcategory=X");
        assert_eq!(PartitionLabel::Batch(7).to_string(), "batch: 7");
    }

    #[test]
    fn text_sections_have_no_trailing_blank() {
        let parts = vec![
            Partition {
                label: Some(PartitionLabel::Batch(1)),
                values: ints(&[1, 2]),
            },
            Partition {
                label: Some(PartitionLabel::Batch(2)),
                values: ints(&[3]),
            },
        ];
        assert_eq!(render_text(&parts, ";"), "[batch: 1] (2)\n1;2\n\n[batch: 2] (1)\n3");
    }

    #[test]
    fn file_stub_sanitizes_hostile_label_values() {
        let part = Partition {
            label: Some(PartitionLabel::Group(vec![(
                "path".to_owned(),
                Scalar::Utf8("a/b c".into()),
            )])),
            values: Vec::new(),
        };
        assert_eq!(label_file_stub(&part), "path-a_b_c");
    }

    #[test]
    fn partition_path_keeps_extension_after_stub() {
        let path = partition_path("out/keys.txt".as_ref(), "batch-2");
        assert_eq!(path, std::path::PathBuf::from("out/keys.batch-2.txt"));

        let bare = partition_path("out/keys".as_ref(), "batch-2");
        assert_eq!(bare, std::path::PathBuf::from("out/keys.batch-2"));
    }
}
