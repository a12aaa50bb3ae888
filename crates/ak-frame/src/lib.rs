#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use ak_types::{DType, Scalar, ScalarKey, TypeError, cast_scalar_owned, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column length mismatch: expected {expected} rows, column '{name}' has {actual}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column name: '{0}'")]
    DuplicateColumn(String),
    #[error("missing column: '{0}'")]
    MissingColumn(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// A dtype-homogeneous vector of scalars. Values are coerced to the column
/// dtype on construction, so downstream code never sees mixed dtypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
}

impl Column {
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, FrameError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        Ok(Self {
            dtype,
            values: coerced,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, FrameError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    name: String,
    column: Column,
}

impl Series {
    pub fn new(name: impl Into<String>, column: Column) -> Self {
        Self {
            name: name.into(),
            column,
        }
    }

    pub fn from_values(name: impl Into<String>, values: Vec<Scalar>) -> Result<Self, FrameError> {
        Ok(Self::new(name, Column::from_values(values)?))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn column(&self) -> &Column {
        &self.column
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        self.column.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.column.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.column.is_empty()
    }
}

/// Ordered, named columns of equal length. Row identity is positional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: BTreeMap<String, Column>,
    #[serde(skip)]
    column_order: Vec<String>,
}

impl DataFrame {
    /// Construct from `(name, values)` pairs, preserving input order.
    /// All columns must have the same length; names must be distinct.
    pub fn from_columns(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let expected = data.first().map_or(0, |(_, values)| values.len());

        let mut columns = BTreeMap::new();
        let mut column_order = Vec::with_capacity(data.len());
        let mut seen = BTreeSet::new();
        for (name, values) in data {
            if !seen.insert(name.to_owned()) {
                return Err(FrameError::DuplicateColumn(name.to_owned()));
            }
            if values.len() != expected {
                return Err(FrameError::LengthMismatch {
                    name: name.to_owned(),
                    expected,
                    actual: values.len(),
                });
            }
            column_order.push(name.to_owned());
            columns.insert(name.to_owned(), Column::from_values(values)?);
        }

        Ok(Self {
            columns,
            column_order,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.column_order
            .first()
            .map_or(0, |name| self.columns[name].len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Deferred group-by over one or more key columns.
    /// Fails fast when a grouping column is absent.
    pub fn groupby(&self, by: &[&str]) -> Result<DataFrameGroupBy<'_>, FrameError> {
        for col in by {
            if !self.columns.contains_key(*col) {
                return Err(FrameError::MissingColumn((*col).to_owned()));
            }
        }
        Ok(DataFrameGroupBy {
            df: self,
            by: by.iter().map(|s| (*s).to_string()).collect(),
        })
    }
}

/// Deferred group-by handle created by [`DataFrame::groupby`].
pub struct DataFrameGroupBy<'a> {
    df: &'a DataFrame,
    by: Vec<String>,
}

/// One group: the `(column, value)` key pairs in `by` order, plus the
/// row positions belonging to the group in original row order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPartition {
    pub keys: Vec<(String, Scalar)>,
    pub rows: Vec<usize>,
}

impl DataFrameGroupBy<'_> {
    /// Materialize the groups in canonical order: sorted by group key,
    /// missing key values last. Every row lands in exactly one group.
    #[must_use]
    pub fn partitions(&self) -> Vec<GroupPartition> {
        let n = self.df.len();
        let key_columns: Vec<&Column> = self
            .by
            .iter()
            .map(|name| &self.df.columns[name])
            .collect();

        let mut order: Vec<Vec<ScalarKey>> = Vec::new();
        let mut groups: HashMap<Vec<ScalarKey>, GroupPartition> = HashMap::new();

        for row in 0..n {
            let key: Vec<ScalarKey> = key_columns
                .iter()
                .map(|col| ScalarKey::from_scalar(&col.values()[row]))
                .collect();

            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    GroupPartition {
                        keys: self
                            .by
                            .iter()
                            .zip(key_columns.iter())
                            .map(|(name, col)| (name.clone(), col.values()[row].clone()))
                            .collect(),
                        rows: Vec::new(),
                    }
                })
                .rows
                .push(row);
        }

        let mut out: Vec<GroupPartition> = order
            .into_iter()
            .map(|key| groups.remove(&key).expect("order references inserted keys"))
            .collect();
        out.sort_by(|a, b| compare_group_keys(&a.keys, &b.keys));
        out
    }
}

fn compare_group_keys(left: &[(String, Scalar)], right: &[(String, Scalar)]) -> Ordering {
    for ((_, a), (_, b)) in left.iter().zip(right.iter()) {
        let ord = compare_scalars_na_last(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Total order over scalars for canonical group ordering: missing values
/// sort last, mixed dtypes fall back to dtype rank.
pub fn compare_scalars_na_last(left: &Scalar, right: &Scalar) -> Ordering {
    match (left.is_missing(), right.is_missing()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => match (left, right) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Int64(a), Scalar::Int64(b)) => a.cmp(b),
            (Scalar::Float64(a), Scalar::Float64(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Scalar::Utf8(a), Scalar::Utf8(b)) => a.cmp(b),
            _ => left.dtype().cmp(&right.dtype()),
        },
    }
}

#[cfg(test)]
mod tests {
    use ak_types::{DType, NullKind, Scalar};

    use super::{Column, DataFrame, FrameError, Series};

    fn sample_frame() -> DataFrame {
        DataFrame::from_columns(vec![
            (
                "category",
                vec![
                    Scalar::Utf8("A".into()),
                    Scalar::Utf8("A".into()),
                    Scalar::Utf8("B".into()),
                    Scalar::Utf8("B".into()),
                    Scalar::Utf8("C".into()),
                ],
            ),
            (
                "subcategory",
                vec![
                    Scalar::Utf8("X".into()),
                    Scalar::Utf8("Y".into()),
                    Scalar::Utf8("X".into()),
                    Scalar::Utf8("Y".into()),
                    Scalar::Utf8("Z".into()),
                ],
            ),
            (
                "value",
                vec![
                    Scalar::Int64(1),
                    Scalar::Int64(2),
                    Scalar::Int64(3),
                    Scalar::Int64(4),
                    Scalar::Int64(5),
                ],
            ),
        ])
        .expect("frame builds")
    }

    #[test]
    fn column_coerces_to_common_dtype() {
        let column =
            Column::from_values(vec![Scalar::Int64(1), Scalar::Float64(2.5)]).expect("column");
        assert_eq!(column.dtype(), DType::Float64);
        assert_eq!(column.values()[0], Scalar::Float64(1.0));
    }

    #[test]
    fn column_remaps_nulls_to_dtype_marker() {
        let column = Column::from_values(vec![Scalar::Float64(1.0), Scalar::Null(NullKind::Null)])
            .expect("column");
        assert_eq!(column.values()[1], Scalar::Null(NullKind::NaN));
    }

    #[test]
    fn frame_preserves_insertion_order() {
        let frame = sample_frame();
        assert_eq!(frame.column_names(), ["category", "subcategory", "value"]);
        assert_eq!(frame.len(), 5);
        assert_eq!(frame.num_columns(), 3);
    }

    #[test]
    fn frame_rejects_ragged_columns() {
        let err = DataFrame::from_columns(vec![
            ("a", vec![Scalar::Int64(1), Scalar::Int64(2)]),
            ("b", vec![Scalar::Int64(3)]),
        ])
        .expect_err("must fail");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn frame_rejects_duplicate_column_names() {
        let err = DataFrame::from_columns(vec![
            ("a", vec![Scalar::Int64(1)]),
            ("a", vec![Scalar::Int64(2)]),
        ])
        .expect_err("must fail");
        assert_eq!(err, FrameError::DuplicateColumn("a".to_owned()));
    }

    #[test]
    fn groupby_unknown_column_fails() {
        let frame = sample_frame();
        let err = frame.groupby(&["nope"]).err().expect("must fail");
        assert_eq!(err, FrameError::MissingColumn("nope".to_owned()));
    }

    #[test]
    fn groupby_single_column_partitions_sorted_and_exhaustive() {
        let frame = sample_frame();
        let parts = frame.groupby(&["category"]).expect("groupby").partitions();

        let labels: Vec<&Scalar> = parts.iter().map(|p| &p.keys[0].1).collect();
        assert_eq!(
            labels,
            [
                &Scalar::Utf8("A".into()),
                &Scalar::Utf8("B".into()),
                &Scalar::Utf8("C".into())
            ]
        );

        let mut all_rows: Vec<usize> = parts.iter().flat_map(|p| p.rows.clone()).collect();
        all_rows.sort_unstable();
        assert_eq!(all_rows, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn groupby_multi_column_keys_follow_by_order() {
        let frame = sample_frame();
        let parts = frame
            .groupby(&["category", "subcategory"])
            .expect("groupby")
            .partitions();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].keys[0].0, "category");
        assert_eq!(parts[0].keys[1].0, "subcategory");
        assert_eq!(parts[0].keys[0].1, Scalar::Utf8("A".into()));
        assert_eq!(parts[0].keys[1].1, Scalar::Utf8("X".into()));
    }

    #[test]
    fn groupby_missing_keys_sort_last() {
        let frame = DataFrame::from_columns(vec![
            (
                "k",
                vec![
                    Scalar::Null(NullKind::Null),
                    Scalar::Utf8("a".into()),
                    Scalar::Null(NullKind::Null),
                ],
            ),
            ("v", vec![Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(3)]),
        ])
        .expect("frame");

        let parts = frame.groupby(&["k"]).expect("groupby").partitions();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].keys[0].1, Scalar::Utf8("a".into()));
        assert!(parts[1].keys[0].1.is_missing());
        assert_eq!(parts[1].rows, [0, 2]);
    }

    #[test]
    fn series_accessors() {
        let series =
            Series::from_values("values", vec![Scalar::Int64(1), Scalar::Int64(2)]).expect("ok");
        assert_eq!(series.name(), "values");
        assert_eq!(series.len(), 2);
        assert!(!series.is_empty());
    }
}
