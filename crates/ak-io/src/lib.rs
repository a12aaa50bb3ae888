#![forbid(unsafe_code)]

use ak_frame::{DataFrame, FrameError};
use ak_types::{NullKind, Scalar};
use csv::ReaderBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Parse a CSV string into a [`DataFrame`]. The first record is the
/// header row; column order follows the header. Field dtypes are inferred
/// per cell (int, then float, then bool, then string; empty is null) and
/// unified per column by the frame's dtype coercion.
pub fn read_csv_str(input: &str) -> Result<DataFrame, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned().map_err(IoError::from)?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let row_hint = input.len() / (header_count * 8).max(1);
    let mut columns: Vec<Vec<Scalar>> = (0..header_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    for row in reader.records() {
        let record = row?;
        for (idx, col) in columns.iter_mut().enumerate() {
            let field = record.get(idx).unwrap_or_default();
            col.push(parse_scalar(field));
        }
    }

    let data = headers.iter().zip(columns).collect();
    Ok(DataFrame::from_columns(data)?)
}

fn parse_scalar(field: &str) -> Scalar {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Scalar::Null(NullKind::Null);
    }

    if let Ok(value) = trimmed.parse::<i64>() {
        return Scalar::Int64(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return Scalar::Float64(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Scalar::Bool(value);
    }

    Scalar::Utf8(trimmed.to_owned())
}
