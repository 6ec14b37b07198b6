//! Plain-text rendering of record batches for console output.

use arrow_array::{Array, Float64Array, Int32Array, RecordBatch, StringArray};
use std::fmt::Write;

const UNSUPPORTED: &str = "?";
const NULL: &str = "NULL";
const RULE: &str = "----------------------------------";

/// Format a single value from an Arrow array.
///
/// Int32 is rendered as a decimal, Float64 as fixed-point with six decimals,
/// Utf8 verbatim, and a null in one of those as `NULL`. Any other type renders
/// as `?`, null or not.
pub fn format_value(array: &dyn Array, idx: usize) -> String {
    let any = array.as_any();
    let text = if let Some(arr) = any.downcast_ref::<Int32Array>() {
        arr.is_valid(idx).then(|| arr.value(idx).to_string())
    } else if let Some(arr) = any.downcast_ref::<Float64Array>() {
        arr.is_valid(idx).then(|| format!("{:.6}", arr.value(idx)))
    } else if let Some(arr) = any.downcast_ref::<StringArray>() {
        arr.is_valid(idx).then(|| arr.value(idx).to_string())
    } else {
        return UNSUPPORTED.to_string();
    };
    text.unwrap_or_else(|| NULL.to_string())
}

/// Header of column names, then one line per row, all tab separated.
pub fn format_record_batch(batch: &RecordBatch) -> String {
    let mut out = String::new();
    let header: Vec<&str> = batch
        .schema_ref()
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();
    out.push_str(&header.join("\t"));
    out.push('\n');

    for row in 0..batch.num_rows() {
        let cells: Vec<String> = batch
            .columns()
            .iter()
            .map(|col| format_value(col.as_ref(), row))
            .collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// Framed block with row/column counts and the schema above the table.
pub fn describe_record_batch(batch: &RecordBatch) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "NumRows: {}", batch.num_rows());
    let _ = writeln!(out, "NumCols: {}", batch.num_columns());
    let _ = writeln!(out, "Schema: {}", batch.schema_ref());
    out.push('\n');
    out.push_str(&format_record_batch(batch));
    let _ = writeln!(out, "{RULE}");
    out
}
