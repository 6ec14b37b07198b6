use arrow_array::{ArrayRef, Float64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

pub const SAMPLE_COLUMN: &str = "column1";

/// One non-nullable Float64 column `column1` holding `[1, 2, 3]`.
pub fn sample_record_batch() -> RecordBatch {
    let column: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0]));
    let schema = Arc::new(Schema::new(vec![Field::new(
        SAMPLE_COLUMN,
        DataType::Float64,
        false,
    )]));
    RecordBatch::try_new(schema, vec![column]).expect("sample column matches its schema")
}
