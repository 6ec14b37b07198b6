//! Arrow IPC streaming encode/decode.
//!
//! A stream is a schema message, zero or more record batch messages and an
//! end-of-stream marker.

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{ArrowError, SchemaRef};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC write error: {0}")]
    Write(#[source] ArrowError),

    #[error("IPC read error: {0}")]
    Read(#[source] ArrowError),

    #[error("batch schema does not match stream schema")]
    SchemaMismatch,
}

pub type IpcStreamReader = StreamReader<Cursor<Vec<u8>>>;

pub fn serialize_record_batch(batch: &RecordBatch) -> Result<Vec<u8>, IpcError> {
    serialize_record_batches(&batch.schema(), std::slice::from_ref(batch))
}

/// Encode `batches` as one stream. An empty slice yields schema + EOS only.
pub fn serialize_record_batches(
    schema: &SchemaRef,
    batches: &[RecordBatch],
) -> Result<Vec<u8>, IpcError> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, schema).map_err(IpcError::Write)?;
        for batch in batches {
            if batch.schema() != *schema {
                return Err(IpcError::SchemaMismatch);
            }
            writer.write(batch).map_err(IpcError::Write)?;
        }
        writer.finish().map_err(IpcError::Write)?;
    }
    Ok(buf)
}

/// Open a lazy reader over an encoded stream. Only the schema is read here.
pub fn open_stream_reader(bytes: Vec<u8>) -> Result<IpcStreamReader, IpcError> {
    StreamReader::try_new(Cursor::new(bytes), None).map_err(IpcError::Read)
}

pub fn deserialize_record_batches(
    bytes: Vec<u8>,
) -> Result<(SchemaRef, Vec<RecordBatch>), IpcError> {
    let reader = open_stream_reader(bytes)?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(IpcError::Read)?;
    Ok((schema, batches))
}
