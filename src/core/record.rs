// Dynamic row records decoded from SQLite cells.
use base64::Engine;
use rusqlite::Row;
use rusqlite::types::ValueRef;
use serde_json::{Map, Number, Value};

use crate::core::error::{Error, ErrorKind};

/// One row, keyed by column name in result order.
pub type Record = Map<String, Value>;

/// A bounded, ordered batch of records.
pub type Chunk = Vec<Record>;

pub(crate) fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

pub(crate) fn record_from_row(row: &Row<'_>, columns: &[String]) -> Result<Record, Error> {
    let mut record = Map::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let value = row
            .get_ref(idx)
            .map_err(|err| Error::store("failed to read column", err))?;
        record.insert(name.clone(), value_to_json(value));
    }
    Ok(record)
}

/// Encodes a chunk as one compact JSON line terminated by `\n`.
pub fn chunk_line(chunk: &[Record]) -> Result<String, Error> {
    let mut line = serde_json::to_string(chunk).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode chunk")
            .with_source(err)
    })?;
    line.push('\n');
    Ok(line)
}
