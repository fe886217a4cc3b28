// Streaming-cursor reads grouped into fixed-size chunks.
use rusqlite::{Params, Rows, Statement};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Chunk, record_from_row};

/// Lazy sequence of chunks pulled from an executing statement.
///
/// Rows are fetched one at a time from SQLite's cursor; at most one chunk is
/// buffered. The final chunk may be shorter than `chunk_size`, and an empty
/// result produces no chunks at all. The iterator is fused after the cursor
/// is exhausted or after the first error.
pub struct Chunks<'stmt> {
    rows: Rows<'stmt>,
    columns: Vec<String>,
    chunk_size: usize,
    rows_read: u64,
    done: bool,
}

/// Executes `stmt` and returns its rows as chunks of `chunk_size`.
pub fn stream_query<'stmt, P: Params>(
    stmt: &'stmt mut Statement<'_>,
    params: P,
    chunk_size: usize,
) -> Result<Chunks<'stmt>, Error> {
    if chunk_size == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("chunk size must be greater than 0"));
    }
    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = stmt
        .query(params)
        .map_err(|err| Error::store("failed to execute query", err))?;
    Ok(Chunks {
        rows,
        columns,
        chunk_size,
        rows_read: 0,
        done: false,
    })
}

impl Chunks<'_> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn fill(&mut self) -> Result<Chunk, Error> {
        let mut chunk = Vec::with_capacity(self.chunk_size.min(1024));
        while chunk.len() < self.chunk_size {
            let row = match self.rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(err) => return Err(Error::store("failed to read row", err)),
            };
            chunk.push(record_from_row(row, &self.columns)?);
        }
        Ok(chunk)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Result<Chunk, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => {
                self.rows_read += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
