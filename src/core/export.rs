//! Export streams over one table: full dump, single page, and row count.
//!
//! Every chunk is persisted through a [`ChunkWriter`] before its line is
//! handed to the caller, so a line the client has seen always has a file
//! behind it. Lines are compact JSON terminated by `\n`.

use rusqlite::{Connection, Statement};
use serde_json::json;
use tracing::{info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::reader::{Chunks, stream_query};
use crate::core::record::chunk_line;
use crate::core::table::TableName;
use crate::core::writer::ChunkWriter;

pub const DEFAULT_DUMP_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_DUMP_LIMIT: u64 = 10_000;
pub const DEFAULT_PAGE_CHUNK_SIZE: u64 = 100;
pub const PAGE_CHUNK_NUMBER: u64 = 1;
pub const INVALID_PAGE_MESSAGE: &str = "Page and chunk_size must be greater than 0";
pub const NO_MORE_DATA_MESSAGE: &str = "No more data available";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DumpOptions {
    pub chunk_size: usize,
    /// Upper bound on rows read by a full dump; `None` reads the whole table.
    pub limit: Option<u64>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_DUMP_CHUNK_SIZE,
            limit: Some(DEFAULT_DUMP_LIMIT),
        }
    }
}

/// Prepares the full-dump statement. Pass it to [`dump_lines`].
pub fn prepare_dump<'conn>(
    conn: &'conn Connection,
    table: &TableName,
) -> Result<Statement<'conn>, Error> {
    let sql = format!("SELECT * FROM {} LIMIT ?1", table.quoted());
    conn.prepare(&sql)
        .map_err(|err| Error::store("failed to prepare dump query", err))
}

/// Starts a full dump over a statement from [`prepare_dump`].
pub fn dump_lines<'stmt, 'w>(
    stmt: &'stmt mut Statement<'_>,
    options: DumpOptions,
    writer: &'w ChunkWriter,
) -> Result<DumpLines<'stmt, 'w>, Error> {
    // SQLite treats a negative LIMIT as unbounded.
    let limit = match options.limit {
        Some(limit) => i64::try_from(limit).map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("dump limit exceeds supported range")
        })?,
        None => -1,
    };
    let chunks = stream_query(stmt, [limit], options.chunk_size)?;
    Ok(DumpLines {
        chunks,
        writer,
        limit: options.limit,
        next_chunk: 1,
        finished: false,
    })
}

/// Lazy sequence of full-dump lines; each item is one persisted chunk.
pub struct DumpLines<'stmt, 'w> {
    chunks: Chunks<'stmt>,
    writer: &'w ChunkWriter,
    limit: Option<u64>,
    next_chunk: u64,
    finished: bool,
}

impl DumpLines<'_, '_> {
    pub fn chunks_emitted(&self) -> u64 {
        self.next_chunk - 1
    }

    pub fn rows_emitted(&self) -> u64 {
        self.chunks.rows_read()
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let rows = self.rows_emitted();
        info!(chunks = self.chunks_emitted(), rows, "dump complete");
        if self.limit == Some(rows) {
            warn!(
                limit = rows,
                "dump reached the configured row limit; remaining rows were not exported"
            );
        }
    }
}

impl Iterator for DumpLines<'_, '_> {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let chunk = match self.chunks.next() {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                self.finished = true;
                return Some(Err(err));
            }
            None => {
                self.finish();
                return None;
            }
        };
        let chunk_number = self.next_chunk;
        let line = self
            .writer
            .persist(&chunk, chunk_number)
            .and_then(|_| chunk_line(&chunk));
        if line.is_err() {
            self.finished = true;
        }
        self.next_chunk += 1;
        Some(line)
    }
}

/// Validates a page request before any query runs.
pub fn validate_page(page: u64, chunk_size: u64) -> Result<u64, Error> {
    if page < 1 || chunk_size < 1 {
        return Err(Error::new(ErrorKind::Usage).with_message(INVALID_PAGE_MESSAGE));
    }
    (page - 1)
        .checked_mul(chunk_size)
        .filter(|offset| i64::try_from(*offset).is_ok() && i64::try_from(chunk_size).is_ok())
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("page offset is out of range"))
}

/// Exports one page as a single line.
///
/// A non-empty page is persisted as `part_1.json` on every call, replacing
/// whatever page was written last. An empty page yields the "no more data"
/// status object and writes nothing.
pub fn export_page(
    conn: &Connection,
    table: &TableName,
    page: u64,
    chunk_size: u64,
    writer: &ChunkWriter,
) -> Result<String, Error> {
    let offset = validate_page(page, chunk_size)?;
    let sql = format!("SELECT * FROM {} LIMIT ?1 OFFSET ?2", table.quoted());
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| Error::store("failed to prepare page query", err))?;
    let page_len = usize::try_from(chunk_size)
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("chunk_size is out of range"))?;
    let params = [chunk_size as i64, offset as i64];

    let mut chunks = stream_query(&mut stmt, params, page_len)?;
    let Some(chunk) = chunks.next().transpose()? else {
        info!(page, chunk_size, "page is past the end of the table");
        let mut line = json!({ "message": NO_MORE_DATA_MESSAGE }).to_string();
        line.push('\n');
        return Ok(line);
    };
    writer.persist(&chunk, PAGE_CHUNK_NUMBER)?;
    chunk_line(&chunk)
}

pub fn count_records(conn: &Connection, table: &TableName) -> Result<u64, Error> {
    let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|err| Error::store("failed to count records", err))?;
    u64::try_from(count)
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("negative record count"))
}
