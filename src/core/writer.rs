// Durable per-chunk JSON files named part_<n>.json.
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;

/// Persists chunks into one output directory.
///
/// Files are pretty-printed with four-space indentation and raw UTF-8, and an
/// existing file with the same number is overwritten.
#[derive(Clone, Debug)]
pub struct ChunkWriter {
    output_dir: PathBuf,
}

impl ChunkWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn chunk_path(&self, chunk_number: u64) -> PathBuf {
        self.output_dir.join(format!("part_{chunk_number}.json"))
    }

    pub fn persist(&self, chunk: &[Record], chunk_number: u64) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.output_dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create chunk directory")
                .with_path(&self.output_dir)
                .with_source(err)
        })?;

        let path = self.chunk_path(chunk_number);
        let bytes = encode_pretty(chunk).map_err(|err| err.with_path(&path))?;
        std::fs::write(&path, bytes).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write chunk file")
                .with_path(&path)
                .with_source(err)
        })?;

        let full_path = std::path::absolute(&path).unwrap_or_else(|_| path.clone());
        info!(
            chunk = chunk_number,
            records = chunk.len(),
            path = %full_path.display(),
            "saved chunk"
        );
        Ok(path)
    }
}

fn encode_pretty(chunk: &[Record]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    chunk.serialize(&mut serializer).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to encode chunk file")
            .with_source(err)
    })?;
    Ok(out)
}
